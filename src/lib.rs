// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod app;
pub mod batch;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod summarize;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::batch::{Batch, TopicalBatcher};
pub use crate::dedup::{Category, DedupOutcome, Deduplicator, TaggedItem};
pub use crate::dispatch::{DispatchError, DispatchOutcome, Dispatcher, DispatcherConfig};
pub use crate::pipeline::{run_cycle, CycleReport, PipelineHandle};
