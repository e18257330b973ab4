// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ingest::types::{RawItem, SourceProvider};

/// Spawn a task that polls `provider` every `interval` and pushes its items into `tx`.
///
/// The task ends when `shutdown` flips to `true` or the receiving side is gone.
/// A failing poll is logged and counted; the next tick tries again.
pub fn spawn_poller(
    provider: Arc<dyn SourceProvider>,
    interval: Duration,
    tx: mpsc::Sender<RawItem>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let items = match provider.fetch_latest().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = ?e, provider = provider.name(), "poll failed");
                    counter!("ingest_provider_errors_total", "kind" => provider.kind().as_str())
                        .increment(1);
                    continue;
                }
            };

            let n = items.len();
            for item in items {
                // Backpressure: waits while the dedup stage is behind.
                if tx.send(item).await.is_err() {
                    tracing::debug!(provider = provider.name(), "raw channel closed, poller exiting");
                    return;
                }
            }

            counter!("ingest_runs_total", "kind" => provider.kind().as_str()).increment(1);
            gauge!("ingest_pipeline_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);
            tracing::info!(target: "ingest", provider = provider.name(), items = n, "poll tick");
        }
        tracing::debug!(provider = provider.name(), "poller stopped");
    })
}
