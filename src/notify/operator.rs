//! Operator channel: explicit reports for dropped and failed work.
//!
//! Duplicate suppression never goes through here; it is silent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::dedup::Category;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorEvent {
    BudgetExhausted {
        batch_id: u64,
        category: Category,
        items: usize,
        spent_usd: f64,
        ceiling_usd: f64,
    },
    QueueTimeout {
        batch_id: u64,
        category: Category,
        items: usize,
        waited_secs: i64,
    },
    QueueFull {
        batch_id: u64,
        category: Category,
        items: usize,
    },
    Unroutable {
        batch_id: u64,
        category: Category,
        items: usize,
    },
    SummarizerFailed {
        batch_id: u64,
        category: Category,
        items: usize,
        error: String,
    },
    DeliveryFailed {
        batch_id: u64,
        category: Category,
        items: usize,
        parts_sent: usize,
        parts_total: usize,
        error: String,
    },
    ShutdownDiscarded {
        batches: usize,
        items: usize,
    },
}

impl OperatorEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorEvent::BudgetExhausted { .. } => "budget_exhausted",
            OperatorEvent::QueueTimeout { .. } => "queue_timeout",
            OperatorEvent::QueueFull { .. } => "queue_full",
            OperatorEvent::Unroutable { .. } => "unroutable",
            OperatorEvent::SummarizerFailed { .. } => "summarizer_failed",
            OperatorEvent::DeliveryFailed { .. } => "delivery_failed",
            OperatorEvent::ShutdownDiscarded { .. } => "shutdown_discarded",
        }
    }

    /// One-line human description.
    pub fn summary(&self) -> String {
        match self {
            OperatorEvent::BudgetExhausted {
                batch_id,
                category,
                items,
                spent_usd,
                ceiling_usd,
            } => format!(
                "batch {batch_id} ({category}, {items} items) dropped: daily budget exhausted (${spent_usd:.4} of ${ceiling_usd:.2})"
            ),
            OperatorEvent::QueueTimeout {
                batch_id,
                category,
                items,
                waited_secs,
            } => format!(
                "batch {batch_id} ({category}, {items} items) dropped after {waited_secs}s in the rate-limit queue"
            ),
            OperatorEvent::QueueFull {
                batch_id,
                category,
                items,
            } => format!("batch {batch_id} ({category}, {items} items) dropped: queue full"),
            OperatorEvent::Unroutable {
                batch_id,
                category,
                items,
            } => format!(
                "batch {batch_id} ({category}, {items} items) dropped: no delivery route for category"
            ),
            OperatorEvent::SummarizerFailed {
                batch_id,
                category,
                items,
                error,
            } => format!("batch {batch_id} ({category}, {items} items) not summarized: {error}"),
            OperatorEvent::DeliveryFailed {
                batch_id,
                category,
                parts_sent,
                parts_total,
                error,
                ..
            } => format!(
                "batch {batch_id} ({category}) delivery failed after {parts_sent}/{parts_total} parts: {error}"
            ),
            OperatorEvent::ShutdownDiscarded { batches, items } => {
                format!("shutdown discarded {batches} queued batches ({items} items)")
            }
        }
    }
}

#[async_trait]
pub trait OperatorSink: Send + Sync {
    /// Sinks handle their own failures; reporting never fails the pipeline.
    async fn notify(&self, event: &OperatorEvent);
}

pub type SharedOperatorSink = Arc<dyn OperatorSink>;

/// Writes every event as a structured `warn` under the `operator` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl OperatorSink for LogSink {
    async fn notify(&self, event: &OperatorEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        tracing::warn!(
            target: "operator",
            kind = event.kind(),
            event = %payload,
            "{}",
            event.summary()
        );
    }
}

/// Fan-out to several sinks, in order.
#[derive(Default, Clone)]
pub struct OperatorMux {
    sinks: Vec<SharedOperatorSink>,
}

impl OperatorMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedOperatorSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl OperatorSink for OperatorMux {
    async fn notify(&self, event: &OperatorEvent) {
        for s in &self.sinks {
            s.notify(event).await;
        }
    }
}
