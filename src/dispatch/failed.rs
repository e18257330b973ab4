use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dedup::{Category, Fingerprint};

/// A batch whose digest was produced but could not be delivered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedDelivery {
    pub batch_id: u64,
    pub category: Category,
    pub fingerprints: Vec<Fingerprint>,
    /// Rendered message, so an operator can forward it by hand.
    pub message: String,
    pub parts_sent: usize,
    pub parts_total: usize,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded, oldest-evicted record of failed deliveries.
#[derive(Debug, Clone)]
pub struct FailedLog {
    capacity: usize,
    entries: VecDeque<FailedDelivery>,
    evicted: u64,
}

impl Default for FailedLog {
    fn default() -> Self {
        Self::new(200)
    }
}

impl FailedLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            evicted: 0,
        }
    }

    pub fn push(&mut self, entry: FailedDelivery) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<FailedDelivery> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}
