//! Topical batcher: groups deduplicated items per category.
//!
//! Single owner. A batch is sealed when it reaches `max_batch_size` (on `offer`)
//! or when it is at least `max_wait` old (on `tick`). Sealed batches are moved
//! out; the batcher keeps no reference to them.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::Serialize;

use crate::dedup::{Category, TaggedItem};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("batch_sealed_total", "Batches sealed, by reason.");
        describe_histogram!("batch_size", "Items per sealed batch.");
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: u64,
    pub category: Category,
    pub items: Vec<TaggedItem>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
struct OpenBatch {
    id: u64,
    created_at: DateTime<Utc>,
    items: Vec<TaggedItem>,
}

#[derive(Debug, Clone, Copy)]
enum SealReason {
    Full,
    Aged,
    Drain,
}

impl SealReason {
    fn as_str(self) -> &'static str {
        match self {
            SealReason::Full => "full",
            SealReason::Aged => "aged",
            SealReason::Drain => "drain",
        }
    }
}

#[derive(Debug)]
pub struct TopicalBatcher {
    max_batch_size: usize,
    max_wait: Duration,
    open: BTreeMap<Category, OpenBatch>,
    next_id: u64,
}

impl TopicalBatcher {
    /// `max_batch_size` below 1 is treated as 1.
    pub fn new(max_batch_size: usize, max_wait: Duration) -> Self {
        ensure_metrics_described();
        Self {
            max_batch_size: max_batch_size.max(1),
            max_wait,
            open: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Append `item` to its category's open batch. Returns the batch if it just filled up.
    pub fn offer(&mut self, item: TaggedItem, now: DateTime<Utc>) -> Option<Batch> {
        let category = item.category;
        let next_id = &mut self.next_id;
        let open = self.open.entry(category).or_insert_with(|| {
            let id = *next_id;
            *next_id += 1;
            OpenBatch {
                id,
                created_at: now,
                items: Vec::new(),
            }
        });
        open.items.push(item);

        if open.items.len() >= self.max_batch_size {
            let open = self.open.remove(&category)?;
            return Some(seal(category, open, SealReason::Full));
        }
        None
    }

    /// Seal every open batch whose age is at least `max_wait`, oldest first.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let due: Vec<Category> = self
            .open
            .iter()
            .filter(|(_, b)| now - b.created_at >= self.max_wait)
            .map(|(c, _)| *c)
            .collect();
        self.take(due, SealReason::Aged)
    }

    /// Seal everything that is open, oldest first.
    pub fn drain(&mut self, _now: DateTime<Utc>) -> Vec<Batch> {
        let all: Vec<Category> = self.open.keys().copied().collect();
        self.take(all, SealReason::Drain)
    }

    /// Earliest instant at which `tick` would seal something.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.open
            .values()
            .map(|b| b.created_at + self.max_wait)
            .min()
    }

    pub fn open_batches(&self) -> usize {
        self.open.len()
    }

    pub fn pending_items(&self) -> usize {
        self.open.values().map(|b| b.items.len()).sum()
    }

    fn take(&mut self, categories: Vec<Category>, reason: SealReason) -> Vec<Batch> {
        let mut out: Vec<Batch> = categories
            .into_iter()
            .filter_map(|c| self.open.remove(&c).map(|b| seal(c, b, reason)))
            .collect();
        // Creation order, so per-category delivery order follows batch ids.
        out.sort_by_key(|b| b.id);
        out
    }
}

fn seal(category: Category, open: OpenBatch, reason: SealReason) -> Batch {
    let mut items = open.items;
    // Stable: equal fetched_at keeps arrival order. published_at is not trusted.
    items.sort_by_key(|t| t.item.fetched_at);

    counter!("batch_sealed_total", "reason" => reason.as_str()).increment(1);
    histogram!("batch_size").record(items.len() as f64);
    tracing::debug!(
        batch_id = open.id,
        category = %category,
        items = items.len(),
        reason = reason.as_str(),
        "batch sealed"
    );

    Batch {
        id: open.id,
        category,
        items,
        created_at: open.created_at,
    }
}
