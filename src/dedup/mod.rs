//! Deduplication: fingerprinting, categorization and the seen-store gate.

pub mod categorize;
pub mod fingerprint;
pub mod sqlite;
pub mod store;

use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::Serialize;

pub use categorize::{categorize, Category};
pub use fingerprint::Fingerprint;
pub use store::{FingerprintStore, MemoryStore, SeenRecord, SharedStore, StoreError};
pub use sqlite::SqliteStore;

use crate::ingest::collapse_whitespace;
use crate::ingest::types::RawItem;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "dedup_items_total",
            "Items seen by the deduplicator, by outcome."
        );
        describe_counter!(
            "dedup_store_errors_total",
            "Fingerprint store failures, by kind."
        );
    });
}

/// A deduplicated item with its identity and topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedItem {
    pub item: RawItem,
    pub fingerprint: Fingerprint,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// New story; it is now recorded as seen.
    Accepted(TaggedItem),
    /// Already recorded, or a concurrent writer won the race. Silent.
    Duplicate,
    /// No external id, no text and no url.
    Unidentifiable,
}

/// Clean up an item before hashing and batching. Display text keeps its case.
pub fn normalize(mut item: RawItem) -> RawItem {
    item.title = collapse_whitespace(&item.title);
    item.body = collapse_whitespace(&item.body);
    item.url = fingerprint::strip_tracking(&item.url);
    item
}

/// Gate between collectors and the batcher. Cheap to clone; clones share the store.
#[derive(Clone)]
pub struct Deduplicator {
    store: SharedStore,
}

impl Deduplicator {
    pub fn new(store: SharedStore) -> Self {
        ensure_metrics_described();
        Self { store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Decide whether `item` is a new story.
    ///
    /// Only a successful `record` forwards the item. Any store failure other than
    /// `AlreadyExists` is returned as-is: the item was neither recorded nor
    /// forwarded and the caller should retry it.
    pub async fn process(&self, item: RawItem) -> Result<DedupOutcome, StoreError> {
        let item = normalize(item);
        let Some((fp, basis)) = fingerprint::compute(&item) else {
            counter!("dedup_items_total", "outcome" => "unidentifiable").increment(1);
            tracing::debug!(source = %item.source_id, "item has no identity, dropped");
            return Ok(DedupOutcome::Unidentifiable);
        };

        match self.store.exists(&fp).await {
            Ok(true) => {
                counter!("dedup_items_total", "outcome" => "duplicate").increment(1);
                return Ok(DedupOutcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) => {
                counter!("dedup_store_errors_total", "op" => "exists").increment(1);
                return Err(e);
            }
        }

        let category = categorize(&item);
        match self.store.record(&fp, category, item.fetched_at).await {
            Ok(()) => {
                counter!("dedup_items_total", "outcome" => "accepted").increment(1);
                tracing::debug!(
                    fingerprint = %fp,
                    basis = basis.as_str(),
                    category = %category,
                    "item accepted"
                );
                Ok(DedupOutcome::Accepted(TaggedItem {
                    item,
                    fingerprint: fp,
                    category,
                }))
            }
            Err(StoreError::AlreadyExists) => {
                counter!("dedup_items_total", "outcome" => "race").increment(1);
                Ok(DedupOutcome::Duplicate)
            }
            Err(e) => {
                counter!("dedup_store_errors_total", "op" => "record").increment(1);
                Err(e)
            }
        }
    }
}
