//! Fingerprint Store: the durable set of stories already seen.
//!
//! `record` is an atomic insert-if-absent and is the only concurrency control the
//! dedup path relies on. Implementations must never report a recorded
//! fingerprint as absent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dedup::categorize::Category;
use crate::dedup::fingerprint::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeenRecord {
    pub fingerprint: Fingerprint,
    pub first_seen_at: DateTime<Utc>,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Another writer recorded this fingerprint first.
    #[error("fingerprint already recorded")]
    AlreadyExists,
    /// Transient; the caller retries the whole item later.
    #[error("fingerprint store unavailable: {0}")]
    Unavailable(String),
    /// Unrecoverable; the pipeline stops.
    #[error("fingerprint store corrupted: {0}")]
    Corrupted(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, StoreError>;

    /// Insert if absent. `Err(AlreadyExists)` when the fingerprint is present;
    /// the existing record is left untouched.
    async fn record(
        &self,
        fp: &Fingerprint,
        category: Category,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, fp: &Fingerprint) -> Result<Option<SeenRecord>, StoreError>;

    async fn len(&self) -> Result<u64, StoreError>;

    /// Delete records first seen strictly before `cutoff`. Returns how many went.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

pub type SharedStore = Arc<dyn FingerprintStore>;

/// In-process store for tests and one-shot runs. Not durable.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<Fingerprint, SeenRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryStore {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("memory store poisoned")
            .contains_key(fp))
    }

    async fn record(
        &self,
        fp: &Fingerprint,
        category: Category,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut g = self.inner.lock().expect("memory store poisoned");
        if g.contains_key(fp) {
            return Err(StoreError::AlreadyExists);
        }
        g.insert(
            fp.clone(),
            SeenRecord {
                fingerprint: fp.clone(),
                first_seen_at: at,
                category,
            },
        );
        Ok(())
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Option<SeenRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .expect("memory store poisoned")
            .get(fp)
            .cloned())
    }

    async fn len(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().expect("memory store poisoned").len() as u64)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut g = self.inner.lock().expect("memory store poisoned");
        let before = g.len();
        g.retain(|_, r| r.first_seen_at >= cutoff);
        Ok((before - g.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::from_hex(s)
    }

    #[tokio::test]
    async fn record_is_insert_if_absent() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        assert!(!store.exists(&fp("a")).await.unwrap());
        store.record(&fp("a"), Category::Macro, t0).await.unwrap();
        assert!(store.exists(&fp("a")).await.unwrap());

        let again = store
            .record(&fp("a"), Category::Crypto, t0 + Duration::hours(1))
            .await;
        assert_eq!(again, Err(StoreError::AlreadyExists));

        // Never overwritten.
        let rec = store.get(&fp("a")).await.unwrap().unwrap();
        assert_eq!(rec.category, Category::Macro);
        assert_eq!(rec.first_seen_at, t0);
    }

    #[tokio::test]
    async fn purge_removes_only_older_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .record(&fp("old"), Category::Macro, now - Duration::days(40))
            .await
            .unwrap();
        store.record(&fp("new"), Category::Macro, now).await.unwrap();

        let removed = store.purge_older_than(now - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.exists(&fp("new")).await.unwrap());
    }
}
