//! SQLite-backed Fingerprint Store.
//!
//! All statements run on tokio-rusqlite's single background thread, so a purge
//! never interleaves with a lookup or an insert.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, ErrorCode, OptionalExtension};

use crate::dedup::categorize::Category;
use crate::dedup::fingerprint::Fingerprint;
use crate::dedup::store::{FingerprintStore, SeenRecord, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS seen_fingerprints (
    fingerprint   TEXT PRIMARY KEY NOT NULL,
    first_seen_at INTEGER NOT NULL,
    category      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_seen_first_seen_at ON seen_fingerprints(first_seen_at);
";

fn classify(e: &rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase) =>
        {
            StoreError::Corrupted(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> StoreError {
    match e {
        tokio_rusqlite::Error::Error(inner) => classify(&inner),
        other => StoreError::Unavailable(other.to_string()),
    }
}

pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, enable WAL and verify integrity.
    ///
    /// A failed `quick_check` yields `StoreError::Corrupted`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open(path.as_ref())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    /// Non-durable variant used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        let check = self
            .conn
            .call(|conn| -> Result<String, rusqlite::Error> {
                let mode: String =
                    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
                tracing::debug!(journal_mode = %mode, "fingerprint store opened");
                conn.pragma_update(None, "synchronous", "NORMAL")?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
                if check == "ok" {
                    conn.execute_batch(SCHEMA)?;
                }
                Ok(check)
            })
            .await
            .map_err(map_tr_err)?;

        if check != "ok" {
            return Err(StoreError::Corrupted(format!("quick_check: {check}")));
        }
        Ok(())
    }
}

fn row_to_record(fp: String, ms: i64, category: String) -> Result<SeenRecord, StoreError> {
    let first_seen_at = DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupted(format!("bad timestamp {ms} for {fp}")))?;
    let category = category
        .parse::<Category>()
        .map_err(|e| StoreError::Corrupted(e.to_string()))?;
    Ok(SeenRecord {
        fingerprint: Fingerprint::from_hex(fp),
        first_seen_at,
        category,
    })
}

#[async_trait]
impl FingerprintStore for SqliteStore {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, StoreError> {
        let key = fp.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<bool, rusqlite::Error> {
                let hit: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM seen_fingerprints WHERE fingerprint = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(hit.is_some())
            })
            .await
            .map_err(map_tr_err)
    }

    async fn record(
        &self,
        fp: &Fingerprint,
        category: Category,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = fp.as_str().to_string();
        let ms = at.timestamp_millis();
        let changed = self
            .conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    "INSERT OR IGNORE INTO seen_fingerprints (fingerprint, first_seen_at, category)
                     VALUES (?1, ?2, ?3)",
                    params![key, ms, category.as_str()],
                )
            })
            .await
            .map_err(map_tr_err)?;
        if changed == 0 {
            return Err(StoreError::AlreadyExists);
        }
        Ok(())
    }

    async fn get(&self, fp: &Fingerprint) -> Result<Option<SeenRecord>, StoreError> {
        let key = fp.as_str().to_string();
        let row = self
            .conn
            .call(move |conn| -> Result<Option<(String, i64, String)>, rusqlite::Error> {
                conn.query_row(
                    "SELECT fingerprint, first_seen_at, category FROM seen_fingerprints
                     WHERE fingerprint = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .await
            .map_err(map_tr_err)?;
        row.map(|(fp, ms, cat)| row_to_record(fp, ms, cat)).transpose()
    }

    async fn len(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| -> Result<i64, rusqlite::Error> {
                conn.query_row("SELECT COUNT(*) FROM seen_fingerprints", [], |row| row.get(0))
            })
            .await
            .map(|n| n.max(0) as u64)
            .map_err(map_tr_err)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let ms = cutoff.timestamp_millis();
        self.conn
            .call(move |conn| -> Result<usize, rusqlite::Error> {
                conn.execute(
                    "DELETE FROM seen_fingerprints WHERE first_seen_at < ?1",
                    params![ms],
                )
            })
            .await
            .map(|n| n as u64)
            .map_err(map_tr_err)
    }
}
