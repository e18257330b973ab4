// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Twitter,
    Facebook,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::Twitter => "twitter",
            SourceKind::Facebook => "facebook",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested unit before deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub source_kind: SourceKind,
    pub source_id: String,           // feed name, "@account" or page id
    pub external_id: Option<String>, // RSS guid, tweet id, post id
    pub url: String,                 // may be empty
    pub title: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>, // as reported by the source, unreliable
    pub fetched_at: DateTime<Utc>,           // local poll time, always set
}

#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    async fn fetch_latest(&self) -> Result<Vec<RawItem>>;
    fn name(&self) -> &str;
    fn kind(&self) -> SourceKind;
}
