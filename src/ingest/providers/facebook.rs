//! Facebook Graph API collector: recent posts from public pages.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;

use crate::ingest::types::{RawItem, SourceKind, SourceProvider};

const API_BASE: &str = "https://graph.facebook.com/v19.0";
const TITLE_CHARS: usize = 120;

#[derive(Debug, Deserialize)]
pub struct PostsPage {
    #[serde(default)]
    pub data: Vec<Post>,
}

#[derive(Debug, Deserialize)]
pub struct Post {
    pub id: String,
    pub message: Option<String>,
    pub created_time: Option<String>,
    pub permalink_url: Option<String>,
}

/// Graph API timestamps look like `2025-09-14T12:15:00+0000`.
fn parse_created_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Map one posts page into raw items. Posts without a message are skipped.
pub fn parse_posts(page_id: &str, page: &PostsPage, fetched_at: DateTime<Utc>) -> Vec<RawItem> {
    page.data
        .iter()
        .filter_map(|p| {
            let message = p.message.as_deref().map(crate::ingest::normalize_text)?;
            if message.is_empty() {
                return None;
            }
            let mut title: String = message.chars().take(TITLE_CHARS).collect();
            if message.chars().count() > TITLE_CHARS {
                title.push_str("...");
            }
            Some(RawItem {
                source_kind: SourceKind::Facebook,
                source_id: page_id.to_string(),
                external_id: Some(p.id.clone()),
                url: p
                    .permalink_url
                    .clone()
                    .unwrap_or_else(|| format!("https://facebook.com/{}", p.id)),
                title,
                body: message,
                published_at: p.created_time.as_deref().and_then(parse_created_time),
                fetched_at,
            })
        })
        .collect()
}

pub struct FacebookProvider {
    client: reqwest::Client,
    access_token: String,
    page_ids: Vec<String>,
    api_base: String,
    since: Mutex<HashMap<String, String>>,
}

impl FacebookProvider {
    pub fn new(client: reqwest::Client, access_token: String, page_ids: Vec<String>) -> Self {
        Self {
            client,
            access_token,
            page_ids: page_ids
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            api_base: API_BASE.to_string(),
            since: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.access_token.is_empty() && !self.page_ids.is_empty()
    }

    async fn fetch_page(&self, page_id: &str) -> Result<Vec<RawItem>> {
        let mut query: Vec<(&str, String)> = vec![
            ("fields", "message,created_time,permalink_url".to_string()),
            ("limit", "10".to_string()),
            ("access_token", self.access_token.clone()),
        ];
        let since = self
            .since
            .lock()
            .expect("facebook since cache poisoned")
            .get(page_id)
            .cloned();
        if let Some(since) = since {
            query.push(("since", since));
        }

        let url = format!("{}/{page_id}/posts", self.api_base);
        let fetched_at = Utc::now();
        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .context("facebook posts")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("facebook page {page_id} returned {status}: {body}");
        }

        let page: PostsPage = resp.json().await.context("facebook posts json")?;
        if let Some(newest) = page.data.first().and_then(|p| p.created_time.clone()) {
            self.since
                .lock()
                .expect("facebook since cache poisoned")
                .insert(page_id.to_string(), newest);
        }
        Ok(parse_posts(page_id, &page, fetched_at))
    }
}

#[async_trait]
impl SourceProvider for FacebookProvider {
    async fn fetch_latest(&self) -> Result<Vec<RawItem>> {
        if !self.is_configured() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for page_id in &self.page_ids {
            match self.fetch_page(page_id).await {
                Ok(mut v) => out.append(&mut v),
                Err(e) => {
                    tracing::warn!(error = ?e, page_id = %page_id, "facebook fetch failed");
                    counter!("ingest_provider_errors_total", "kind" => "facebook").increment(1);
                }
            }
        }
        counter!("ingest_events_total", "kind" => "facebook").increment(out.len() as u64);
        Ok(out)
    }

    fn name(&self) -> &str {
        "facebook"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Facebook
    }
}
