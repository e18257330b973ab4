//! X/Twitter API v2 collector: recent original posts from a list of accounts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Deserialize;

use crate::ingest::types::{RawItem, SourceKind, SourceProvider};

const API_BASE: &str = "https://api.twitter.com/2";
const TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub data: Vec<Tweet>,
    #[serde(default)]
    pub meta: Option<TimelineMeta>,
}

#[derive(Debug, Deserialize)]
pub struct Tweet {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineMeta {
    pub newest_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserLookup {
    data: Option<UserData>,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
}

/// Map one timeline page into raw items. Pure; used by tests with fixtures.
pub fn parse_timeline(username: &str, timeline: &Timeline, fetched_at: DateTime<Utc>) -> Vec<RawItem> {
    timeline
        .data
        .iter()
        .filter(|t| !t.text.trim().is_empty())
        .map(|t| {
            let body = crate::ingest::normalize_text(&t.text);
            let mut title: String = body.chars().take(TITLE_CHARS).collect();
            if body.chars().count() > TITLE_CHARS {
                title.push_str("...");
            }
            RawItem {
                source_kind: SourceKind::Twitter,
                source_id: format!("@{username}"),
                external_id: Some(t.id.clone()),
                url: format!("https://x.com/{username}/status/{}", t.id),
                title,
                body,
                published_at: t
                    .created_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|d| d.with_timezone(&Utc)),
                fetched_at,
            }
        })
        .collect()
}

pub struct TwitterProvider {
    client: reqwest::Client,
    bearer_token: String,
    accounts: Vec<String>,
    api_base: String,
    user_ids: Mutex<HashMap<String, String>>,
    since_ids: Mutex<HashMap<String, String>>,
}

impl TwitterProvider {
    pub fn new(client: reqwest::Client, bearer_token: String, accounts: Vec<String>) -> Self {
        Self {
            client,
            bearer_token,
            accounts,
            api_base: API_BASE.to_string(),
            user_ids: Mutex::new(HashMap::new()),
            since_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.bearer_token.is_empty() && !self.accounts.is_empty()
    }

    async fn resolve_user_id(&self, username: &str) -> Result<Option<String>> {
        if let Some(id) = self
            .user_ids
            .lock()
            .expect("twitter user cache poisoned")
            .get(username)
        {
            return Ok(Some(id.clone()));
        }

        let url = format!("{}/users/by/username/{username}", self.api_base);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .context("twitter user lookup")?;
        if resp.status().as_u16() == 429 {
            tracing::warn!(username, "twitter rate limit on user lookup");
            return Ok(None);
        }
        if !resp.status().is_success() {
            tracing::warn!(username, status = %resp.status(), "twitter user lookup failed");
            return Ok(None);
        }
        let lookup: UserLookup = resp.json().await.context("twitter user lookup json")?;
        let Some(user) = lookup.data else {
            return Ok(None);
        };
        self.user_ids
            .lock()
            .expect("twitter user cache poisoned")
            .insert(username.to_string(), user.id.clone());
        Ok(Some(user.id))
    }

    async fn fetch_user(&self, username: &str) -> Result<Vec<RawItem>> {
        let Some(user_id) = self.resolve_user_id(username).await? else {
            return Ok(Vec::new());
        };

        let mut query: Vec<(&str, String)> = vec![
            ("max_results", "10".to_string()),
            ("tweet.fields", "created_at,text".to_string()),
            ("exclude", "retweets".to_string()),
        ];
        let since = self
            .since_ids
            .lock()
            .expect("twitter since cache poisoned")
            .get(username)
            .cloned();
        if let Some(since) = since {
            query.push(("since_id", since));
        }

        let url = format!("{}/users/{user_id}/tweets", self.api_base);
        let fetched_at = Utc::now();
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .query(&query)
            .send()
            .await
            .context("twitter timeline")?;

        if resp.status().as_u16() == 429 {
            let reset = resp
                .headers()
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?")
                .to_string();
            tracing::warn!(username, reset = %reset, "twitter rate limit");
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            anyhow::bail!("twitter timeline for {username} returned {}", resp.status());
        }

        let timeline: Timeline = resp.json().await.context("twitter timeline json")?;
        if let Some(newest) = timeline.meta.as_ref().and_then(|m| m.newest_id.clone()) {
            self.since_ids
                .lock()
                .expect("twitter since cache poisoned")
                .insert(username.to_string(), newest);
        }
        Ok(parse_timeline(username, &timeline, fetched_at))
    }
}

#[async_trait]
impl SourceProvider for TwitterProvider {
    async fn fetch_latest(&self) -> Result<Vec<RawItem>> {
        if !self.is_configured() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        // Sequential with a courtesy delay; the API is strict about bursts.
        for username in &self.accounts {
            match self.fetch_user(username).await {
                Ok(mut v) => out.append(&mut v),
                Err(e) => {
                    tracing::warn!(error = ?e, username = %username, "twitter fetch failed");
                    counter!("ingest_provider_errors_total", "kind" => "twitter").increment(1);
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        counter!("ingest_events_total", "kind" => "twitter").increment(out.len() as u64);
        Ok(out)
    }

    fn name(&self) -> &str {
        "twitter"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Twitter
    }
}
