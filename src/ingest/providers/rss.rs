use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{RawItem, SourceKind, SourceProvider};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Guid>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}
#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

fn parse_pub_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if let Ok(dt) = OffsetDateTime::parse(ts, &Rfc2822) {
        return DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), 0);
    }
    // Some feeds put RFC 3339 dates in pubDate.
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct RssProvider {
    name: String,
    mode: Mode,
}

enum Mode {
    // Owned copy so tests can pass any &str.
    Fixture(String),
    Http {
        url: String,
        client: reqwest::Client,
    },
}

impl RssProvider {
    pub fn from_fixture(name: impl Into<String>, xml: &str) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(name: impl Into<String>, url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            mode: Mode::Http {
                url: url.into(),
                client,
            },
        }
    }

    pub fn parse_items_from_str(&self, s: &str, fetched_at: DateTime<Utc>) -> Result<Vec<RawItem>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean)
            .with_context(|| format!("parsing rss xml for feed {}", self.name))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let title = crate::ingest::normalize_text(it.title.as_deref().unwrap_or_default());
            if title.is_empty() {
                continue;
            }
            let body = crate::ingest::normalize_text(it.description.as_deref().unwrap_or_default());
            let external_id = it
                .guid
                .map(|g| g.value.trim().to_string())
                .filter(|g| !g.is_empty());

            out.push(RawItem {
                source_kind: SourceKind::Rss,
                source_id: self.name.clone(),
                external_id,
                url: it.link.map(|l| l.trim().to_string()).unwrap_or_default(),
                title,
                body,
                published_at: it.pub_date.as_deref().and_then(parse_pub_date),
                fetched_at,
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        counter!("ingest_events_total", "kind" => "rss").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl SourceProvider for RssProvider {
    async fn fetch_latest(&self) -> Result<Vec<RawItem>> {
        let fetched_at = Utc::now();
        match &self.mode {
            Mode::Fixture(s) => self.parse_items_from_str(s, fetched_at),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url.as_str())
                    .send()
                    .await
                    .with_context(|| format!("rss http get {url}"))?;
                if !resp.status().is_success() {
                    anyhow::bail!("feed {} returned status {}", self.name, resp.status());
                }
                let body = resp.text().await.context("rss http .text()")?;
                self.parse_items_from_str(&body, fetched_at)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
