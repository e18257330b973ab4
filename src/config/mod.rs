//! Application configuration.
//!
//! Resolution order: `$DIGEST_CONFIG_PATH`, then `config/digest.toml`, then
//! built-in defaults. Every section is `#[serde(default)]`, so a file only
//! needs the keys it changes. Secrets written as `"ENV"` are read from the
//! environment after parsing.

pub mod ai;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::dedup::Category;
use crate::dispatch::DispatcherConfig;

pub use ai::AiConfig;

const ENV_PATH: &str = "DIGEST_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/digest.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ingest: IngestConfig,
    pub dedup: DedupConfig,
    pub batch: BatchConfig,
    pub dispatch: DispatchConfig,
    pub telegram: TelegramConfig,
    pub ai: AiConfig,
    pub operator: OperatorConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub feeds: Vec<FeedConfig>,
    pub rss_poll_secs: u64,
    pub twitter: TwitterConfig,
    pub facebook: FacebookConfig,
    /// Capacity of the collector -> dedup channel.
    pub channel_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let feed = |name: &str, url: &str| FeedConfig {
            name: name.to_string(),
            url: url.to_string(),
        };
        Self {
            feeds: vec![
                feed("CNBC - Top News", "https://search.cnbc.com/rs/search/combinedcms/view.xml?partnerId=wrss01&id=100003114"),
                feed("MarketWatch - Top", "https://www.marketwatch.com/rss/topstories"),
                feed("FX Street - News", "https://www.fxstreet.com/rss/news"),
                feed("OilPrice.com", "https://oilprice.com/rss/main"),
                feed("CoinDesk", "https://www.coindesk.com/arc/outboundfeeds/rss/"),
                feed("Federal Reserve", "https://www.federalreserve.gov/feeds/press_all.xml"),
            ],
            rss_poll_secs: 120,
            twitter: TwitterConfig::default(),
            facebook: FacebookConfig::default(),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitterConfig {
    /// `"ENV"` reads `TWITTER_BEARER_TOKEN`; empty disables the collector.
    pub bearer_token: String,
    pub accounts: Vec<String>,
    pub poll_secs: u64,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            bearer_token: "ENV".to_string(),
            accounts: ["Reuters", "WSJmarkets", "FTMarkets", "CoinDesk", "KitcoNewsNOW"]
                .into_iter()
                .map(String::from)
                .collect(),
            poll_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FacebookConfig {
    /// `"ENV"` reads `FACEBOOK_ACCESS_TOKEN`; empty disables the collector.
    pub access_token: String,
    pub page_ids: Vec<String>,
    pub poll_secs: u64,
}

impl Default for FacebookConfig {
    fn default() -> Self {
        Self {
            access_token: "ENV".to_string(),
            page_ids: Vec::new(),
            poll_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// SQLite file; `":memory:"` keeps fingerprints in process only.
    pub store_path: String,
    pub retention_days: u32,
    pub purge_interval_secs: u64,
    pub store_retry_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            store_path: "data/seen.sqlite3".to_string(),
            retention_days: 30,
            purge_interval_secs: 3_600,
            store_retry_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait_secs: u64,
    /// How often open batches are checked for age and the queue is pumped.
    pub tick_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait_secs: 300,
            tick_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub calls_per_minute: u32,
    /// 0 disables the token ceiling.
    pub tokens_per_day: u64,
    pub messages_per_second: u32,
    /// USD per UTC day; absent means no ceiling.
    pub daily_budget_usd: Option<f64>,
    /// Where today's spend survives restarts; absent keeps it in memory.
    pub budget_state_path: Option<String>,
    pub max_queue_len: usize,
    pub max_queue_wait_secs: u64,
    pub summarizer_max_attempts: u32,
    pub summarizer_backoff_ms: u64,
    pub delivery_max_attempts: u32,
    pub delivery_backoff_ms: u64,
    pub call_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub failed_log_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let d = DispatcherConfig::default();
        Self {
            calls_per_minute: d.calls_per_minute,
            tokens_per_day: d.tokens_per_day,
            messages_per_second: d.messages_per_second,
            daily_budget_usd: Some(2.0),
            budget_state_path: Some("data/budget.json".to_string()),
            max_queue_len: d.max_queue_len,
            max_queue_wait_secs: d.max_queue_wait.as_secs(),
            summarizer_max_attempts: d.summarizer_max_attempts,
            summarizer_backoff_ms: d.summarizer_backoff_ms,
            delivery_max_attempts: d.delivery_max_attempts,
            delivery_backoff_ms: d.delivery_backoff_ms,
            call_timeout_secs: d.call_timeout.as_secs(),
            send_timeout_secs: d.send_timeout.as_secs(),
            failed_log_capacity: d.failed_log_capacity,
        }
    }
}

impl DispatchConfig {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            calls_per_minute: self.calls_per_minute,
            tokens_per_day: self.tokens_per_day,
            messages_per_second: self.messages_per_second,
            max_queue_len: self.max_queue_len,
            max_queue_wait: Duration::from_secs(self.max_queue_wait_secs),
            summarizer_max_attempts: self.summarizer_max_attempts,
            summarizer_backoff_ms: self.summarizer_backoff_ms,
            delivery_max_attempts: self.delivery_max_attempts,
            delivery_backoff_ms: self.delivery_backoff_ms,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            failed_log_capacity: self.failed_log_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// `"ENV"` reads `TELEGRAM_BOT_TOKEN`.
    pub bot_token: String,
    /// Used for categories without their own chat.
    pub default_chat: Option<String>,
    /// Category key (`macro`, `crypto`, ...) to chat id.
    pub chats: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: "ENV".to_string(),
            default_chat: None,
            chats: BTreeMap::new(),
            timeout_secs: 10,
        }
    }
}

impl TelegramConfig {
    /// Chat routes keyed by category. Fails on unknown keys.
    pub fn routes(&self) -> Result<BTreeMap<Category, String>> {
        let mut out = BTreeMap::new();
        for (key, chat) in &self.chats {
            let category: Category = key
                .parse()
                .with_context(|| format!("telegram.chats key `{key}`"))?;
            if !chat.trim().is_empty() {
                out.insert(category, chat.trim().to_string());
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Minimum seconds between two emails of the same event kind.
    pub email_cooldown_secs: i64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            email_cooldown_secs: 1_800,
        }
    }
}

impl AppConfig {
    /// Parse `path`, resolve secrets and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut cfg: AppConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.finish()?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $DIGEST_CONFIG_PATH
    /// 2) config/digest.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        tracing::info!("no config file found, using defaults");
        let mut cfg = AppConfig::default();
        cfg.finish()?;
        Ok(cfg)
    }

    fn finish(&mut self) -> Result<()> {
        self.resolve_env()?;
        self.validate()
    }

    /// Replace `"ENV"` placeholders and apply `TELEGRAM_CHAT_*` overrides.
    pub fn resolve_env(&mut self) -> Result<()> {
        self.ai.resolve().context("ai config")?;
        resolve_secret(&mut self.telegram.bot_token, "TELEGRAM_BOT_TOKEN");
        resolve_secret(&mut self.ingest.twitter.bearer_token, "TWITTER_BEARER_TOKEN");
        resolve_secret(&mut self.ingest.facebook.access_token, "FACEBOOK_ACCESS_TOKEN");

        if let Ok(chat) = std::env::var("TELEGRAM_CHAT_DEFAULT") {
            if !chat.trim().is_empty() {
                self.telegram.default_chat = Some(chat.trim().to_string());
            }
        }
        for category in Category::ALL {
            let var = format!("TELEGRAM_CHAT_{}", category.as_str().to_ascii_uppercase());
            if let Ok(chat) = std::env::var(&var) {
                if !chat.trim().is_empty() {
                    self.telegram
                        .chats
                        .insert(category.as_str().to_string(), chat.trim().to_string());
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, v: u64) -> Result<()> {
            if v == 0 {
                bail!("{name} must be > 0");
            }
            Ok(())
        }

        positive("ingest.rss_poll_secs", self.ingest.rss_poll_secs)?;
        positive("ingest.twitter.poll_secs", self.ingest.twitter.poll_secs)?;
        positive("ingest.facebook.poll_secs", self.ingest.facebook.poll_secs)?;
        positive("ingest.channel_capacity", self.ingest.channel_capacity as u64)?;
        positive("dedup.retention_days", self.dedup.retention_days as u64)?;
        positive("dedup.purge_interval_secs", self.dedup.purge_interval_secs)?;
        if self.dedup.retention_days < 7 {
            tracing::warn!(
                retention_days = self.dedup.retention_days,
                "retention shorter than a week; re-published stories may be sent again"
            );
        }
        positive("batch.max_batch_size", self.batch.max_batch_size as u64)?;
        positive("batch.max_wait_secs", self.batch.max_wait_secs)?;
        positive("batch.tick_secs", self.batch.tick_secs)?;
        positive("dispatch.calls_per_minute", self.dispatch.calls_per_minute as u64)?;
        positive("dispatch.messages_per_second", self.dispatch.messages_per_second as u64)?;
        positive("dispatch.max_queue_len", self.dispatch.max_queue_len as u64)?;
        positive("dispatch.max_queue_wait_secs", self.dispatch.max_queue_wait_secs)?;
        positive("dispatch.summarizer_max_attempts", self.dispatch.summarizer_max_attempts as u64)?;
        positive("dispatch.delivery_max_attempts", self.dispatch.delivery_max_attempts as u64)?;
        positive("dispatch.call_timeout_secs", self.dispatch.call_timeout_secs)?;
        positive("dispatch.send_timeout_secs", self.dispatch.send_timeout_secs)?;

        if let Some(b) = self.dispatch.daily_budget_usd {
            if !b.is_finite() || b < 0.0 {
                bail!("dispatch.daily_budget_usd must be >= 0, got {b}");
            }
        }
        for f in &self.ingest.feeds {
            url::Url::parse(&f.url).with_context(|| format!("feed `{}` has an invalid url", f.name))?;
        }
        self.telegram.routes()?;
        Ok(())
    }
}

/// `"ENV"` (any case) is replaced by `var`, or by an empty string when unset.
fn resolve_secret(slot: &mut String, var: &str) {
    if slot.trim().eq_ignore_ascii_case("env") {
        *slot = std::env::var(var).unwrap_or_default();
        if slot.is_empty() {
            tracing::debug!(var, "secret not set; dependent component disabled");
        }
    }
}
