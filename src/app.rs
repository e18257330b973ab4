//! Build pipeline components from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::batch::TopicalBatcher;
use crate::clock::{Clock, SharedClock};
use crate::config::{AppConfig, DedupConfig, IngestConfig, OperatorConfig, TelegramConfig};
use crate::dedup::{Deduplicator, MemoryStore, SharedStore, SqliteStore};
use crate::dispatch::{DailyBudget, Dispatcher};
use crate::ingest::providers::{facebook::FacebookProvider, rss::RssProvider, twitter::TwitterProvider};
use crate::ingest::types::SourceProvider;
use crate::notify::email::EmailSink;
use crate::notify::operator::SharedOperatorSink;
use crate::notify::{LogSink, OperatorMux, SharedDelivery, TelegramDelivery};
use crate::pipeline::{PipelineParts, PipelineSettings, PolledSource};
use crate::summarize::build_summarizer;

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("finnews-digest/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(20))
        .build()
        .context("building http client")
}

/// SQLite at `store_path`, or an in-process store for `":memory:"`.
pub async fn build_store(cfg: &DedupConfig) -> Result<SharedStore> {
    if cfg.store_path == ":memory:" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(dir) = std::path::Path::new(&cfg.store_path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    let store = SqliteStore::open(&cfg.store_path)
        .await
        .with_context(|| format!("opening fingerprint store {}", cfg.store_path))?;
    Ok(Arc::new(store))
}

/// Every configured collector. Social collectors without credentials are left out.
pub fn build_sources(cfg: &IngestConfig, client: &reqwest::Client) -> Vec<PolledSource> {
    let mut out: Vec<PolledSource> = cfg
        .feeds
        .iter()
        .map(|f| PolledSource {
            provider: Arc::new(RssProvider::from_url(&f.name, &f.url, client.clone())),
            interval: Duration::from_secs(cfg.rss_poll_secs),
        })
        .collect();

    let twitter = TwitterProvider::new(
        client.clone(),
        cfg.twitter.bearer_token.clone(),
        cfg.twitter.accounts.clone(),
    );
    if twitter.is_configured() {
        out.push(PolledSource {
            provider: Arc::new(twitter),
            interval: Duration::from_secs(cfg.twitter.poll_secs),
        });
    } else {
        tracing::info!("twitter collector disabled (no token or accounts)");
    }

    let facebook = FacebookProvider::new(
        client.clone(),
        cfg.facebook.access_token.clone(),
        cfg.facebook.page_ids.clone(),
    );
    if facebook.is_configured() {
        out.push(PolledSource {
            provider: Arc::new(facebook),
            interval: Duration::from_secs(cfg.facebook.poll_secs),
        });
    } else {
        tracing::info!("facebook collector disabled (no token or pages)");
    }
    out
}

pub fn build_delivery(cfg: &TelegramConfig, client: &reqwest::Client) -> Result<SharedDelivery> {
    if cfg.bot_token.trim().is_empty() {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set; every batch will be unroutable");
    }
    let mut telegram = TelegramDelivery::new(cfg.bot_token.trim().to_string(), client.clone())
        .with_timeout(cfg.timeout_secs)
        .with_default_chat(cfg.default_chat.clone());
    for (category, chat) in cfg.routes()? {
        telegram = telegram.with_chat(category, chat);
    }
    Ok(Arc::new(telegram))
}

/// Log sink always; email sink when SMTP is configured.
pub fn build_operator(cfg: &OperatorConfig) -> Result<SharedOperatorSink> {
    let mut mux = OperatorMux::new().with(Arc::new(LogSink));
    if let Some(email) = EmailSink::from_env(cfg.email_cooldown_secs)? {
        tracing::info!("operator email alerts enabled");
        mux = mux.with(Arc::new(email));
    }
    Ok(Arc::new(mux))
}

/// Everything the pipeline needs, plus the store for the HTTP layer.
pub async fn build_parts(cfg: &AppConfig, clock: SharedClock) -> Result<(PipelineParts, SharedStore)> {
    let client = http_client()?;
    let store = build_store(&cfg.dedup).await?;
    let summarizer = build_summarizer(&cfg.ai)?;
    let delivery = build_delivery(&cfg.telegram, &client)?;
    let operator = build_operator(&cfg.operator)?;

    let now = clock.now();
    let budget = match &cfg.dispatch.budget_state_path {
        Some(p) => DailyBudget::load(p, cfg.dispatch.daily_budget_usd, now),
        None => DailyBudget::new(cfg.dispatch.daily_budget_usd, now),
    };
    let dispatcher = Dispatcher::new(
        cfg.dispatch.to_dispatcher_config(),
        summarizer,
        delivery,
        budget,
        clock.clone(),
        operator,
    );
    let batcher = TopicalBatcher::new(
        cfg.batch.max_batch_size,
        chrono::Duration::seconds(cfg.batch.max_wait_secs as i64),
    );

    let parts = PipelineParts {
        sources: build_sources(&cfg.ingest, &client),
        dedup: Deduplicator::new(store.clone()),
        batcher,
        dispatcher,
        clock,
        settings: PipelineSettings {
            tick: Duration::from_secs(cfg.batch.tick_secs),
            retention: chrono::Duration::days(cfg.dedup.retention_days as i64),
            purge_interval: Duration::from_secs(cfg.dedup.purge_interval_secs),
            store_retry: Duration::from_millis(cfg.dedup.store_retry_ms.max(1)),
            channel_capacity: cfg.ingest.channel_capacity,
        },
    };
    Ok((parts, store))
}

/// Providers only, for the one-shot cycle.
pub fn providers_of(parts: &PipelineParts) -> Vec<Arc<dyn SourceProvider>> {
    parts.sources.iter().map(|s| s.provider.clone()).collect()
}
