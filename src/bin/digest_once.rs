//! Run a single collection cycle and exit (cron / CI mode).

use std::sync::Arc;

use anyhow::Context;

use finnews_digest::app::{build_parts, providers_of};
use finnews_digest::clock::SystemClock;
use finnews_digest::config::AppConfig;
use finnews_digest::pipeline::run_cycle;
use finnews_digest::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading config")?;
    let clock = Arc::new(SystemClock);
    let (mut parts, _store) = build_parts(&cfg, clock.clone()).await?;
    let providers = providers_of(&parts);

    let report = run_cycle(
        &providers,
        &parts.dedup,
        &mut parts.batcher,
        &mut parts.dispatcher,
        clock.as_ref(),
        parts.settings.retention,
    )
    .await
    .context("collection cycle")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
