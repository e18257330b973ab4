//! finnews-digest service entrypoint.
//! Starts the collection pipeline in the background and serves the operator
//! HTTP surface (`/health`, `/stats`, `/failed`, `/metrics`).

use std::sync::Arc;

use shuttle_axum::ShuttleAxum;

use finnews_digest::api::{self, ApiState};
use finnews_digest::app::build_parts;
use finnews_digest::clock::SystemClock;
use finnews_digest::config::AppConfig;
use finnews_digest::pipeline::{shutdown_signal, PipelineHandle};
use finnews_digest::telemetry::init_tracing;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default()?;
    let (parts, store) = build_parts(&cfg, Arc::new(SystemClock)).await?;

    let pipeline = PipelineHandle::spawn(parts);
    let state = ApiState {
        monitor: pipeline.monitor(),
        store,
    };

    // SIGINT/SIGTERM or store corruption: drain open batches, report the queue.
    tokio::spawn(async move {
        if let Err(e) = pipeline.run_until(shutdown_signal()).await {
            tracing::error!(error = ?e, "pipeline stopped with error");
        }
    });

    Ok(api::router(state).into())
}
