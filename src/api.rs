use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::dedup::{FingerprintStore, SharedStore};
use crate::dispatch::{DispatchMonitor, DispatchStats, FailedDelivery};
use crate::metrics::Metrics;

const DEFAULT_FAILED_LIMIT: usize = 50;

/// Read-only operator view of a running pipeline.
#[derive(Clone)]
pub struct ApiState {
    pub monitor: DispatchMonitor,
    pub store: SharedStore,
}

pub fn router(state: ApiState) -> Router {
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .route("/failed", get(failed))
        .layer(CorsLayer::very_permissive())
        .with_state(state);

    match Metrics::global() {
        Ok(m) => app.merge(m.router()),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics exporter unavailable, /metrics disabled");
            app
        }
    }
}

#[derive(Serialize)]
struct StatsOut {
    #[serde(flatten)]
    dispatch: DispatchStats,
    seen_fingerprints: Option<u64>,
    failed_deliveries: usize,
}

async fn stats(State(state): State<ApiState>) -> Json<StatsOut> {
    let seen_fingerprints = match state.store.len().await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "store size unavailable");
            None
        }
    };
    Json(StatsOut {
        dispatch: state.monitor.stats(),
        seen_fingerprints,
        failed_deliveries: state.monitor.failed_len(),
    })
}

#[derive(Deserialize)]
struct FailedQuery {
    limit: Option<usize>,
}

async fn failed(
    State(state): State<ApiState>,
    Query(q): Query<FailedQuery>,
) -> Result<Json<Vec<FailedDelivery>>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(DEFAULT_FAILED_LIMIT);
    if limit == 0 {
        return Err((StatusCode::BAD_REQUEST, "limit must be > 0".to_string()));
    }
    Ok(Json(state.monitor.failed(limit)))
}
