//! Operator read projections over the query monitor, cache store and warmer.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::monitor::DEFAULT_RECENT_LIMIT;

use super::AppState;

const DEFAULT_TOP_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self, default: usize) -> usize {
        self.limit.unwrap_or(default)
    }
}

#[derive(Debug, Serialize)]
struct ClearOutcome {
    cleared: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/diagnostics/queries", delete(clear_queries))
        .route("/diagnostics/queries/stats", get(query_stats))
        .route("/diagnostics/queries/slow", get(slow_queries))
        .route("/diagnostics/queries/recent", get(recent_queries))
        .route("/diagnostics/queries/patterns", get(query_patterns))
        .route("/diagnostics/queries/distribution", get(query_distribution))
        .route("/diagnostics/cache", get(cache_health))
        .route("/diagnostics/cache/clear", post(clear_cache))
        .route("/diagnostics/warmer", get(warmer_status))
        .route("/diagnostics/warmer/run", post(run_warmer))
}

async fn query_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.stats())
}

async fn slow_queries(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.monitor.slow_queries(query.resolve(DEFAULT_TOP_LIMIT)))
}

async fn recent_queries(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.monitor.recent_queries(query.resolve(DEFAULT_RECENT_LIMIT)))
}

async fn query_patterns(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    Json(state.monitor.top_patterns(query.resolve(DEFAULT_TOP_LIMIT)))
}

async fn query_distribution(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.distribution())
}

async fn clear_queries(State(state): State<AppState>) -> impl IntoResponse {
    state.monitor.clear();
    StatusCode::NO_CONTENT
}

async fn cache_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.health().await)
}

async fn clear_cache(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClearOutcome {
        cleared: state.cache.clear().await,
    })
}

async fn warmer_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.warmer.status())
}

async fn run_warmer(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.warmer.warm_cache().await)
}
