mod diagnostics;
mod middleware;
mod records;

pub use middleware::{REQUEST_ID_HEADER, RequestContext, log_responses, set_request_context};

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware, routing::get};

use crate::{
    application::records::RecordSource,
    cache::{CacheRules, CacheState, CacheStore, cache_reads, invalidate_writes},
    infra::cache_warmer::CacheWarmer,
    monitor::QueryMonitor,
};

/// Shared handles owned by the composition root.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordSource>,
    pub monitor: Arc<QueryMonitor>,
    pub cache: CacheStore,
    pub warmer: Arc<CacheWarmer>,
}

/// Record API with the cache layers applied, plus the diagnostics endpoints.
pub fn build_router(state: AppState, rules: CacheRules) -> Router {
    let cache_state = CacheState::new(state.cache.clone()).with_rules(rules);

    let api = Router::new()
        .route(
            "/api/{family}",
            get(records::list_records).post(records::create_record),
        )
        .route(
            "/api/{family}/{id}",
            get(records::get_record)
                .put(records::update_record)
                .delete(records::delete_record),
        )
        .layer(axum_middleware::from_fn_with_state(
            cache_state.clone(),
            invalidate_writes,
        ))
        .layer(axum_middleware::from_fn_with_state(cache_state, cache_reads));

    Router::new()
        .merge(api)
        .merge(diagnostics::router())
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
