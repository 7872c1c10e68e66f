//! Response cache middleware.
//!
//! [`cache_reads`] serves GET requests from the cache and populates it on a
//! miss without holding up the response. [`invalidate_writes`] drops every
//! cached variant of a resource family once a mutation has succeeded.
//!
//! Concurrent misses for the same key are not coalesced: each one runs the
//! handler and (re)populates the entry.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request},
    middleware::Next,
    response::Response,
};
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::keys::{CacheKey, parse_query};
use super::store::CacheStore;
use crate::infra::cache::{
    CachedResponse, MAX_CACHEABLE_BODY_BYTES, buffer_response, should_store_response,
};

pub const CACHE_STATUS_HEADER: &str = "x-cache";
pub const CACHE_KEY_HEADER: &str = "x-cache-key";

const METRIC_CACHE_INVALIDATED_TOTAL: &str = "recordcache_cache_invalidated_total";

/// Authenticated caller, inserted as a request extension by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

/// Predicate deciding whether a request takes part in caching at all.
pub type RequestPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Per-route cache behaviour.
#[derive(Clone, Default)]
pub struct CacheRules {
    /// TTL for entries stored by the read path; the store default otherwise.
    pub ttl: Option<Duration>,
    /// Requests failing the predicate bypass the middleware. No predicate means always.
    pub condition: Option<RequestPredicate>,
    /// Patterns dropped after a successful write. Empty means the request's resource family.
    pub invalidate: Vec<String>,
    /// Add the `x-cache-key` diagnostic header.
    pub expose_key: bool,
}

impl CacheRules {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(predicate));
        self
    }

    pub fn invalidating(mut self, pattern: impl Into<String>) -> Self {
        self.invalidate.push(pattern.into());
        self
    }

    pub fn expose_key(mut self, expose: bool) -> Self {
        self.expose_key = expose;
        self
    }

    fn applies_to(&self, request: &Request<Body>) -> bool {
        self.condition
            .as_ref()
            .is_none_or(|predicate| predicate(request))
    }
}

/// Shared state for both middleware functions.
#[derive(Clone)]
pub struct CacheState {
    pub store: CacheStore,
    pub rules: CacheRules,
}

impl CacheState {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            rules: CacheRules::default(),
        }
    }

    pub fn with_rules(mut self, rules: CacheRules) -> Self {
        self.rules = rules;
        self
    }
}

/// Read-path middleware: answer from the cache, or run the handler and store its response.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn cache_reads(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET || !cache.rules.applies_to(&request) {
        return next.run(request).await;
    }

    let identity = request
        .extensions()
        .get::<CallerIdentity>()
        .map(|caller| caller.0.clone());
    let params = parse_query(request.uri().query());
    let key = CacheKey::for_request(request.uri().path(), identity.as_deref(), &params);

    if !cache.store.is_enabled() {
        let response = next.run(request).await;
        return mark(response, "MISS", &key, &cache.rules);
    }

    if let Some(cached) = cache.store.get::<CachedResponse>(key.as_str()).await {
        debug!(cache = "route", outcome = "hit", key = %key, "serving cached response");
        return mark(cached.into_response(), "HIT", &key, &cache.rules);
    }

    debug!(cache = "route", outcome = "miss", key = %key, "cache miss, executing handler");
    let response = next.run(request).await;

    if !should_store_response(&response) {
        return mark(response, "MISS", &key, &cache.rules);
    }

    let response = match buffer_response(response).await {
        Ok((rebuilt, captured)) => {
            if captured.body.len() <= MAX_CACHEABLE_BODY_BYTES {
                spawn_store(cache.store.clone(), key.clone(), captured, cache.rules.ttl);
            } else {
                debug!(
                    key = %key,
                    body_bytes = captured.body.len(),
                    "response too large to cache"
                );
            }
            rebuilt
        }
        Err((rebuilt, error)) => {
            warn!(key = %key, error = %error, "failed to buffer response for caching");
            rebuilt
        }
    };

    mark(response, "MISS", &key, &cache.rules)
}

/// Write-path middleware: after a successful mutation, drop the affected cache entries.
///
/// Failed or rejected writes leave the cache untouched.
#[instrument(skip_all, fields(path = %request.uri().path(), method = %request.method()))]
pub async fn invalidate_writes(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !is_mutation(request.method()) || !cache.rules.applies_to(&request) {
        return next.run(request).await;
    }

    let patterns = if cache.rules.invalidate.is_empty() {
        CacheKey::family_patterns(request.uri().path())
    } else {
        cache.rules.invalidate.clone()
    };

    let response = next.run(request).await;
    let status = response.status();

    if !status.is_success() {
        debug!(
            status = status.as_u16(),
            "write did not succeed; keeping cached entries"
        );
        return response;
    }

    let mut removed = 0;
    for pattern in &patterns {
        removed += cache.store.delete_pattern(pattern).await;
    }
    counter!(METRIC_CACHE_INVALIDATED_TOTAL).increment(removed);
    debug!(patterns = ?patterns, removed, "invalidated cached responses");

    response
}

fn is_mutation(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Store a captured response without delaying the one in flight.
fn spawn_store(store: CacheStore, key: CacheKey, captured: CachedResponse, ttl: Option<Duration>) {
    tokio::spawn(async move {
        if !store.set(key.as_str(), &captured, ttl).await {
            debug!(key = %key, "response not stored in cache");
        }
    });
}

fn mark(mut response: Response, outcome: &'static str, key: &CacheKey, rules: &CacheRules) -> Response {
    let headers = response.headers_mut();
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(outcome));
    if rules.expose_key {
        if let Ok(value) = HeaderValue::from_str(key.as_str()) {
            headers.insert(CACHE_KEY_HEADER, value);
        }
    }
    response
}
