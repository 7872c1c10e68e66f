use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use axum::http::StatusCode;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    application::records::{ListQuery, Listing, RecordFamily, RecordSource, SourceError},
    cache::{CacheKey, CacheStore, canonical_params},
    infra::cache::CachedResponse,
    sync::mutex_lock,
};

const SOURCE: &str = "recordcache::infra::cache_warmer";
const METRIC_WARM_MS: &str = "recordcache_warm_ms";
const METRIC_WARM_SKIPPED_TOTAL: &str = "recordcache_warm_skipped_total";

pub const DEFAULT_WARM_TTL_SECONDS: u64 = 1800;
pub const DEFAULT_WARM_MAX_RECORDS: usize = 1000;

#[derive(Debug, Error)]
pub enum WarmError {
    #[error("failed to load {family} for warming: {source}")]
    Source {
        family: RecordFamily,
        #[source]
        source: SourceError,
    },
    #[error("failed to encode {path} listing: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One collection to warm: the unfiltered listing plus one listing per value
/// of each dimension. A dimension names both the record field and the query
/// parameter the read path filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmTarget {
    pub family: RecordFamily,
    pub dimensions: Vec<String>,
}

impl WarmTarget {
    pub fn new(family: RecordFamily) -> Self {
        Self {
            family,
            dimensions: Vec::new(),
        }
    }

    pub fn by(mut self, dimension: impl Into<String>) -> Self {
        self.dimensions.push(dimension.into());
        self
    }

    pub fn path(&self) -> String {
        self.family.path()
    }

    pub fn defaults() -> Vec<WarmTarget> {
        vec![
            WarmTarget::new(RecordFamily::Definitions).by("category"),
            WarmTarget::new(RecordFamily::Domains),
            WarmTarget::new(RecordFamily::Objectives)
                .by("domain")
                .by("status"),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct WarmerConfig {
    pub on_startup: bool,
    /// Interval for scheduled passes; `None` disables the schedule.
    pub interval: Option<Duration>,
    /// Listings with more rows than this are left to the read path.
    pub max_records: usize,
    pub ttl: Duration,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            on_startup: false,
            interval: None,
            max_records: DEFAULT_WARM_MAX_RECORDS,
            ttl: Duration::from_secs(DEFAULT_WARM_TTL_SECONDS),
        }
    }
}

impl From<&crate::config::WarmerSettings> for WarmerConfig {
    fn from(settings: &crate::config::WarmerSettings) -> Self {
        Self {
            on_startup: settings.on_startup,
            interval: (settings.interval_minutes > 0)
                .then(|| Duration::from_secs(settings.interval_minutes.saturating_mul(60))),
            max_records: settings.max_records.get(),
            ttl: Duration::from_secs(settings.ttl_seconds),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WarmOutcome {
    Completed {
        entries: usize,
        oversized: usize,
        elapsed_ms: u64,
    },
    /// Another pass was already running.
    Skipped,
    /// Caching is turned off.
    Disabled,
    Failed {
        entries: usize,
        elapsed_ms: u64,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmerStatus {
    pub enabled: bool,
    pub is_warming: bool,
    pub is_scheduled: bool,
    pub last_outcome: Option<WarmOutcome>,
}

#[derive(Debug, Default)]
struct WarmProgress {
    entries: usize,
    oversized: usize,
}

/// Clears the warming flag when a pass ends, however it ends.
struct WarmingGuard<'a>(&'a AtomicBool);

impl Drop for WarmingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Populates the response cache with listings under the same keys the read
/// path derives, so warmed entries are served as hits.
pub struct CacheWarmer {
    store: CacheStore,
    source: Arc<dyn RecordSource>,
    config: WarmerConfig,
    targets: Vec<WarmTarget>,
    is_warming: AtomicBool,
    schedule: Mutex<Option<JoinHandle<()>>>,
    last_outcome: Mutex<Option<WarmOutcome>>,
}

impl CacheWarmer {
    pub fn new(store: CacheStore, source: Arc<dyn RecordSource>, config: WarmerConfig) -> Self {
        Self {
            store,
            source,
            config,
            targets: WarmTarget::defaults(),
            is_warming: AtomicBool::new(false),
            schedule: Mutex::new(None),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn with_targets(mut self, targets: Vec<WarmTarget>) -> Self {
        self.targets = targets;
        self
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    /// Run one warming pass. A pass requested while another is in flight is
    /// skipped, not queued.
    pub async fn warm_cache(&self) -> WarmOutcome {
        if !self.store.is_enabled() {
            debug!(target = "recordcache::cache_warmer", "cache disabled; not warming");
            return WarmOutcome::Disabled;
        }

        if self
            .is_warming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            counter!(METRIC_WARM_SKIPPED_TOTAL).increment(1);
            info!(
                target = "recordcache::cache_warmer",
                "warm pass already in progress; skipping"
            );
            return WarmOutcome::Skipped;
        }
        let _guard = WarmingGuard(&self.is_warming);

        info!(
            target = "recordcache::cache_warmer",
            targets = self.targets.len(),
            "warming response cache"
        );
        let started_at = Instant::now();
        let mut progress = WarmProgress::default();
        let result = self.warm_targets(&mut progress).await;
        let elapsed = started_at.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        histogram!(METRIC_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);

        let outcome = match result {
            Ok(()) => {
                info!(
                    target = "recordcache::cache_warmer",
                    entries = progress.entries,
                    oversized = progress.oversized,
                    elapsed_ms,
                    "cache warm complete"
                );
                WarmOutcome::Completed {
                    entries: progress.entries,
                    oversized: progress.oversized,
                    elapsed_ms,
                }
            }
            Err(err) => {
                warn!(
                    target = "recordcache::cache_warmer",
                    entries = progress.entries,
                    elapsed_ms,
                    error = %err,
                    "cache warm aborted"
                );
                WarmOutcome::Failed {
                    entries: progress.entries,
                    elapsed_ms,
                    error: err.to_string(),
                }
            }
        };

        *mutex_lock(&self.last_outcome, SOURCE, "record_outcome") = Some(outcome.clone());
        outcome
    }

    /// Warm now, then again every `interval` until [`CacheWarmer::shutdown`].
    ///
    /// Replaces any schedule already running.
    pub fn scheduled_warming(self: &Arc<Self>, interval: Duration) {
        let warmer = Arc::clone(self);
        let period = interval.max(Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                warmer.warm_cache().await;
            }
        });

        info!(
            target = "recordcache::cache_warmer",
            interval_secs = period.as_secs(),
            "scheduled cache warming"
        );

        let previous = mutex_lock(&self.schedule, SOURCE, "schedule").replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the schedule. An in-flight pass is cancelled with it.
    pub fn shutdown(&self) {
        if let Some(handle) = mutex_lock(&self.schedule, SOURCE, "shutdown").take() {
            handle.abort();
            info!(target = "recordcache::cache_warmer", "cache warming stopped");
        }
    }

    pub fn status(&self) -> WarmerStatus {
        let is_scheduled = mutex_lock(&self.schedule, SOURCE, "status")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        WarmerStatus {
            enabled: self.store.is_enabled(),
            is_warming: self.is_warming.load(Ordering::Acquire),
            is_scheduled,
            last_outcome: mutex_lock(&self.last_outcome, SOURCE, "status").clone(),
        }
    }

    async fn warm_targets(&self, progress: &mut WarmProgress) -> Result<(), WarmError> {
        for target in &self.targets {
            self.warm_listing(target, ListQuery::default(), progress)
                .await?;

            for dimension in &target.dimensions {
                let values = self
                    .source
                    .distinct_values(target.family, dimension)
                    .await
                    .map_err(|source| WarmError::Source {
                        family: target.family,
                        source,
                    })?;

                for value in values {
                    self.warm_listing(
                        target,
                        ListQuery::filtered(dimension.as_str(), value),
                        progress,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn warm_listing(
        &self,
        target: &WarmTarget,
        query: ListQuery,
        progress: &mut WarmProgress,
    ) -> Result<(), WarmError> {
        let limit = self.config.max_records.saturating_add(1);
        let rows = self
            .source
            .list(target.family, &query.clone().with_limit(limit))
            .await
            .map_err(|source| WarmError::Source {
                family: target.family,
                source,
            })?;

        let path = target.path();
        if rows.len() > self.config.max_records {
            progress.oversized += 1;
            debug!(
                target = "recordcache::cache_warmer",
                path = %path,
                filters = ?query.filters,
                max_records = self.config.max_records,
                "listing exceeds warm limit; leaving it to the read path"
            );
            return Ok(());
        }

        let listing = Listing::from(rows);
        let cached = CachedResponse::json(StatusCode::OK, &listing).map_err(|source| {
            WarmError::Encode {
                path: path.clone(),
                source,
            }
        })?;
        let key = CacheKey::for_request(&path, None, &canonical_params(query.filters));

        if self.store.set(key.as_str(), &cached, Some(self.config.ttl)).await {
            progress.entries += 1;
        }
        Ok(())
    }
}
