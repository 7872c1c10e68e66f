//! Query telemetry for the persistence layer.
//!
//! Every persistence call reports its duration to a [`QueryMonitor`], which keeps
//! the most recent records in a bounded ring buffer and derives statistics,
//! latency buckets and query patterns from that window on demand.
//!
//! Recording is synchronous and in-memory: it never performs I/O, so
//! instrumenting a query does not add meaningfully to its latency.

mod patterns;
mod record;
mod stats;

use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use crate::sync::mutex_lock;

pub use patterns::{QueryPattern, normalize_query};
pub use record::QueryRecord;
pub use stats::{LatencyDistribution, QueryStats};

use record::{snapshot_param, truncate_query};

const SOURCE: &str = "monitor";
const METRIC_QUERY_MS: &str = "recordcache_query_ms";
const METRIC_SLOW_QUERY_TOTAL: &str = "recordcache_slow_query_total";

pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 100;
pub const DEFAULT_BUFFER_SIZE: usize = 1000;
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 500;
pub const DEFAULT_MAX_PARAM_LENGTH: usize = 100;
/// Default number of entries returned by [`QueryMonitor::recent_queries`].
pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Durations strictly above this are tagged slow.
    pub slow_query_threshold_ms: u64,
    /// Ring buffer capacity.
    pub buffer_size: usize,
    pub max_query_length: usize,
    pub max_param_length: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            max_param_length: DEFAULT_MAX_PARAM_LENGTH,
        }
    }
}

impl From<&crate::config::MonitorSettings> for MonitorConfig {
    fn from(settings: &crate::config::MonitorSettings) -> Self {
        Self {
            slow_query_threshold_ms: settings.slow_query_threshold_ms,
            buffer_size: settings.buffer_size.get(),
            max_query_length: settings.max_query_length.get(),
            max_param_length: settings.max_param_length.get(),
        }
    }
}

/// Bounded recorder of persistence-call timings.
///
/// One instance is created by the composition root and shared (`Arc`) with
/// every component that instruments or reports on queries.
pub struct QueryMonitor {
    config: MonitorConfig,
    records: Mutex<VecDeque<QueryRecord>>,
}

impl QueryMonitor {
    pub fn new(mut config: MonitorConfig) -> Self {
        config.buffer_size = config.buffer_size.max(1);
        let initial = config.buffer_size.min(1024);
        Self {
            config,
            records: Mutex::new(VecDeque::with_capacity(initial)),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record one completed query, evicting the oldest records past capacity.
    pub fn record_query(&self, query: &str, duration_ms: f64, params: Option<&[Value]>) {
        let duration_ms = if duration_ms.is_finite() {
            duration_ms.max(0.0)
        } else {
            0.0
        };
        let slow = duration_ms > self.config.slow_query_threshold_ms as f64;
        let query = truncate_query(query, self.config.max_query_length);
        let params = params.map(|values| {
            values
                .iter()
                .map(|value| snapshot_param(value, self.config.max_param_length))
                .collect()
        });

        histogram!(METRIC_QUERY_MS).record(duration_ms);

        let stack = if slow {
            counter!(METRIC_SLOW_QUERY_TOTAL).increment(1);
            warn!(
                target = "recordcache::monitor",
                duration_ms,
                threshold_ms = self.config.slow_query_threshold_ms,
                query = %query,
                "slow query"
            );
            Some(Backtrace::force_capture().to_string())
        } else {
            None
        };

        let record = QueryRecord {
            query,
            duration_ms,
            timestamp: OffsetDateTime::now_utc(),
            params,
            slow,
            stack,
        };

        let mut records = mutex_lock(&self.records, SOURCE, "record_query");
        records.push_back(record);
        while records.len() > self.config.buffer_size {
            records.pop_front();
        }
    }

    /// Await `operation`, recording its start-to-finish duration whatever it returns.
    ///
    /// A failure inside the recorder is logged and swallowed so instrumentation
    /// can never fail the instrumented call.
    pub async fn observe<F, T>(&self, query: &str, params: Option<&[Value]>, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let started_at = Instant::now();
        let output = operation.await;
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        let recorded = catch_unwind(AssertUnwindSafe(|| {
            self.record_query(query, elapsed_ms, params)
        }));
        if recorded.is_err() {
            warn!(
                target = "recordcache::monitor",
                elapsed_ms, "failed to record query timing"
            );
        }

        output
    }

    pub fn stats(&self) -> QueryStats {
        let (durations, slow) = {
            let records = mutex_lock(&self.records, SOURCE, "stats");
            let durations: Vec<f64> = records.iter().map(|record| record.duration_ms).collect();
            let slow = records.iter().filter(|record| record.slow).count();
            (durations, slow)
        };
        QueryStats::from_durations(durations, slow)
    }

    /// Slow records, longest first, capped at `limit`.
    pub fn slow_queries(&self, limit: usize) -> Vec<QueryRecord> {
        let mut slow: Vec<QueryRecord> = mutex_lock(&self.records, SOURCE, "slow_queries")
            .iter()
            .filter(|record| record.slow)
            .cloned()
            .collect();
        slow.sort_by(|a, b| b.duration_ms.total_cmp(&a.duration_ms));
        slow.truncate(limit);
        slow
    }

    /// Most recent records, newest first, capped at `limit`.
    pub fn recent_queries(&self, limit: usize) -> Vec<QueryRecord> {
        mutex_lock(&self.records, SOURCE, "recent_queries")
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn distribution(&self) -> LatencyDistribution {
        let records = mutex_lock(&self.records, SOURCE, "distribution");
        records
            .iter()
            .fold(LatencyDistribution::default(), |mut buckets, record| {
                buckets.add(record.duration_ms);
                buckets
            })
    }

    /// Every normalized query shape in the window, most frequent first.
    pub fn query_patterns(&self) -> Vec<QueryPattern> {
        let samples: Vec<(String, f64)> = mutex_lock(&self.records, SOURCE, "query_patterns")
            .iter()
            .map(|record| (record.query.clone(), record.duration_ms))
            .collect();
        patterns::group_patterns(samples.iter().map(|(query, ms)| (query.as_str(), *ms)))
    }

    pub fn top_patterns(&self, limit: usize) -> Vec<QueryPattern> {
        let mut patterns = self.query_patterns();
        patterns.truncate(limit);
        patterns
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.records, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.records, SOURCE, "clear").clear();
    }
}

impl Default for QueryMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}
