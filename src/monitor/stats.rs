//! Latency statistics derived from the current buffer window.

use serde::Serialize;

/// Aggregate statistics over the buffered records.
///
/// Always recomputed from the current window; nothing here is cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueryStats {
    pub total_queries: usize,
    pub slow_queries: usize,
    pub avg_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub p50_duration: f64,
    pub p95_duration: f64,
    pub p99_duration: f64,
}

impl QueryStats {
    /// Compute statistics from unsorted durations. Empty input yields all zeros.
    pub(crate) fn from_durations(mut durations: Vec<f64>, slow_queries: usize) -> Self {
        if durations.is_empty() {
            return Self::default();
        }

        durations.sort_by(f64::total_cmp);
        let total = durations.len();
        let sum: f64 = durations.iter().sum();
        let min = durations[0];
        let max = durations[total - 1];
        // Float summation can drift just outside [min, max].
        let avg = (sum / total as f64).clamp(min, max);

        Self {
            total_queries: total,
            slow_queries,
            avg_duration: avg,
            min_duration: min,
            max_duration: max,
            p50_duration: nearest_rank(&durations, 50.0),
            p95_duration: nearest_rank(&durations, 95.0),
            p99_duration: nearest_rank(&durations, 99.0),
        }
    }
}

/// Nearest-rank percentile over sorted samples: the value at rank `ceil(p/100 * n)`.
pub(crate) fn nearest_rank(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (percentile * sorted.len() as f64 / 100.0).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

/// Count of records per fixed latency bucket. Every bucket is always present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyDistribution {
    #[serde(rename = "0-10ms")]
    pub under_10ms: usize,
    #[serde(rename = "10-50ms")]
    pub from_10_to_50ms: usize,
    #[serde(rename = "50-100ms")]
    pub from_50_to_100ms: usize,
    #[serde(rename = "100-500ms")]
    pub from_100_to_500ms: usize,
    #[serde(rename = "500ms+")]
    pub over_500ms: usize,
}

impl LatencyDistribution {
    pub(crate) fn add(&mut self, duration_ms: f64) {
        let bucket = if duration_ms < 10.0 {
            &mut self.under_10ms
        } else if duration_ms < 50.0 {
            &mut self.from_10_to_50ms
        } else if duration_ms < 100.0 {
            &mut self.from_50_to_100ms
        } else if duration_ms < 500.0 {
            &mut self.from_100_to_500ms
        } else {
            &mut self.over_500ms
        };
        *bucket += 1;
    }

    pub fn total(&self) -> usize {
        self.under_10ms
            + self.from_10_to_50ms
            + self.from_50_to_100ms
            + self.from_100_to_500ms
            + self.over_500ms
    }

    /// Buckets as `(label, count)` pairs in ascending latency order.
    pub fn buckets(&self) -> [(&'static str, usize); 5] {
        [
            ("0-10ms", self.under_10ms),
            ("10-50ms", self.from_10_to_50ms),
            ("50-100ms", self.from_50_to_100ms),
            ("100-500ms", self.from_100_to_500ms),
            ("500ms+", self.over_500ms),
        ]
    }
}
