use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::warn;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{ConfigWarning, LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Emit configuration values that were replaced by defaults during loading.
pub fn report_config_warnings(warnings: &[ConfigWarning]) {
    for warning in warnings {
        warn!(
            target = "recordcache::config",
            key = warning.key,
            value = %warning.value,
            reason = %warning.reason,
            "configuration value replaced by default"
        );
    }
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "recordcache_cache_hit_total",
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            "recordcache_cache_miss_total",
            Unit::Count,
            "Total number of response-cache misses, including degraded lookups."
        );
        describe_counter!(
            "recordcache_cache_error_total",
            Unit::Count,
            "Cache operations that failed or timed out, labelled by operation."
        );
        describe_counter!(
            "recordcache_cache_invalidated_total",
            Unit::Count,
            "Entries removed by write-path invalidation."
        );
        describe_histogram!(
            "recordcache_warm_ms",
            Unit::Milliseconds,
            "Cache warm pass latency in milliseconds."
        );
        describe_counter!(
            "recordcache_warm_skipped_total",
            Unit::Count,
            "Warm passes skipped because another pass was running."
        );
        describe_histogram!(
            "recordcache_query_ms",
            Unit::Milliseconds,
            "Observed persistence call latency in milliseconds."
        );
        describe_counter!(
            "recordcache_slow_query_total",
            Unit::Count,
            "Persistence calls above the slow query threshold."
        );
    });
}
