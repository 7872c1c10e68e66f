//! Cache configuration.
//!
//! Resolved from the `[cache]` settings section; see `crate::config`.

use std::time::Duration;

use super::keys::escape_glob;

pub const DEFAULT_TTL_SECONDS: u64 = 300;
pub const DEFAULT_MAX_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_KEY_PREFIX: &str = "recordcache:";
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 250;

/// Cache behaviour shared by the store, the middleware and the warmer.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Global kill switch. When false every store operation is a no-op.
    pub enabled: bool,
    pub default_ttl_seconds: u64,
    /// Upper bound applied to every TTL handed to the store.
    pub max_ttl_seconds: u64,
    /// Namespace prepended to every key and pattern.
    pub key_prefix: String,
    /// Deadline for a single backend round-trip.
    pub operation_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_ttl_seconds: DEFAULT_MAX_TTL_SECONDS,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_ttl_seconds: settings.default_ttl_seconds,
            max_ttl_seconds: settings.max_ttl_seconds,
            key_prefix: settings.key_prefix.clone(),
            operation_timeout: settings.operation_timeout,
        }
    }
}

impl CacheConfig {
    /// Enabled configuration with defaults, mostly for tests and embedding.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Clamp a requested TTL into `1..=max_ttl_seconds`.
    pub fn clamp_ttl(&self, ttl: Duration) -> Duration {
        let max = self.max_ttl_seconds.max(1);
        Duration::from_secs(ttl.as_secs().clamp(1, max))
    }

    /// Prefix a store-relative key.
    pub fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// Prefix a store-relative glob; the prefix itself always matches literally.
    pub fn namespaced_pattern(&self, pattern: &str) -> String {
        format!("{}{pattern}", escape_glob(&self.key_prefix))
    }
}
