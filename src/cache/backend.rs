//! Seam to the external key-value service.
//!
//! Backends speak in fully-namespaced keys and serialized values; expiry is the
//! backend's job. Errors surface here and are absorbed by `CacheStore`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid key pattern `{pattern}`: {reason}")]
    Pattern { pattern: String, reason: String },
    #[error("cache backend protocol error: {0}")]
    Protocol(String),
}

/// Minimal TTL key-value contract the cache store is written against.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Short backend name for logs and diagnostics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Remove every key matching a glob and return how many were removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError>;

    async fn ping(&self) -> Result<(), BackendError>;

    /// Number of live keys starting with `prefix`.
    async fn len(&self, prefix: &str) -> Result<u64, BackendError>;
}
