//! Response caching.
//!
//! - [`CacheStore`]: TTL key-value store that degrades every failure to a miss
//! - [`cache_reads`] / [`invalidate_writes`]: axum middleware for the read and write paths
//! - [`CacheKey`]: deterministic request keys and family invalidation patterns
//!
//! The backend sits behind [`KeyValueBackend`]; the in-process [`MemoryBackend`]
//! is the default and Redis is available with the `redis` cargo feature.
//!
//! ```toml
//! [cache]
//! enabled = true
//! default_ttl_seconds = 300
//! key_prefix = "recordcache:"
//! ```

mod backend;
mod config;
mod keys;
mod memory;
mod middleware;
#[cfg(feature = "redis")]
mod redis;
mod store;

pub use backend::{BackendError, KeyValueBackend};
pub use config::CacheConfig;
pub use keys::{ANONYMOUS, CacheKey, CanonicalParams, canonical_params, parse_query};
pub use memory::MemoryBackend;
pub use middleware::{
    CACHE_KEY_HEADER, CACHE_STATUS_HEADER, CacheRules, CacheState, CallerIdentity,
    RequestPredicate, cache_reads, invalidate_writes,
};
#[cfg(feature = "redis")]
pub use redis::RedisBackend;
pub use store::{CacheHealth, CacheStore};
