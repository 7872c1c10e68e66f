//! In-process backend used by default and in tests.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use globset::GlobBuilder;

use super::backend::{BackendError, KeyValueBackend};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// `DashMap`-backed TTL store. Expired entries read as absent and are reaped on
/// access or when the size is queried.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or_else(|| BackendError::Protocol(format!("ttl {ttl:?} overflows the clock")))?;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        let matcher = GlobBuilder::new(pattern)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|err| BackendError::Pattern {
                pattern: pattern.to_string(),
                reason: err.to_string(),
            })?
            .compile_matcher();

        let now = Instant::now();
        let mut removed = 0_u64;
        self.entries.retain(|key, entry| {
            if !matcher.is_match(key.as_str()) {
                return true;
            }
            if entry.is_live(now) {
                removed += 1;
            }
            false
        });
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn len(&self, prefix: &str) -> Result<u64, BackendError> {
        self.purge_expired();
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .count() as u64)
    }
}
