//! Redis backend (cargo feature `redis`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

use super::backend::{BackendError, KeyValueBackend};
use super::keys::escape_glob;

const SCAN_BATCH: usize = 500;

impl From<RedisError> for BackendError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
            BackendError::Unavailable(err.to_string())
        } else {
            BackendError::Protocol(err.to_string())
        }
    }
}

/// Backend over a shared, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut connection = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl KeyValueBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = connection.set_ex(key, value, seconds).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut connection = self.connection.clone();
        let removed: u64 = connection.del(key).await?;
        Ok(removed > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64, BackendError> {
        let keys = self.scan(pattern).await?;
        let mut connection = self.connection.clone();
        let mut removed = 0_u64;
        for chunk in keys.chunks(SCAN_BATCH) {
            let count: u64 = connection.del(chunk.to_vec()).await?;
            removed += count;
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let mut connection = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut connection).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BackendError::Protocol(format!("unexpected PING reply `{reply}`")))
        }
    }

    async fn len(&self, prefix: &str) -> Result<u64, BackendError> {
        let pattern = format!("{}*", escape_glob(prefix));
        Ok(self.scan(&pattern).await?.len() as u64)
    }
}
