//! Redis-backed result store.
//!
//! Uses a `ConnectionManager`, which reconnects on its own after a dropped
//! connection; individual command failures still surface as `StoreError`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{serialize_route, ResultStore};
use crate::error::StoreError;
use crate::job::{CorrelationId, Route};

pub struct RedisResultStore {
    redis: ConnectionManager,
    key_prefix: String,
    ttl: Option<Duration>,
}

impl RedisResultStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connected to Redis result store");
        Ok(Self::from_connection(redis))
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            key_prefix: String::new(),
            ttl: None,
        }
    }

    /// Prepends `prefix` to every key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Expires entries `ttl` after their last write.
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl.filter(|t| !t.is_zero());
        self
    }

    pub fn key_for(&self, id: &CorrelationId) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn write(&self, id: &CorrelationId, route: &Route) -> Result<(), StoreError> {
        let key = self.key_for(id);
        let value = serialize_route(route)?;
        let mut conn = self.redis.clone();

        match self.ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(&value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            None => {
                conn.set::<_, _, ()>(&key, &value).await?;
            }
        }

        tracing::debug!(key = %key, "Wrote result to Redis");
        Ok(())
    }

    async fn read(&self, id: &CorrelationId) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(self.key_for(id)).await?;
        Ok(value)
    }

    async fn delete(&self, id: &CorrelationId) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(self.key_for(id)).await?;
        Ok(removed > 0)
    }
}

impl std::fmt::Debug for RedisResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisResultStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisResultStore::connect("not-a-redis-url").await.unwrap_err();
        assert!(matches!(err, StoreError::ConnectionFailed(_)));
    }
}
