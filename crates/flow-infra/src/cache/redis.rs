use async_trait::async_trait;
use flow_core::{Cache, CacheConfig, RedisConfig};
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{InfraError, Result};

#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    pub url: String,
    pub default_ttl: Duration,
    /// Prefix owned by this cache; `clear` only removes keys under it
    pub key_prefix: Option<String>,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self::from_config(&RedisConfig::default(), &CacheConfig::default())
    }
}

impl RedisCacheConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn from_config(redis: &RedisConfig, cache: &CacheConfig) -> Self {
        Self {
            url: redis.url.clone(),
            default_ttl: cache.ttl(),
            key_prefix: Some(cache.key_prefix.clone()),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.key_prefix = prefix;
        self
    }

    fn clear_pattern(&self) -> Option<String> {
        self.key_prefix.as_ref().map(|prefix| format!("{}*", prefix))
    }
}

/// Redis-backed cache. Keys arrive fully prefixed from the caller.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    config: RedisCacheConfig,
}

impl RedisCache {
    pub async fn new(config: RedisCacheConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to Redis");

        let client = Client::open(config.url.clone())?;
        let connection = ConnectionManager::new(client).await?;

        info!("Redis connection established");
        Ok(Self { connection, config })
    }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        debug!(cache_key = %key, ttl_secs = ttl.as_secs(), "Setting cache key");

        let serialized = serde_json::to_string(value)?;
        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(key, serialized, ttl.as_secs()).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            warn!(error = %e, "Redis health check failed");
            InfraError::Cache(e)
        })?;
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let count = keys.len() as u64;
        let _: () = conn.del(keys).await?;
        info!(count, pattern = %pattern, "Deleted cache keys");
        Ok(count)
    }
}

#[async_trait]
impl Cache for RedisCache {
    type Error = InfraError;

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;

        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(key, value, self.config.default_ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(cache_key = %key, "Deleting cache key");
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match self.config.clear_pattern() {
            Some(pattern) => {
                self.delete_pattern(&pattern).await?;
                Ok(())
            }
            None => {
                warn!("No key prefix configured, refusing to clear Redis");
                Err(InfraError::Configuration(
                    "cannot clear cache without key prefix".to_string(),
                ))
            }
        }
    }
}
