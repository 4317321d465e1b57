//! In-memory cache implementation
//!
//! Local cache for single-process deployments and tests, with per-entry TTL
//! and a bounded entry count.

use async_trait::async_trait;
use flow_core::{Cache, CacheConfig};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{InfraError, Result};

#[derive(Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| Instant::now() > exp).unwrap_or(false)
    }
}

/// Configuration for the memory cache
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    /// TTL applied by `set`; `None` keeps entries until evicted
    pub default_ttl: Option<Duration>,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Period of the background sweep of expired entries
    pub cleanup_interval: Option<Duration>,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(CacheConfig::default().ttl()),
            max_entries: 10_000,
            cleanup_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl MemoryCacheConfig {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            default_ttl,
            ..Default::default()
        }
    }

    /// TTL taken from the flow cache settings.
    pub fn from_cache_config(config: &CacheConfig) -> Self {
        Self::new(Some(config.ttl()))
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Option<Duration>) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: MemoryCacheConfig,
}

impl MemoryCache {
    /// Create a cache. A configured cleanup interval spawns a sweep task and
    /// therefore needs a running Tokio runtime.
    pub fn new(config: MemoryCacheConfig) -> Self {
        let cache = Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
        };

        if let Some(interval) = cache.config.cleanup_interval {
            let entries = Arc::clone(&cache.entries);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let mut entries = entries.write().await;
                    let before = entries.len();
                    entries.retain(|_, v| !v.is_expired());
                    let removed = before - entries.len();
                    if removed > 0 {
                        debug!(removed, "Memory cache sweep removed expired entries");
                    }
                }
            });
        }

        cache
    }

    pub async fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.insert(key, serde_json::to_string(value)?, Some(Instant::now() + ttl))
            .await;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> bool {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| !e.is_expired()).unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn insert(&self, key: &str, value: String, expires_at: Option<Instant>) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.config.max_entries && !entries.contains_key(key) {
            Self::evict_one(&mut entries);
        }
        entries.insert(key.to_string(), CacheEntry { value, expires_at });
        debug!(cache_key = %key, "Cache entry stored");
    }

    /// Evict an expired entry if there is one, otherwise an arbitrary one.
    fn evict_one(entries: &mut HashMap<String, CacheEntry>) {
        let victim = entries
            .iter()
            .find(|(_, v)| v.is_expired())
            .or_else(|| entries.iter().next())
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    type Error = InfraError;

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let entries = self.entries.read().await;

        match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                let value: T = serde_json::from_str(&entry.value)?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_string(value)?;
        let expires_at = self.config.default_ttl.map(|ttl| Instant::now() + ttl);
        self.insert(key, serialized, expires_at).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        debug!(cache_key = %key, "Cache entry deleted");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        debug!("Memory cache cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache {
        MemoryCache::new(MemoryCacheConfig::default().with_cleanup_interval(None))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = cache();

        cache.set("cache:1", &"snapshot".to_string()).await.unwrap();
        let result: Option<String> = cache.get("cache:1").await.unwrap();

        assert_eq!(result, Some("snapshot".to_string()));
        assert_eq!(cache.get::<String>("cache:2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = cache();

        cache.set("a", &1i32).await.unwrap();
        cache.set("b", &2i32).await.unwrap();
        cache.delete("a").await.unwrap();
        assert_eq!(cache.get::<i32>("a").await.unwrap(), None);

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let cache = MemoryCache::new(MemoryCacheConfig::new(None).with_cleanup_interval(None));

        cache
            .set_with_ttl("k", &"v".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(cache.exists("k").await);

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(cache.get::<String>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_max_entries() {
        let cache = MemoryCache::new(
            MemoryCacheConfig::default()
                .with_max_entries(2)
                .with_cleanup_interval(None),
        );

        cache.set("k1", &1i32).await.unwrap();
        cache.set("k2", &2i32).await.unwrap();
        cache.set("k3", &3i32).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert!(cache.exists("k3").await);
    }

    #[test]
    fn test_config_from_cache_settings() {
        let settings = CacheConfig {
            ttl_secs: 600,
            key_prefix: "cache:".to_string(),
        };
        assert_eq!(
            MemoryCacheConfig::from_cache_config(&settings).default_ttl,
            Some(Duration::from_secs(600))
        );
    }
}
