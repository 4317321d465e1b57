//! Cache-aside read path for flow instances
//!
//! A miss takes a per-instance lock with a bounded wait, re-checks the cache
//! and only then loads from the repository, so concurrent cold reads of one
//! instance cause a single load. When the lock cannot be taken in time the
//! read falls back to an uncached direct load.

use async_trait::async_trait;
use flow_core::{with_lock, Cache, CacheConfig, LockConfig, SingleFlightLock};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collaborators::FlowRepository;
use crate::events::FlowEvent;
use crate::instance::FlowInstance;
use crate::Result;

/// Removes cached flow snapshots after they change.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn evict(&self, flow_instance_id: Uuid);
}

pub struct CachedFlowReader<C: Cache> {
    cache: Arc<C>,
    lock: Arc<dyn SingleFlightLock>,
    repository: Arc<dyn FlowRepository>,
    cache_config: CacheConfig,
    lock_config: LockConfig,
}

impl<C: Cache + 'static> CachedFlowReader<C> {
    pub fn new(cache: Arc<C>, lock: Arc<dyn SingleFlightLock>, repository: Arc<dyn FlowRepository>) -> Self {
        Self {
            cache,
            lock,
            repository,
            cache_config: CacheConfig::default(),
            lock_config: LockConfig::default(),
        }
    }

    pub fn with_config(mut self, cache_config: CacheConfig, lock_config: LockConfig) -> Self {
        self.cache_config = cache_config;
        self.lock_config = lock_config;
        self
    }

    /// Fetch a flow instance, populating the cache on a miss.
    pub async fn get(&self, id: Uuid) -> Result<Option<FlowInstance>> {
        let key = self.cache_config.key_for(&id.to_string());
        if let Some(hit) = self.cached(&key).await {
            debug!(flow_instance_id = %id, "Flow cache hit");
            return Ok(Some(hit));
        }

        let lock_key = self.lock_config.key_for(&id.to_string());
        let (loaded, acquired) = with_lock(
            self.lock.as_ref(),
            &lock_key,
            self.lock_config.wait(),
            self.lock_config.hold(),
            || self.load_and_populate(&key, id),
        )
        .await;

        match loaded {
            Some(result) if acquired => result,
            _ => {
                warn!(flow_instance_id = %id, "Flow cache lock not acquired, loading without cache");
                self.repository.find(id).await
            }
        }
    }

    async fn load_and_populate(&self, key: &str, id: Uuid) -> Result<Option<FlowInstance>> {
        if let Some(hit) = self.cached(key).await {
            debug!(flow_instance_id = %id, "Flow cache populated by another reader");
            return Ok(Some(hit));
        }

        debug!(flow_instance_id = %id, "Flow cache miss, loading");
        let flow = self.repository.find(id).await?;
        if let Some(flow) = &flow {
            self.populate(key, flow).await;
        }
        Ok(flow)
    }

    async fn cached(&self, key: &str) -> Option<FlowInstance> {
        match self.cache.get::<FlowInstance>(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(cache_key = %key, error = %e, "Flow cache read failed");
                None
            }
        }
    }

    async fn populate(&self, key: &str, flow: &FlowInstance) {
        if let Err(e) = self.cache.set(key, flow).await {
            warn!(cache_key = %key, error = %e, "Flow cache write failed");
        }
    }

    /// Evict whichever instance an event concerns.
    pub async fn on_event(&self, event: &FlowEvent) {
        self.evict(event.flow_instance_id()).await;
    }
}

#[async_trait]
impl<C: Cache + 'static> CacheInvalidator for CachedFlowReader<C> {
    async fn evict(&self, flow_instance_id: Uuid) {
        let key = self.cache_config.key_for(&flow_instance_id.to_string());
        match self.cache.delete(&key).await {
            Ok(()) => debug!(flow_instance_id = %flow_instance_id, "Flow cache evicted"),
            Err(e) => warn!(flow_instance_id = %flow_instance_id, error = %e, "Flow cache eviction failed"),
        }
    }
}
