//! Technology adapters for the approval flow engine.
//!
//! Implements the `flow-core` seams:
//! - [`Cache`](flow_core::Cache): [`MemoryCache`], [`RedisCache`]
//! - [`SingleFlightLock`](flow_core::SingleFlightLock): [`KeyedMutexLock`], [`RedisLock`]
//! - [`EventPublisher`](flow_core::EventPublisher): [`InMemoryEventBus`], [`NatsEventPublisher`]

pub mod cache;
pub mod lock;
pub mod messaging;

pub use cache::memory::{MemoryCache, MemoryCacheConfig};
pub use cache::redis::{RedisCache, RedisCacheConfig};
pub use lock::keyed::KeyedMutexLock;
pub use lock::redis::RedisLock;
pub use messaging::bus::{EventSubscription, InMemoryEventBus};
pub use messaging::nats::{NatsEventPublisher, NatsEventSubscriber, NatsPublisherConfig};

use flow_core::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, InfraError>;

impl From<InfraError> for CoreError {
    fn from(err: InfraError) -> Self {
        match err {
            InfraError::Cache(e) => CoreError::Cache(e.to_string()),
            InfraError::Lock(msg) => CoreError::Lock(msg),
            InfraError::Messaging(msg) => CoreError::Publish(msg),
            InfraError::Serialization(e) => CoreError::Serialization(e),
            InfraError::Configuration(msg) => CoreError::Cache(msg),
        }
    }
}
