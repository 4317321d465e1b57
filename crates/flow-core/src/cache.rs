//! Cache abstraction used by the cache-aside read path.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

/// Key-value cache holding serialized snapshots.
///
/// Backends decide how values are encoded and how long they live; callers only
/// see typed `get`/`set`/`delete` on string keys.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Error type returned by cache operations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Get a value from the cache
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Self::Error>;

    /// Set a value in the cache
    async fn set<T: Serialize + Send + Sync>(&self, key: &str, value: &T) -> Result<(), Self::Error>;

    /// Delete a value from the cache
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;

    /// Clear all values from the cache
    async fn clear(&self) -> Result<(), Self::Error>;
}
