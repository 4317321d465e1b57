//! Single-flight lock abstraction.
//!
//! A lock is named by a key, acquired with a bounded wait and held for at most
//! a bounded time. Backends range from an in-process keyed mutex map to a
//! distributed lease; the engine only depends on this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;

/// Proof of a held lock, handed back to [`SingleFlightLock::unlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Key the lease was acquired for
    pub key: String,
    /// Token identifying this holder; release only succeeds for the owner
    pub token: Uuid,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
    /// Maximum hold time before the lease expires on its own
    pub hold: Duration,
}

impl LockLease {
    pub fn new(key: impl Into<String>, hold: Duration) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4(),
            acquired_at: Utc::now(),
            hold,
        }
    }
}

#[async_trait]
pub trait SingleFlightLock: Send + Sync {
    /// Try to acquire `key`, waiting at most `wait`. Returns `None` on timeout.
    async fn try_lock(&self, key: &str, wait: Duration, hold: Duration) -> Result<Option<LockLease>>;

    /// Release a lease. Releasing an expired or foreign lease is a no-op.
    async fn unlock(&self, lease: LockLease) -> Result<()>;
}

/// Run `f` while holding `key`.
///
/// Returns `(Some(value), true)` when the lock was acquired and `f` ran, and
/// `(None, false)` when the wait bound elapsed or the backend failed. A failed
/// release is logged and does not discard the value.
pub async fn with_lock<L, F, Fut, T>(
    lock: &L,
    key: &str,
    wait: Duration,
    hold: Duration,
    f: F,
) -> (Option<T>, bool)
where
    L: SingleFlightLock + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = T> + Send,
    T: Send,
{
    let lease = match lock.try_lock(key, wait, hold).await {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            debug!(lock_key = %key, wait_ms = wait.as_millis() as u64, "Lock not acquired within wait bound");
            return (None, false);
        }
        Err(e) => {
            warn!(lock_key = %key, error = %e, "Lock backend failed");
            return (None, false);
        }
    };

    let value = f().await;

    if let Err(e) = lock.unlock(lease).await {
        warn!(lock_key = %key, error = %e, "Failed to release lock");
    }

    (Some(value), true)
}
