//! In-process keyed lock
//!
//! One lease slot per key. A lease that outlives its hold time is treated as
//! released, so a crashed holder cannot wedge a key. Waiters are woken on
//! release and re-check at least every `poll_interval`.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flow_core::{LockLease, Result, SingleFlightLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

struct Slot {
    token: Uuid,
    expires_at: Instant,
}

#[derive(Clone)]
pub struct KeyedMutexLock {
    slots: Arc<DashMap<String, Slot>>,
    released: Arc<Notify>,
    poll_interval: Duration,
}

impl Default for KeyedMutexLock {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedMutexLock {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            released: Arc::new(Notify::new()),
            poll_interval: Duration::from_millis(20),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Keys currently held by an unexpired lease.
    pub fn held(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.expires_at > now).count()
    }

    fn try_acquire(&self, key: &str, hold: Duration) -> Option<LockLease> {
        let now = Instant::now();
        let lease = LockLease::new(key, hold);
        let slot = Slot {
            token: lease.token,
            expires_at: now + hold,
        };

        match self.slots.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(slot);
                Some(lease)
            }
            Entry::Occupied(mut entry) if entry.get().expires_at <= now => {
                debug!(lock_key = %key, "Expired lease taken over");
                entry.insert(slot);
                Some(lease)
            }
            Entry::Occupied(_) => None,
        }
    }
}

#[async_trait]
impl SingleFlightLock for KeyedMutexLock {
    async fn try_lock(&self, key: &str, wait: Duration, hold: Duration) -> Result<Option<LockLease>> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.released.notified();
            if let Some(lease) = self.try_acquire(key, hold) {
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let pause = (deadline - now).min(self.poll_interval);
            let _ = tokio::time::timeout(pause, notified).await;
        }
    }

    async fn unlock(&self, lease: LockLease) -> Result<()> {
        let removed = self
            .slots
            .remove_if(&lease.key, |_, slot| slot.token == lease.token)
            .is_some();
        if removed {
            self.released.notify_waiters();
        } else {
            debug!(lock_key = %lease.key, "Release of expired or foreign lease ignored");
        }
        Ok(())
    }
}
