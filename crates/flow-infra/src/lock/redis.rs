//! Distributed lease on Redis
//!
//! Acquire is `SET key token NX PX hold`, retried until the wait bound. Release
//! deletes the key only while it still carries the holder's token.

use async_trait::async_trait;
use flow_core::{CoreError, LockLease, RedisConfig, Result, SingleFlightLock};
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::InfraError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLock {
    connection: ConnectionManager,
    poll_interval: Duration,
}

impl RedisLock {
    pub async fn new(config: &RedisConfig) -> std::result::Result<Self, InfraError> {
        info!(url = %config.url, "Connecting lock backend to Redis");
        let client = Client::open(config.url.clone())?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn try_set(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(lease.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(hold_millis(lease.hold))
            .query_async(&mut conn)
            .await
            .map_err(|e| CoreError::from(InfraError::Lock(e.to_string())))?;
        Ok(reply.is_some())
    }
}

/// PX rejects zero, so the hold is at least one millisecond.
fn hold_millis(hold: Duration) -> u64 {
    (hold.as_millis() as u64).max(1)
}

#[async_trait]
impl SingleFlightLock for RedisLock {
    async fn try_lock(&self, key: &str, wait: Duration, hold: Duration) -> Result<Option<LockLease>> {
        let deadline = Instant::now() + wait;
        let lease = LockLease::new(key, hold);

        loop {
            if self.try_set(&lease).await? {
                debug!(lock_key = %key, "Redis lease acquired");
                return Ok(Some(lease));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn unlock(&self, lease: LockLease) -> Result<()> {
        let mut conn = self.connection.clone();
        let deleted: i32 = Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoreError::from(InfraError::Lock(e.to_string())))?;

        if deleted == 0 {
            debug!(lock_key = %lease.key, "Redis lease already expired or taken over");
        }
        Ok(())
    }
}
