use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowConfig {
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub routing: RoutingConfig,
    pub redis: RedisConfig,
    pub nats: NatsConfig,
    pub logging: LoggingConfig,
}

impl FlowConfig {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_env("FLOW")
    }

    /// Load configuration from environment with custom prefix
    pub fn load_from_env(prefix: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?.add_source(
            Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load configuration from file with environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Self::with_defaults(Config::builder())?
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("FLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("cache.ttl_secs", default_cache_ttl_secs() as i64)?
            .set_default("cache.key_prefix", default_cache_key_prefix())?
            .set_default("lock.wait_ms", default_lock_wait_ms() as i64)?
            .set_default("lock.hold_ms", default_lock_hold_ms() as i64)?
            .set_default("lock.key_prefix", default_lock_key_prefix())?
            .set_default("routing.max_skip_depth", default_max_skip_depth() as i64)?
            .set_default("redis.url", default_redis_url())?
            .set_default("nats.url", default_nats_url())?
            .set_default("nats.subject_prefix", default_subject_prefix())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)
    }
}

/// Cache-aside settings for flow instance snapshots
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            key_prefix: default_cache_key_prefix(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

fn default_cache_ttl_secs() -> u64 {
    1800
}

fn default_cache_key_prefix() -> String {
    "cache:".to_string()
}

/// Single-flight lock bounds
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_wait_ms")]
    pub wait_ms: u64,
    #[serde(default = "default_lock_hold_ms")]
    pub hold_ms: u64,
    #[serde(default = "default_lock_key_prefix")]
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_lock_wait_ms(),
            hold_ms: default_lock_hold_ms(),
            key_prefix: default_lock_key_prefix(),
        }
    }
}

impl LockConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }

    pub fn with_bounds(mut self, wait: Duration, hold: Duration) -> Self {
        self.wait_ms = wait.as_millis() as u64;
        self.hold_ms = hold.as_millis() as u64;
        self
    }

    pub fn key_for(&self, id: &str) -> String {
        format!("{}{}", self.key_prefix, id)
    }
}

fn default_lock_wait_ms() -> u64 {
    3000
}

fn default_lock_hold_ms() -> u64 {
    10_000
}

fn default_lock_key_prefix() -> String {
    "lock:".to_string()
}

/// Routing engine limits
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Upper bound on consecutive pass-through hops (skipped nodes, gateways)
    #[serde(default = "default_max_skip_depth")]
    pub max_skip_depth: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_skip_depth: default_max_skip_depth(),
        }
    }
}

fn default_max_skip_depth() -> usize {
    64
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// NATS configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_nats_url")]
    pub url: String,
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

fn default_nats_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_subject_prefix() -> String {
    "flow.".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
