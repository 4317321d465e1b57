//! Core abstractions for the approval flow engine.
//!
//! This crate holds the seams the engine talks to without knowing the
//! backing technology:
//! - [`Cache`] for cache-aside reads
//! - [`Event`] and [`EventPublisher`] for post-commit domain events
//! - [`SingleFlightLock`] and [`with_lock`] for single-flight cache population
//! - [`FlowConfig`] for environment driven configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod lock;

pub use cache::Cache;
pub use config::{CacheConfig, FlowConfig, LockConfig, LoggingConfig, NatsConfig, RedisConfig, RoutingConfig};
pub use error::{CoreError, Result};
pub use events::{Event, EventPublisher};
pub use lock::{with_lock, LockLease, SingleFlightLock};
