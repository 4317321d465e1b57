//! Observability for the approval flow engine
//!
//! Installs the process-wide `tracing` subscriber: an env-filter plus either
//! human-readable or JSON output.

pub mod tracing_setup;

pub use tracing_setup::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}

pub type Result<T> = std::result::Result<T, ObservabilityError>;
