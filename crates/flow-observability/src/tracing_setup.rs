//! Tracing subscriber setup

use crate::{ObservabilityError, Result};
use flow_core::LoggingConfig;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Tracing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Service name recorded in the startup line
    pub service_name: String,
    pub service_version: String,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    pub json_logs: bool,
    /// Emit span enter/exit events
    pub span_events: bool,
    pub colored_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "flow-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            span_events: false,
            colored_output: true,
        }
    }
}

impl TracingConfig {
    pub fn production() -> Self {
        Self {
            json_logs: true,
            colored_output: false,
            ..Default::default()
        }
    }

    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            log_level: logging.level.clone(),
            json_logs: logging.json,
            colored_output: !logging.json,
            ..Default::default()
        }
    }

    pub fn with_service_name(mut self, name: &str) -> Self {
        self.service_name = name.to_string();
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.filter());

    if config.json_logs {
        let fmt_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        subscriber
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    } else {
        let mut layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);

        if config.span_events {
            layer = layer.with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);
        }

        if !config.colored_output {
            layer = layer.with_ansi(false);
        }

        subscriber
            .with(layer)
            .try_init()
            .map_err(|e| ObservabilityError::TracingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Tracing initialized"
    );

    Ok(())
}
