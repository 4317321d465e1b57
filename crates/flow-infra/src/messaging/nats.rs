use anyhow::Context;
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use flow_core::{CoreError, Event, EventPublisher, NatsConfig};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{InfraError, Result};

#[derive(Debug, Clone)]
pub struct NatsPublisherConfig {
    pub url: String,
    pub name: Option<String>,
    pub subject_prefix: Option<String>,
    pub max_reconnect_delay: Duration,
}

impl Default for NatsPublisherConfig {
    fn default() -> Self {
        Self::from_config(&NatsConfig::default())
    }
}

impl NatsPublisherConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn from_config(config: &NatsConfig) -> Self {
        Self {
            url: config.url.clone(),
            name: Some(String::from("flow-engine")),
            subject_prefix: Some(config.subject_prefix.clone()),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_subject_prefix(mut self, prefix: Option<String>) -> Self {
        self.subject_prefix = prefix;
        self
    }

    /// Subject an event of `event_type` is published on.
    pub fn subject_for(&self, event_type: &str) -> String {
        match &self.subject_prefix {
            Some(prefix) => format!("{}events.{}", prefix, event_type),
            None => format!("events.{}", event_type),
        }
    }
}

/// Publishes flow events to NATS, one subject per event type.
#[derive(Clone)]
pub struct NatsEventPublisher {
    client: Client,
    config: NatsPublisherConfig,
}

impl NatsEventPublisher {
    pub async fn connect(config: NatsPublisherConfig) -> Result<Self> {
        info!(url = %config.url, "Connecting to NATS");

        let max_delay = config.max_reconnect_delay;
        let mut options = ConnectOptions::new().reconnect_delay_callback(move |attempts| {
            let delay = Duration::from_secs(2_u64.saturating_pow(attempts as u32)).min(max_delay);
            debug!(attempts, delay_ms = delay.as_millis() as u64, "NATS reconnect scheduled");
            delay
        });
        if let Some(name) = &config.name {
            options = options.name(name);
        }

        let client = options
            .connect(&config.url)
            .await
            .with_context(|| format!("connecting to NATS at {}", config.url))
            .map_err(|e| {
                error!(error = %format!("{:#}", e), "NATS connection failed");
                InfraError::Messaging(format!("{:#}", e))
            })?;

        info!("NATS connection established");
        Ok(Self { client, config })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Subscribe to events matching a NATS subject pattern below the prefix,
    /// e.g. `node.>`.
    pub async fn subscribe(&self, pattern: &str) -> Result<NatsEventSubscriber> {
        let subject = self.config.subject_for(pattern);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| InfraError::Messaging(format!("failed to subscribe to {}: {}", subject, e)))?;

        info!(subject = %subject, "Subscribed to flow events");
        Ok(NatsEventSubscriber { subscriber, subject })
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &Event) -> flow_core::Result<()> {
        let subject = self.config.subject_for(&event.event_type);
        let payload = serde_json::to_vec(event)?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| {
                error!(subject = %subject, error = %e, "Failed to publish event");
                CoreError::from(InfraError::Messaging(format!("failed to publish to {}: {}", subject, e)))
            })?;

        debug!(subject = %subject, event_id = %event.id, "Event published");
        Ok(())
    }
}

pub struct NatsEventSubscriber {
    subscriber: Subscriber,
    subject: String,
}

impl NatsEventSubscriber {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next event; `Ok(None)` once the subscription ends.
    pub async fn next_event(&mut self) -> Result<Option<Event>> {
        match self.subscriber.next().await {
            Some(message) => Ok(Some(serde_json::from_slice(&message.payload)?)),
            None => Ok(None),
        }
    }
}
