//! Event envelope and publisher seam for post-commit domain events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::Result;

/// Represents a domain event in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,
    /// Event type (e.g., "flow.started", "node.completed")
    pub event_type: String,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Event payload
    pub payload: serde_json::Value,
    /// Metadata for the event
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Create a new event with the given type and payload.
    pub fn new<T: Serialize>(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the event matches a given type pattern.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return self
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'));
        }
        self.event_type == pattern
    }
}

/// Publishes events after the producing transaction committed.
///
/// Delivery is at-least-once; consumers must tolerate duplicates and must not
/// assume ordering across flow instances.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: &Event) -> Result<()>;

    /// Publish a batch of events in order.
    async fn publish_batch(&self, events: &[Event]) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
