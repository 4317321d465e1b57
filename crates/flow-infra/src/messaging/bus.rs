//! In-process event bus
//!
//! Fans published events out to every subscriber over a Tokio broadcast
//! channel. Subscribers may filter by event type pattern (`*`, `node.*`,
//! or an exact type).

use async_trait::async_trait;
use flow_core::{Event, EventPublisher, Result};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_pattern("*")
    }

    pub fn subscribe_pattern(&self, pattern: impl Into<String>) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            pattern: pattern.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, event: &Event) -> Result<()> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => debug!(event_type = %event.event_type, receivers, "Event published"),
            Err(_) => debug!(event_type = %event.event_type, "Event published with no subscribers"),
        }
        Ok(())
    }
}

/// A subscriber's view of the bus
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    pattern: String,
}

impl EventSubscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching event; `None` once the bus is gone.
    ///
    /// A subscriber that falls behind skips the overwritten events and
    /// carries on with the oldest retained one.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.matches(&self.pattern) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, pattern = %self.pattern, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Matching events already buffered, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.matches(&self.pattern) => events.push(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, pattern = %self.pattern, "Event subscriber lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pattern_subscription_filters() {
        let bus = InMemoryEventBus::default();
        let mut all = bus.subscribe();
        let mut nodes = bus.subscribe_pattern("node.*");

        bus.publish(&Event::new("flow.started", json!({}))).await.unwrap();
        bus.publish(&Event::new("node.completed", json!({}))).await.unwrap();

        let seen: Vec<_> = all.drain().into_iter().map(|e| e.event_type).collect();
        assert_eq!(seen, vec!["flow.started", "node.completed"]);
        assert_eq!(nodes.recv().await.map(|e| e.event_type), Some("node.completed".to_string()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = InMemoryEventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish(&Event::new("flow.completed", json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let bus = InMemoryEventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish(&Event::new("node.instance_created", json!({ "i": i })))
                .await
                .unwrap();
        }

        let received = sub.drain();
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].payload["i"], 4);
    }
}
