//! Domain events emitted by flow instances

use chrono::{DateTime, Utc};
use flow_core::Event;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::NodeKey;
use crate::status::NodeStatus;
use crate::{DefinitionId, DocumentId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        flow_instance_id: Uuid,
        definition_id: DefinitionId,
        document_id: DocumentId,
        started_at: DateTime<Utc>,
    },
    FlowCompleted {
        flow_instance_id: Uuid,
        document_id: DocumentId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    FlowTerminated {
        flow_instance_id: Uuid,
        document_id: DocumentId,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    },
    NodeInstanceCreated {
        flow_instance_id: Uuid,
        node_instance_id: Uuid,
        node: NodeKey,
        approver_id: Option<UserId>,
        status: NodeStatus,
    },
    NodeCompleted {
        flow_instance_id: Uuid,
        node_instance_id: Uuid,
        node: NodeKey,
        approver_id: Option<UserId>,
        comments: Option<String>,
    },
}

impl FlowEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            FlowEvent::FlowStarted { .. } => "flow.started",
            FlowEvent::FlowCompleted { .. } => "flow.completed",
            FlowEvent::FlowTerminated { .. } => "flow.terminated",
            FlowEvent::NodeInstanceCreated { .. } => "node.instance_created",
            FlowEvent::NodeCompleted { .. } => "node.completed",
        }
    }

    pub fn flow_instance_id(&self) -> Uuid {
        match self {
            FlowEvent::FlowStarted { flow_instance_id, .. }
            | FlowEvent::FlowCompleted { flow_instance_id, .. }
            | FlowEvent::FlowTerminated { flow_instance_id, .. }
            | FlowEvent::NodeInstanceCreated { flow_instance_id, .. }
            | FlowEvent::NodeCompleted { flow_instance_id, .. } => *flow_instance_id,
        }
    }

    /// Wrap into the transport envelope, tagging the flow instance id.
    pub fn to_event(&self) -> Event {
        Event::new(self.event_type(), self)
            .with_metadata("flow_instance_id", self.flow_instance_id().to_string())
            .with_metadata("source", "flow-engine")
    }

    /// Decode a transport envelope produced by [`FlowEvent::to_event`].
    pub fn from_event(event: &Event) -> serde_json::Result<Self> {
        serde_json::from_value(event.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_type_and_instance() {
        let id = Uuid::new_v4();
        let event = FlowEvent::FlowStarted {
            flow_instance_id: id,
            definition_id: 1,
            document_id: 2,
            started_at: Utc::now(),
        };

        let envelope = event.to_event();
        assert_eq!(envelope.event_type, "flow.started");
        assert_eq!(envelope.metadata.get("flow_instance_id"), Some(&id.to_string()));
        assert_eq!(envelope.payload["type"], "flow_started");
        assert!(envelope.matches("flow.*"));
        assert_eq!(FlowEvent::from_event(&envelope).unwrap(), event);
    }
}
