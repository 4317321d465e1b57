//! Flow instance aggregate
//!
//! A [`FlowInstance`] owns its lifecycle status, its current-node pointer, its
//! process variables and every node instance created under it. It is loaded,
//! mutated in memory and saved as one unit, so a failed operation never leaves
//! a partially updated flow behind.
//!
//! Domain events raised by the aggregate are buffered and drained with
//! [`FlowInstance::take_events`]; they are never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::events::FlowEvent;
use crate::free_flow::ActionType;
use crate::node_instance::FlowNodeInstance;
use crate::status::FlowStatus;
use crate::{ActionId, DefinitionId, DocumentId, FlowError, NodeId, Result, UserId};

/// Order number given to free-flow nodes so they never collide with static ordering.
pub const FREE_FLOW_ORDER: i32 = 9999;

/// Variable holding approver ids chosen by the initiator.
pub const APPROVER_IDS_VAR: &str = "approverIds";

/// Variable holding the user who started the flow.
pub const INITIATOR_ID_VAR: &str = "initiatorId";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMode {
    /// Follows the static graph only
    Fixed,
    /// Every step after the first is chosen with free-flow actions
    Free,
    /// Static graph with free-flow detours
    Mixed,
}

/// Identifies the step a node instance belongs to.
///
/// Static nodes come from the definition graph; dynamic nodes are created by
/// free-flow actions and are never subject to static routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKey {
    Static(NodeId),
    Dynamic(Uuid),
}

impl NodeKey {
    pub fn static_id(&self) -> Option<NodeId> {
        match self {
            NodeKey::Static(id) => Some(*id),
            NodeKey::Dynamic(_) => None,
        }
    }

    pub fn dynamic_id(&self) -> Option<Uuid> {
        match self {
            NodeKey::Static(_) => None,
            NodeKey::Dynamic(id) => Some(*id),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, NodeKey::Dynamic(_))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKey::Static(id) => write!(f, "static:{}", id),
            NodeKey::Dynamic(id) => write!(f, "dynamic:{}", id),
        }
    }
}

/// An ephemeral node created by a free-flow action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicNode {
    pub id: Uuid,
    pub action_id: ActionId,
    pub action_name: String,
    pub action_type: ActionType,
    pub order: i32,
    /// Static node the free-flow detour started from
    #[serde(default)]
    pub origin: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl DynamicNode {
    pub fn new(
        action_id: ActionId,
        action_name: impl Into<String>,
        action_type: ActionType,
        origin: Option<NodeId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            action_name: action_name.into(),
            action_type,
            order: FREE_FLOW_ORDER,
            origin,
            created_at: Utc::now(),
        }
    }
}

/// Copy-on-write variable bag shared between snapshots until first write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessVariables(Arc<HashMap<String, Value>>);

impl ProcessVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Self(Arc::new(map))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.0).insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        if !self.0.contains_key(key) {
            return None;
        }
        Arc::make_mut(&mut self.0).remove(key)
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether two bags still share storage.
    pub fn shares_storage_with(&self, other: &ProcessVariables) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: Uuid,
    pub definition_id: DefinitionId,
    pub document_id: DocumentId,
    pub flow_type: String,
    pub mode: FlowMode,
    status: FlowStatus,
    current: Option<NodeKey>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    variables: ProcessVariables,
    #[serde(default)]
    node_instances: Vec<FlowNodeInstance>,
    #[serde(default)]
    dynamic_nodes: Vec<DynamicNode>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    next_sequence: u64,
    #[serde(skip)]
    events: Vec<FlowEvent>,
}

impl FlowInstance {
    /// Create a running flow and raise `FlowStarted`.
    pub fn start(
        definition_id: DefinitionId,
        document_id: DocumentId,
        flow_type: impl Into<String>,
        mode: FlowMode,
        variables: ProcessVariables,
    ) -> Self {
        let started_at = Utc::now();
        let id = Uuid::new_v4();
        let mut flow = Self {
            id,
            definition_id,
            document_id,
            flow_type: flow_type.into(),
            mode,
            status: FlowStatus::Processing,
            current: None,
            parent_id: None,
            variables,
            node_instances: Vec::new(),
            dynamic_nodes: Vec::new(),
            started_at,
            ended_at: None,
            version: 0,
            next_sequence: 0,
            events: Vec::new(),
        };
        flow.events.push(FlowEvent::FlowStarted {
            flow_instance_id: id,
            definition_id,
            document_id,
            started_at,
        });
        flow
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    pub fn current(&self) -> Option<NodeKey> {
        self.current
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Sequence the next node instance will receive.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn ensure_can_proceed(&self, operation: &str) -> Result<()> {
        if !self.status.can_proceed() {
            return Err(FlowError::InvalidState(format!(
                "cannot {} flow instance {} in status {}",
                operation, self.id, self.status
            )));
        }
        Ok(())
    }

    // ---- lifecycle ----

    pub fn complete(&mut self) -> Result<()> {
        self.ensure_can_proceed("complete")?;
        let ended_at = self.finish(FlowStatus::Completed);
        self.events.push(FlowEvent::FlowCompleted {
            flow_instance_id: self.id,
            document_id: self.document_id,
            started_at: self.started_at,
            ended_at,
        });
        Ok(())
    }

    pub fn terminate(&mut self) -> Result<()> {
        self.ensure_can_proceed("terminate")?;
        let ended_at = self.finish(FlowStatus::Terminated);
        self.events.push(FlowEvent::FlowTerminated {
            flow_instance_id: self.id,
            document_id: self.document_id,
            started_at: self.started_at,
            ended_at,
        });
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_can_proceed("cancel")?;
        self.finish(FlowStatus::Cancelled);
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<()> {
        if self.status != FlowStatus::Processing {
            return Err(FlowError::InvalidState(format!(
                "cannot suspend flow instance {} in status {}",
                self.id, self.status
            )));
        }
        self.status = FlowStatus::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.status != FlowStatus::Suspended {
            return Err(FlowError::InvalidState(format!(
                "cannot resume flow instance {} in status {}",
                self.id, self.status
            )));
        }
        self.status = FlowStatus::Processing;
        Ok(())
    }

    fn finish(&mut self, status: FlowStatus) -> DateTime<Utc> {
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        now
    }

    pub fn move_to(&mut self, node: NodeKey) {
        self.current = Some(node);
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    // ---- variables ----

    pub fn variables(&self) -> &ProcessVariables {
        &self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.set(key, value);
    }

    pub fn initiator_id(&self) -> Option<UserId> {
        match self.variables.get(INITIATOR_ID_VAR)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    // ---- node instances ----

    pub fn node_instances(&self) -> &[FlowNodeInstance] {
        &self.node_instances
    }

    pub fn node_instance(&self, id: Uuid) -> Option<&FlowNodeInstance> {
        self.node_instances.iter().find(|ni| ni.id == id)
    }

    /// Attach a node instance, stamping its creation sequence.
    pub fn add_node_instance(&mut self, mut instance: FlowNodeInstance) -> Uuid {
        instance.flow_instance_id = self.id;
        instance.sequence = self.next_sequence;
        self.next_sequence += 1;

        let id = instance.id;
        self.events.push(FlowEvent::NodeInstanceCreated {
            flow_instance_id: self.id,
            node_instance_id: id,
            node: instance.node,
            approver_id: instance.approver_id(),
            status: instance.status(),
        });
        self.node_instances.push(instance);
        id
    }

    pub fn complete_node(&mut self, id: Uuid, comments: Option<String>) -> Result<()> {
        let idx = self.index_of(id)?;
        let instance = &mut self.node_instances[idx];
        instance.complete(comments)?;

        let event = FlowEvent::NodeCompleted {
            flow_instance_id: self.id,
            node_instance_id: id,
            node: instance.node,
            approver_id: instance.approver_id(),
            comments: instance.comments.clone(),
        };
        self.events.push(event);
        Ok(())
    }

    pub fn reject_node(&mut self, id: Uuid, comments: Option<String>) -> Result<()> {
        let idx = self.index_of(id)?;
        self.node_instances[idx].reject(comments)
    }

    pub fn skip_node(&mut self, id: Uuid, reason: &str) -> Result<()> {
        let idx = self.index_of(id)?;
        self.node_instances[idx].skip(reason)
    }

    fn index_of(&self, id: Uuid) -> Result<usize> {
        self.node_instances
            .iter()
            .position(|ni| ni.id == id)
            .ok_or_else(|| FlowError::NotFound(format!("node instance {} in flow {}", id, self.id)))
    }

    pub fn instances_of<'a>(&'a self, node: &NodeKey) -> impl Iterator<Item = &'a FlowNodeInstance> + 'a {
        let node = *node;
        self.node_instances.iter().filter(move |ni| ni.node == node)
    }

    /// Batch of the most recently created instance of `node`.
    pub fn latest_batch(&self, node: &NodeKey) -> Option<Uuid> {
        self.instances_of(node).max_by_key(|ni| ni.sequence).map(|ni| ni.batch)
    }

    /// Instances of the latest activation of `node`.
    pub fn siblings(&self, node: &NodeKey) -> Vec<&FlowNodeInstance> {
        match self.latest_batch(node) {
            Some(batch) => self
                .instances_of(node)
                .filter(|ni| ni.batch == batch)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn live_instances(&self) -> impl Iterator<Item = &FlowNodeInstance> {
        self.node_instances.iter().filter(|ni| ni.is_live())
    }

    pub fn has_live_instance(&self, node: &NodeKey) -> bool {
        self.instances_of(node).any(|ni| ni.is_live())
    }

    /// Skip the still-live siblings of `node`. Returns how many were closed.
    pub fn close_live_siblings(&mut self, node: &NodeKey, reason: &str) -> Result<usize> {
        let Some(batch) = self.latest_batch(node) else {
            return Ok(0);
        };
        let mut closed = 0;
        for instance in self
            .node_instances
            .iter_mut()
            .filter(|ni| ni.node == *node && ni.batch == batch && ni.is_live())
        {
            instance.skip(reason)?;
            closed += 1;
        }
        Ok(closed)
    }

    /// Skip every live instance. History is appended, never rewritten.
    pub fn close_all_live(&mut self, reason: &str) -> Result<usize> {
        let mut closed = 0;
        for instance in self.node_instances.iter_mut().filter(|ni| ni.is_live()) {
            instance.skip(reason)?;
            closed += 1;
        }
        Ok(closed)
    }

    /// Most recent instance created before `sequence` that had an approver.
    pub fn previous_assigned(&self, sequence: u64) -> Option<&FlowNodeInstance> {
        self.node_instances
            .iter()
            .filter(|ni| ni.sequence < sequence && ni.approver.is_some())
            .max_by_key(|ni| ni.sequence)
    }

    /// True when `user_id` holds a handleable instance of `node`.
    pub fn has_approval_permission(&self, user_id: UserId, node: &NodeKey) -> bool {
        self.instances_of(node)
            .any(|ni| ni.is_assigned_to(user_id) && ni.status().can_handle())
    }

    // ---- dynamic nodes ----

    pub fn dynamic_nodes(&self) -> &[DynamicNode] {
        &self.dynamic_nodes
    }

    pub fn dynamic_node(&self, id: Uuid) -> Option<&DynamicNode> {
        self.dynamic_nodes.iter().find(|n| n.id == id)
    }

    pub fn add_dynamic_node(&mut self, node: DynamicNode) -> NodeKey {
        let key = NodeKey::Dynamic(node.id);
        self.dynamic_nodes.push(node);
        key
    }

    // ---- events ----

    pub fn pending_events(&self) -> &[FlowEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }
}
