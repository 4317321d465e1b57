//! Static flow definitions: ordered nodes, successors and gateway metadata

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::graph::FlowGraph;
use crate::{DefinitionId, FlowError, NodeId, Result};

/// Kind of a static node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Approval,
    Gateway,
    /// Approval node whose handler may pick free-flow actions
    FreeFlow,
    SubFlow,
    Other,
}

/// How the approvers of a node are described
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    /// Explicit user id list
    User,
    /// Users holding any of the listed roles
    Role,
    /// Leaders of the listed departments
    DeptLeader,
    /// Users chosen by the initiator at start time
    Initiator,
}

/// Abstract approver description attached to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverSpec {
    pub approver_type: ApproverType,
    /// Opaque value interpreted by the strategy for `approver_type`
    #[serde(default)]
    pub value: String,
}

impl ApproverSpec {
    pub fn new(approver_type: ApproverType, value: impl Into<String>) -> Self {
        Self {
            approver_type,
            value: value.into(),
        }
    }

    pub fn users(value: impl Into<String>) -> Self {
        Self::new(ApproverType::User, value)
    }

    pub fn roles(value: impl Into<String>) -> Self {
        Self::new(ApproverType::Role, value)
    }

    pub fn dept_leaders(value: impl Into<String>) -> Self {
        Self::new(ApproverType::DeptLeader, value)
    }

    pub fn initiator() -> Self {
        Self::new(ApproverType::Initiator, "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    #[default]
    None,
    ParallelSplit,
    ParallelJoin,
    ConditionSplit,
    ConditionJoin,
}

impl GatewayType {
    pub fn is_gateway(self) -> bool {
        self != GatewayType::None
    }

    pub fn is_split(self) -> bool {
        matches!(self, GatewayType::ParallelSplit | GatewayType::ConditionSplit)
    }

    pub fn is_join(self) -> bool {
        matches!(self, GatewayType::ParallelJoin | GatewayType::ConditionJoin)
    }

    pub fn is_parallel(self) -> bool {
        matches!(self, GatewayType::ParallelSplit | GatewayType::ParallelJoin)
    }
}

/// Join semantics over sibling instances or branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    All,
    Any,
}

/// A static node of a flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    pub definition_id: DefinitionId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub approver: Option<ApproverSpec>,
    #[serde(default)]
    pub order: Option<i32>,
    /// Single successor
    #[serde(default)]
    pub next_node_id: Option<NodeId>,
    /// Multiple successors; takes precedence over `next_node_id`
    #[serde(default)]
    pub next_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub skip_condition: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub gateway_type: GatewayType,
    #[serde(default)]
    pub gateway_mode: Option<GatewayMode>,
    /// Linked split (for a join) or join (for a split)
    #[serde(default)]
    pub gateway_id: Option<NodeId>,
    /// Branch condition, evaluated when this node is a candidate of a condition split
    #[serde(default)]
    pub condition_expression: Option<String>,
    #[serde(default)]
    pub allow_free_flow: bool,
    #[serde(default)]
    pub is_last_node: bool,
}

fn default_required() -> bool {
    true
}

impl FlowNode {
    pub fn new(id: NodeId, definition_id: DefinitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            definition_id,
            name: name.into(),
            kind: NodeKind::Approval,
            approver: None,
            order: None,
            next_node_id: None,
            next_node_ids: Vec::new(),
            skip_condition: None,
            required: true,
            gateway_type: GatewayType::None,
            gateway_mode: None,
            gateway_id: None,
            condition_expression: None,
            allow_free_flow: false,
            is_last_node: false,
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_approver(mut self, approver: ApproverSpec) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_next(mut self, next: NodeId) -> Self {
        self.next_node_id = Some(next);
        self
    }

    pub fn with_successors(mut self, successors: Vec<NodeId>) -> Self {
        self.next_node_ids = successors;
        self
    }

    /// Set successors from a JSON array such as `[3, 4]`.
    pub fn with_successors_json(mut self, json: &str) -> Result<Self> {
        let trimmed = json.trim();
        self.next_node_ids = if trimmed.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(trimmed)?
        };
        Ok(self)
    }

    pub fn with_skip_condition(mut self, expression: impl Into<String>) -> Self {
        self.skip_condition = Some(expression.into());
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.condition_expression = Some(expression.into());
        self
    }

    pub fn with_gateway(mut self, gateway_type: GatewayType, mode: Option<GatewayMode>) -> Self {
        self.gateway_type = gateway_type;
        self.gateway_mode = mode;
        if gateway_type.is_gateway() {
            self.kind = NodeKind::Gateway;
        }
        self
    }

    /// Countersign (`All`) or any-sign (`Any`) on a plain approval node.
    pub fn with_parallel_mode(mut self, mode: GatewayMode) -> Self {
        self.gateway_mode = Some(mode);
        self
    }

    pub fn with_linked_gateway(mut self, gateway_id: NodeId) -> Self {
        self.gateway_id = Some(gateway_id);
        self
    }

    pub fn allowing_free_flow(mut self) -> Self {
        self.allow_free_flow = true;
        self
    }

    pub fn as_last(mut self) -> Self {
        self.is_last_node = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Join semantics applied to the instances of this node.
    ///
    /// `None` means a serial node: it advances once any of its instances finished.
    pub fn join_mode(&self) -> Option<GatewayMode> {
        match self.gateway_mode {
            Some(mode) => Some(mode),
            None if self.gateway_type.is_parallel() => Some(GatewayMode::All),
            None => None,
        }
    }

    /// Gateways without approvers are passed through by routing.
    pub fn is_pass_through(&self) -> bool {
        self.gateway_type.is_gateway() && self.approver.is_none()
    }

    /// Explicit successor edges, ignoring the legacy order fallback.
    pub fn explicit_successors(&self) -> Vec<NodeId> {
        if !self.next_node_ids.is_empty() {
            self.next_node_ids.clone()
        } else {
            self.next_node_id.into_iter().collect()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PendingEdits {
    added: Vec<FlowNode>,
    updated: Vec<FlowNode>,
    removed: HashSet<NodeId>,
}

impl PendingEdits {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// An ordered set of static nodes.
///
/// Node edits are staged and only applied by [`FlowDefinition::save`]; a
/// definition referenced by a running instance refuses edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: DefinitionId,
    pub name: String,
    enabled: bool,
    in_use: bool,
    nodes: Vec<FlowNode>,
    #[serde(default)]
    pending: PendingEdits,
}

impl FlowDefinition {
    pub fn new(id: DefinitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            in_use: false,
            nodes: Vec::new(),
            pending: PendingEdits::default(),
        }
    }

    /// Build a definition from a complete node set, validating the graph.
    pub fn with_nodes(mut self, nodes: Vec<FlowNode>) -> Result<Self> {
        for node in &nodes {
            self.check_owner(node)?;
        }
        FlowGraph::build(&nodes)?;
        self.nodes = nodes;
        self.sort_nodes();
        Ok(self)
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// The node with the lowest order number; unordered nodes come last.
    pub fn first_node(&self) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .min_by_key(|n| n.order.unwrap_or(i32::MAX))
    }

    pub fn node_by_order(&self, order: i32) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.order == Some(order))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    pub fn mark_in_use(&mut self) {
        self.in_use = true;
    }

    pub fn graph(&self) -> Result<FlowGraph> {
        Ok(FlowGraph::build(&self.nodes)?)
    }

    pub fn add_node(&mut self, node: FlowNode) -> Result<()> {
        self.ensure_editable()?;
        self.check_owner(&node)?;
        self.pending.added.push(node);
        Ok(())
    }

    pub fn update_node(&mut self, node: FlowNode) -> Result<()> {
        self.ensure_editable()?;
        self.check_owner(&node)?;
        if !self.contains(node.id) && !self.pending.added.iter().any(|n| n.id == node.id) {
            return Err(FlowError::NotFound(format!("node {} in definition {}", node.id, self.id)));
        }
        self.pending.updated.push(node);
        Ok(())
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        self.ensure_editable()?;
        self.pending.removed.insert(id);
        Ok(())
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn discard_changes(&mut self) {
        self.pending = PendingEdits::default();
    }

    /// Apply staged edits. The resulting graph must validate or nothing changes.
    pub fn save(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.ensure_editable()?;

        let mut nodes: Vec<FlowNode> = self
            .nodes
            .iter()
            .filter(|n| !self.pending.removed.contains(&n.id))
            .cloned()
            .collect();

        for added in &self.pending.added {
            if self.pending.removed.contains(&added.id) {
                continue;
            }
            nodes.push(added.clone());
        }

        for updated in &self.pending.updated {
            if let Some(slot) = nodes.iter_mut().find(|n| n.id == updated.id) {
                *slot = updated.clone();
            }
        }

        let graph = FlowGraph::build(&nodes)?;
        if let Some(cycle) = graph.cycle() {
            tracing::warn!(definition_id = self.id, cycle = %cycle, "Flow definition contains a cycle");
        }

        self.nodes = nodes;
        self.sort_nodes();
        self.pending = PendingEdits::default();

        tracing::info!(
            definition_id = self.id,
            node_count = self.nodes.len(),
            "Flow definition saved"
        );

        Ok(())
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.in_use {
            return Err(FlowError::InvalidState(format!(
                "definition {} is referenced by a running instance",
                self.id
            )));
        }
        Ok(())
    }

    fn check_owner(&self, node: &FlowNode) -> Result<()> {
        if node.definition_id != self.id {
            return Err(FlowError::ValidationFailed(format!(
                "node {} belongs to definition {}, not {}",
                node.id, node.definition_id, self.id
            )));
        }
        Ok(())
    }

    fn sort_nodes(&mut self) {
        self.nodes.sort_by_key(|n| (n.order.unwrap_or(i32::MAX), n.id));
    }
}
