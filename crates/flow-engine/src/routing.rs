//! Node routing engine
//!
//! Computes what happens after a static node: successor selection, gateway
//! split and join handling, skip-condition chaining and completion detection.
//!
//! Routing works on a worklist. Skipped nodes and pass-through gateways add
//! their successors back to it one level deeper; every other node is entered
//! by resolving its approvers. Depth is bounded by `max_skip_depth` so a
//! cyclic chain of skipped nodes fails with a configuration error.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::approver::ApproverResolver;
use crate::condition::ConditionEvaluator;
use crate::definition::{FlowDefinition, FlowNode, GatewayMode, GatewayType};
use crate::graph::FlowGraph;
use crate::instance::{FlowInstance, NodeKey};
use crate::node_instance::FlowNodeInstance;
use crate::{FlowError, NodeId, Result};

/// Outcome of one routing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advance {
    /// Nodes that received pending instances, in routing order
    pub entered: Vec<NodeId>,
    /// Join gateways reached whose branches have not all converged
    pub waiting: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    /// Gateways passed through without approvers
    pub passed: Vec<NodeId>,
    /// Node instances created, skipped and passed records included
    pub created: Vec<Uuid>,
    /// Some branch ran out of successors
    pub reached_end: bool,
    last_routed: Option<NodeId>,
}

impl Advance {
    /// Where the current-node pointer should move, if anywhere.
    ///
    /// The first entered node wins. When nothing was entered and a branch
    /// ended, the pointer settles on the last node routed through.
    pub fn next_pointer(&self) -> Option<NodeId> {
        match self.entered.first() {
            Some(id) => Some(*id),
            None if self.reached_end => self.last_routed,
            None => None,
        }
    }

    /// True when the pass created no pending work anywhere.
    pub fn is_idle(&self) -> bool {
        self.entered.is_empty() && self.waiting.is_empty()
    }
}

struct Step {
    node_id: NodeId,
    depth: usize,
    /// Re-entry: no skip evaluation, no join gating
    direct: bool,
}

pub struct NodeRouter {
    evaluator: Arc<dyn ConditionEvaluator>,
    resolver: Arc<ApproverResolver>,
    max_skip_depth: usize,
}

impl NodeRouter {
    pub fn new(
        evaluator: Arc<dyn ConditionEvaluator>,
        resolver: Arc<ApproverResolver>,
        max_skip_depth: usize,
    ) -> Self {
        Self {
            evaluator,
            resolver,
            max_skip_depth,
        }
    }

    pub fn max_skip_depth(&self) -> usize {
        self.max_skip_depth
    }

    /// Successors of `current`, in priority order: the multi-successor list
    /// (filtered by branch conditions on a condition split), the single
    /// successor, then the node whose order is one greater.
    pub fn next_node_ids(
        &self,
        definition: &FlowDefinition,
        current: NodeId,
        variables: &HashMap<String, Value>,
    ) -> Result<Vec<NodeId>> {
        let node = definition
            .node(current)
            .ok_or_else(|| FlowError::NotFound(format!("node {} in definition {}", current, definition.id)))?;

        if !node.next_node_ids.is_empty() {
            if node.gateway_type != GatewayType::ConditionSplit {
                return Ok(node.next_node_ids.clone());
            }

            let mut selected = Vec::new();
            for candidate in &node.next_node_ids {
                let target = definition.node(*candidate).ok_or_else(|| {
                    FlowError::Configuration(format!("node {} routes to unknown node {}", node.id, candidate))
                })?;
                let included = match target.condition_expression.as_deref() {
                    None => true,
                    Some(expr) if expr.trim().is_empty() => true,
                    Some(expr) => self.evaluator.evaluate(expr, variables),
                };
                debug!(split = node.id, candidate, included, "Condition branch evaluated");
                if included {
                    selected.push(*candidate);
                }
            }
            return Ok(selected);
        }

        if let Some(next) = node.next_node_id {
            return Ok(vec![next]);
        }

        Ok(node
            .order
            .and_then(|order| definition.node_by_order(order + 1))
            .map(|n| vec![n.id])
            .unwrap_or_default())
    }

    /// Skip-condition check; a node without one is never skipped.
    pub fn should_skip(&self, node: &FlowNode, variables: &HashMap<String, Value>) -> bool {
        match node.skip_condition.as_deref() {
            Some(expr) if !expr.trim().is_empty() => self.evaluator.evaluate(expr, variables),
            _ => false,
        }
    }

    /// Whether the latest activation of `node` lets the flow move on.
    pub fn can_advance(node: &FlowNode, flow: &FlowInstance) -> bool {
        let siblings = flow.siblings(&NodeKey::Static(node.id));
        match node.join_mode() {
            Some(GatewayMode::All) => !siblings.is_empty() && siblings.iter().all(|ni| ni.status().is_finished()),
            Some(GatewayMode::Any) | None => siblings.iter().any(|ni| ni.status().is_finished()),
        }
    }

    /// Whether the branches feeding a join gateway have converged.
    pub fn can_converge(graph: &FlowGraph, join: &FlowNode, flow: &FlowInstance) -> bool {
        let predecessors = graph.predecessors(join.id);
        if predecessors.is_empty() {
            return true;
        }

        let finished = |id: &NodeId, all: bool| {
            let siblings = flow.siblings(&NodeKey::Static(*id));
            if all {
                !siblings.is_empty() && siblings.iter().all(|ni| ni.status().is_finished())
            } else {
                siblings.iter().any(|ni| ni.status().is_finished())
            }
        };

        let wait_for_all = join.gateway_type == GatewayType::ParallelJoin && join.join_mode() != Some(GatewayMode::Any);
        if wait_for_all {
            predecessors.iter().all(|p| finished(p, true))
        } else {
            predecessors.iter().any(|p| finished(p, false))
        }
    }

    /// Whether a join already fired for the current round of its branches.
    fn join_already_fired(graph: &FlowGraph, join: &FlowNode, flow: &FlowInstance) -> bool {
        let Some(fired_at) = flow
            .instances_of(&NodeKey::Static(join.id))
            .map(|ni| ni.sequence)
            .max()
        else {
            return false;
        };

        let linked_split = join
            .gateway_id
            .and_then(|split| flow.instances_of(&NodeKey::Static(split)).map(|ni| ni.sequence).max());

        let round_started = linked_split.or_else(|| {
            graph
                .predecessors(join.id)
                .iter()
                .filter_map(|p| flow.siblings(&NodeKey::Static(*p)).iter().map(|ni| ni.sequence).min())
                .min()
        });

        match round_started {
            Some(start) => fired_at > start,
            None => true,
        }
    }

    /// Whether the flow can complete from its current position.
    pub fn can_complete(&self, definition: &FlowDefinition, flow: &FlowInstance) -> bool {
        let node_id = match flow.current() {
            None => return true,
            Some(NodeKey::Dynamic(_)) => return false,
            Some(NodeKey::Static(id)) => id,
        };
        if flow.live_instances().next().is_some() {
            return false;
        }
        let Some(node) = definition.node(node_id) else {
            return false;
        };

        if node.is_last_node {
            return Self::can_advance(node, flow);
        }

        let finished = flow
            .siblings(&NodeKey::Static(node_id))
            .iter()
            .any(|ni| ni.status().is_finished());

        finished
            && self
                .next_node_ids(definition, node_id, flow.variables().as_map())
                .map(|next| next.is_empty())
                .unwrap_or(false)
    }

    /// Enter the definition's first node, evaluating its skip condition.
    pub async fn enter_first(&self, definition: &FlowDefinition, flow: &mut FlowInstance) -> Result<Advance> {
        let first = definition
            .first_node()
            .ok_or_else(|| FlowError::Configuration(format!("definition {} has no node", definition.id)))?;
        let start = Step {
            node_id: first.id,
            depth: 0,
            direct: false,
        };
        self.route(definition, flow, vec![start]).await
    }

    /// Route onwards from a node whose activation has finished.
    pub async fn advance_from(&self, definition: &FlowDefinition, flow: &mut FlowInstance, from: NodeId) -> Result<Advance> {
        let next = self.successors_checked(definition, from, flow.variables().as_map())?;
        if next.is_empty() {
            debug!(flow_instance_id = %flow.id, node_id = from, "No successor, route ended");
            return Ok(Advance {
                reached_end: true,
                last_routed: Some(from),
                ..Advance::default()
            });
        }

        let steps = next
            .into_iter()
            .map(|node_id| Step {
                node_id,
                depth: 0,
                direct: false,
            })
            .collect();
        self.route(definition, flow, steps).await
    }

    /// Enter `target` again, bypassing its skip condition and join gating.
    pub async fn reenter(&self, definition: &FlowDefinition, flow: &mut FlowInstance, target: NodeId) -> Result<Advance> {
        let step = Step {
            node_id: target,
            depth: 0,
            direct: true,
        };
        self.route(definition, flow, vec![step]).await
    }

    /// `next_node_ids`, refusing a condition split where no branch matched.
    fn successors_checked(
        &self,
        definition: &FlowDefinition,
        from: NodeId,
        variables: &HashMap<String, Value>,
    ) -> Result<Vec<NodeId>> {
        let next = self.next_node_ids(definition, from, variables)?;
        if next.is_empty() {
            if let Some(node) = definition.node(from) {
                if node.gateway_type == GatewayType::ConditionSplit && !node.next_node_ids.is_empty() {
                    return Err(FlowError::Configuration(format!(
                        "no branch condition of split {} matched",
                        from
                    )));
                }
            }
        }
        Ok(next)
    }

    async fn route(&self, definition: &FlowDefinition, flow: &mut FlowInstance, start: Vec<Step>) -> Result<Advance> {
        let graph = definition.graph()?;
        let mut advance = Advance::default();
        let mut queue: VecDeque<Step> = start.into();

        while let Some(step) = queue.pop_front() {
            if step.depth > self.max_skip_depth {
                return Err(FlowError::Configuration(format!(
                    "routing from flow instance {} exceeded depth {} at node {}",
                    flow.id, self.max_skip_depth, step.node_id
                )));
            }

            let node = definition.node(step.node_id).ok_or_else(|| {
                FlowError::Configuration(format!(
                    "unresolved routing: node {} is not in definition {}",
                    step.node_id, definition.id
                ))
            })?;
            let key = NodeKey::Static(node.id);

            if node.gateway_type.is_join() && !step.direct {
                if Self::join_already_fired(&graph, node, flow) {
                    debug!(flow_instance_id = %flow.id, join = node.id, "Join already fired");
                    continue;
                }
                if !Self::can_converge(&graph, node, flow) {
                    debug!(flow_instance_id = %flow.id, join = node.id, "Join waiting for branches");
                    if !advance.waiting.contains(&node.id) {
                        advance.waiting.push(node.id);
                    }
                    continue;
                }
            }

            let through = if !step.direct && self.should_skip(node, flow.variables().as_map()) {
                let reason = format!(
                    "skip condition met: {}",
                    node.skip_condition.as_deref().unwrap_or_default()
                );
                advance
                    .created
                    .push(flow.add_node_instance(FlowNodeInstance::skipped(flow.id, key, reason)));
                advance.skipped.push(node.id);
                debug!(flow_instance_id = %flow.id, node_id = node.id, depth = step.depth, "Node skipped");
                true
            } else if node.is_pass_through() {
                advance
                    .created
                    .push(flow.add_node_instance(FlowNodeInstance::passed(flow.id, key)));
                advance.passed.push(node.id);
                debug!(flow_instance_id = %flow.id, node_id = node.id, gateway = ?node.gateway_type, "Gateway passed");
                true
            } else {
                false
            };

            if through {
                advance.last_routed = Some(node.id);
                let next = self.successors_checked(definition, node.id, flow.variables().as_map())?;
                if next.is_empty() {
                    advance.reached_end = true;
                }
                queue.extend(next.into_iter().map(|node_id| Step {
                    node_id,
                    depth: step.depth + 1,
                    direct: false,
                }));
                continue;
            }

            let approvers = self.resolver.assign(node, flow.variables()).await?;
            let batch = Uuid::new_v4();
            let flow_id = flow.id;
            for approver in approvers {
                let approver_id = approver.user_id;
                let id = flow.add_node_instance(FlowNodeInstance::pending(flow_id, key, batch, approver));
                info!(
                    flow_instance_id = %flow_id,
                    node_id = node.id,
                    node_instance_id = %id,
                    approver_id,
                    "Node instance created"
                );
                advance.created.push(id);
            }
            advance.entered.push(node.id);
        }

        Ok(advance)
    }
}
