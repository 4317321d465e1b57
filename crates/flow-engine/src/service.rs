//! Flow lifecycle service
//!
//! Each operation loads one flow instance, transitions a private copy in
//! memory and persists it with a single versioned save. Nothing is written
//! when any step fails. Domain events are returned to the caller and handed
//! to the publisher only after the save succeeded.

use flow_core::{EventPublisher, RoutingConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approver::ApproverResolver;
use crate::collaborators::{
    ActionCatalog, DefinitionRepository, DocumentInfo, DocumentLookup, FlowRepository, OrgDirectory, UserRef,
};
use crate::condition::{ConditionEvaluator, ExpressionEvaluator};
use crate::definition::FlowDefinition;
use crate::events::FlowEvent;
use crate::free_flow::{ActionSelection, ApproverScope, FlowAction, FreeFlowEngine};
use crate::instance::{FlowInstance, FlowMode, NodeKey, ProcessVariables, APPROVER_IDS_VAR, INITIATOR_ID_VAR};
use crate::node_instance::{Approver, FlowNodeInstance};
use crate::read::CacheInvalidator;
use crate::routing::{Advance, NodeRouter};
use crate::status::FlowStatus;
use crate::{ActionId, DefinitionId, DocumentId, FlowError, NodeId, Result, UserId};

/// Request to start a flow for a document
#[derive(Debug, Clone)]
pub struct StartFlow {
    pub definition_id: DefinitionId,
    pub document_id: DocumentId,
    pub initiator_id: UserId,
    pub flow_type: String,
    pub mode: FlowMode,
    pub variables: HashMap<String, Value>,
    pub parent_id: Option<Uuid>,
}

impl StartFlow {
    pub fn new(definition_id: DefinitionId, document_id: DocumentId, initiator_id: UserId) -> Self {
        Self {
            definition_id,
            document_id,
            initiator_id,
            flow_type: "approval".to_string(),
            mode: FlowMode::Fixed,
            variables: HashMap::new(),
            parent_id: None,
        }
    }

    pub fn with_type(mut self, flow_type: impl Into<String>) -> Self {
        self.flow_type = flow_type.into();
        self
    }

    pub fn with_mode(mut self, mode: FlowMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Approvers for nodes resolved from the initiator's selection.
    pub fn with_approver_ids(self, user_ids: &[UserId]) -> Self {
        self.with_variable(APPROVER_IDS_VAR, Value::from(user_ids.to_vec()))
    }

    pub fn as_child_of(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

/// Result of a committed lifecycle operation
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    /// The flow as persisted, carrying its new version
    pub flow: FlowInstance,
    /// Events raised by the operation, in order
    pub events: Vec<FlowEvent>,
    /// Node instances created by the operation, skipped and gateway records included
    pub created_node_instances: Vec<Uuid>,
}

impl FlowOutcome {
    pub fn completed(&self) -> bool {
        self.flow.status() == FlowStatus::Completed
    }
}

pub struct FlowService {
    definitions: Arc<dyn DefinitionRepository>,
    flows: Arc<dyn FlowRepository>,
    documents: Arc<dyn DocumentLookup>,
    directory: Arc<dyn OrgDirectory>,
    evaluator: Arc<dyn ConditionEvaluator>,
    resolver: Arc<ApproverResolver>,
    router: NodeRouter,
    free_flow: FreeFlowEngine,
    publisher: Option<Arc<dyn EventPublisher>>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl FlowService {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        flows: Arc<dyn FlowRepository>,
        documents: Arc<dyn DocumentLookup>,
        directory: Arc<dyn OrgDirectory>,
        catalog: Arc<dyn ActionCatalog>,
    ) -> Self {
        let evaluator: Arc<dyn ConditionEvaluator> = Arc::new(ExpressionEvaluator::new());
        let resolver = Arc::new(ApproverResolver::new(directory.clone()));
        let router = NodeRouter::new(
            evaluator.clone(),
            resolver.clone(),
            RoutingConfig::default().max_skip_depth,
        );
        let free_flow = FreeFlowEngine::new(catalog, directory.clone());

        Self {
            definitions,
            flows,
            documents,
            directory,
            evaluator,
            resolver,
            router,
            free_flow,
            publisher: None,
            invalidator: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_cache_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.router = NodeRouter::new(evaluator.clone(), self.resolver.clone(), self.router.max_skip_depth());
        self.evaluator = evaluator;
        self
    }

    pub fn with_resolver(mut self, resolver: ApproverResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self.router = NodeRouter::new(self.evaluator.clone(), self.resolver.clone(), self.router.max_skip_depth());
        self
    }

    pub fn with_routing_config(mut self, config: &RoutingConfig) -> Self {
        self.router = NodeRouter::new(self.evaluator.clone(), self.resolver.clone(), config.max_skip_depth);
        self
    }

    pub fn router(&self) -> &NodeRouter {
        &self.router
    }

    // ---- lifecycle ----

    /// Start a flow and enter the definition's first node.
    pub async fn start(&self, request: StartFlow) -> Result<FlowOutcome> {
        let mut definition = self.definition(request.definition_id).await?;
        if !definition.is_enabled() {
            return Err(FlowError::InvalidState(format!(
                "definition {} is disabled",
                definition.id
            )));
        }
        self.document(request.document_id).await?;

        let mut variables = ProcessVariables::from_map(request.variables);
        variables.set(INITIATOR_ID_VAR, Value::from(request.initiator_id));

        let mut flow = FlowInstance::start(
            definition.id,
            request.document_id,
            request.flow_type,
            request.mode,
            variables,
        );
        if let Some(parent_id) = request.parent_id {
            flow = flow.with_parent(parent_id);
        }

        let advance = self.router.enter_first(&definition, &mut flow).await?;
        self.settle(&definition, &mut flow, &advance)?;

        info!(
            flow_instance_id = %flow.id,
            definition_id = definition.id,
            document_id = flow.document_id,
            initiator_id = request.initiator_id,
            "Flow started"
        );
        let outcome = self.commit(flow, advance.created).await?;

        // only a committed flow locks the definition against edits
        if !definition.is_in_use() {
            definition.mark_in_use();
            if let Err(e) = self.definitions.save(&definition).await {
                warn!(definition_id = definition.id, error = %e, "Failed to mark definition in use");
            }
        }

        Ok(outcome)
    }

    /// Approve a node instance and route onwards once its node may advance.
    pub async fn approve(
        &self,
        node_instance_id: Uuid,
        operator_id: UserId,
        comments: Option<String>,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow_of(node_instance_id).await?;
        let current = Self::handleable(&flow, node_instance_id, operator_id, "approve")?;
        let definition = self.definition(flow.definition_id).await?;

        flow.complete_node(node_instance_id, comments)?;
        info!(
            flow_instance_id = %flow.id,
            node_instance_id = %node_instance_id,
            operator_id,
            "Node instance approved"
        );

        let mut created = Vec::new();
        match current.node {
            NodeKey::Static(node_id) => {
                let node = definition.node(node_id).ok_or_else(|| {
                    FlowError::Configuration(format!("node {} is not in definition {}", node_id, definition.id))
                })?;
                if !NodeRouter::can_advance(node, &flow) {
                    debug!(flow_instance_id = %flow.id, node_id, "Waiting for sibling approvals");
                    return self.commit(flow, created).await;
                }
                let closed = flow.close_live_siblings(&current.node, "closed after sibling approval")?;
                if closed > 0 {
                    debug!(flow_instance_id = %flow.id, node_id, closed, "Live siblings closed");
                }
                let advance = self.router.advance_from(&definition, &mut flow, node_id).await?;
                self.settle(&definition, &mut flow, &advance)?;
                created = advance.created;
            }
            NodeKey::Dynamic(dynamic_id) => {
                if flow.has_live_instance(&current.node) {
                    debug!(flow_instance_id = %flow.id, dynamic_node = %dynamic_id, "Waiting for free-flow approvals");
                    return self.commit(flow, created).await;
                }
                let origin = flow.dynamic_node(dynamic_id).and_then(|n| n.origin);
                match (flow.mode, origin) {
                    (FlowMode::Fixed | FlowMode::Mixed, Some(origin)) => {
                        let advance = self.router.advance_from(&definition, &mut flow, origin).await?;
                        self.settle(&definition, &mut flow, &advance)?;
                        created = advance.created;
                    }
                    _ => {
                        flow.complete()?;
                        info!(flow_instance_id = %flow.id, "Flow completed");
                    }
                }
            }
        }

        self.commit(flow, created).await
    }

    /// Reject a node instance. With a target the flow re-enters that node,
    /// otherwise it terminates.
    pub async fn reject(
        &self,
        node_instance_id: Uuid,
        operator_id: UserId,
        comments: Option<String>,
        rollback_to: Option<NodeId>,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow_of(node_instance_id).await?;
        Self::handleable(&flow, node_instance_id, operator_id, "reject")?;
        let definition = self.definition(flow.definition_id).await?;
        if let Some(target) = rollback_to {
            Self::ensure_reached(&flow, &definition, target)?;
        }

        flow.reject_node(node_instance_id, comments)?;

        let created = match rollback_to {
            Some(target) => {
                flow.close_all_live(&format!("rejected back to node {}", target))?;
                let advance = self.router.reenter(&definition, &mut flow, target).await?;
                self.settle(&definition, &mut flow, &advance)?;
                info!(flow_instance_id = %flow.id, operator_id, target, "Node instance rejected, rolled back");
                advance.created
            }
            None => {
                flow.close_all_live("flow rejected")?;
                flow.terminate()?;
                info!(flow_instance_id = %flow.id, operator_id, "Node instance rejected, flow terminated");
                Vec::new()
            }
        };

        self.commit(flow, created).await
    }

    /// Hand a pending instance to another user within the same activation.
    pub async fn forward(
        &self,
        node_instance_id: Uuid,
        operator_id: UserId,
        target_user_id: UserId,
        comments: Option<String>,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow_of(node_instance_id).await?;
        let current = Self::handleable(&flow, node_instance_id, operator_id, "forward")?;

        let target = self
            .directory
            .user(target_user_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("user {}", target_user_id)))?;
        if flow
            .siblings(&current.node)
            .iter()
            .any(|ni| ni.is_live() && ni.is_assigned_to(target.id))
        {
            return Err(FlowError::ValidationFailed(format!(
                "user {} already holds {}",
                target.id, current.node
            )));
        }

        let reason = match comments {
            Some(c) => format!("forwarded to user {}: {}", target.id, c),
            None => format!("forwarded to user {}", target.id),
        };
        flow.skip_node(node_instance_id, &reason)?;

        let approver = match target.dept_id {
            Some(dept_id) => Approver::new(target.id).in_dept(dept_id),
            None => Approver::new(target.id),
        };
        let mut transferred = FlowNodeInstance::pending(flow.id, current.node, current.batch, approver);
        if let Some(detail) = current.free_flow.clone() {
            transferred = transferred.with_free_flow(detail);
        }
        let id = flow.add_node_instance(transferred);

        info!(
            flow_instance_id = %flow.id,
            node_instance_id = %node_instance_id,
            operator_id,
            target_user_id,
            "Node instance forwarded"
        );
        self.commit(flow, vec![id]).await
    }

    /// Send the flow back to a node it already passed through.
    ///
    /// Every live instance is closed as skipped and `target` is entered again
    /// with fresh approvers. History is appended, never rewritten.
    pub async fn rollback(
        &self,
        flow_instance_id: Uuid,
        operator_id: UserId,
        target: NodeId,
        comments: Option<String>,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow(flow_instance_id).await?;
        Self::ensure_processing(&flow, "roll back")?;

        let holds_task = flow.live_instances().any(|ni| ni.is_assigned_to(operator_id));
        if !holds_task && flow.initiator_id() != Some(operator_id) {
            return Err(FlowError::Unauthorized(format!(
                "user {} may not roll back flow instance {}",
                operator_id, flow.id
            )));
        }

        let definition = self.definition(flow.definition_id).await?;
        Self::ensure_reached(&flow, &definition, target)?;

        let reason = match comments {
            Some(c) => format!("rolled back to node {}: {}", target, c),
            None => format!("rolled back to node {}", target),
        };
        let closed = flow.close_all_live(&reason)?;
        let advance = self.router.reenter(&definition, &mut flow, target).await?;
        self.settle(&definition, &mut flow, &advance)?;

        info!(flow_instance_id = %flow.id, operator_id, target, closed, "Flow rolled back");
        self.commit(flow, advance.created).await
    }

    /// Cancel an in-flight flow on behalf of its initiator.
    pub async fn withdraw(&self, flow_instance_id: Uuid, operator_id: UserId) -> Result<FlowOutcome> {
        let mut flow = self.flow(flow_instance_id).await?;
        flow.ensure_can_proceed("withdraw")?;
        if flow.initiator_id() != Some(operator_id) {
            return Err(FlowError::Unauthorized(format!(
                "only the initiator may withdraw flow instance {}",
                flow.id
            )));
        }

        let closed = flow.close_all_live("withdrawn by initiator")?;
        flow.cancel()?;

        info!(flow_instance_id = %flow.id, operator_id, closed, "Flow withdrawn");
        self.commit(flow, Vec::new()).await
    }

    pub async fn suspend(&self, flow_instance_id: Uuid) -> Result<FlowOutcome> {
        let mut flow = self.flow(flow_instance_id).await?;
        flow.suspend()?;
        info!(flow_instance_id = %flow.id, "Flow suspended");
        self.commit(flow, Vec::new()).await
    }

    pub async fn resume(&self, flow_instance_id: Uuid) -> Result<FlowOutcome> {
        let mut flow = self.flow(flow_instance_id).await?;
        flow.resume()?;
        info!(flow_instance_id = %flow.id, "Flow resumed");
        self.commit(flow, Vec::new()).await
    }

    // ---- free flow ----

    /// Apply a free-flow action from the node instance the operator holds.
    pub async fn execute_action(
        &self,
        node_instance_id: Uuid,
        operator_id: UserId,
        selection: ActionSelection,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow_of(node_instance_id).await?;
        Self::ensure_processing(&flow, "execute a free-flow action on")?;

        let operator = self.operator(operator_id).await?;
        let document = self.document(flow.document_id).await?;
        let definition = self.definition(flow.definition_id).await?;
        let static_node = flow
            .node_instance(node_instance_id)
            .and_then(|ni| ni.node_id())
            .and_then(|id| definition.node(id));

        let created = self
            .free_flow
            .execute(&mut flow, node_instance_id, &selection, &operator, &document, static_node)
            .await?;
        self.commit(flow, created).await
    }

    /// Actions the operator may pick for the flow's document, best priority first.
    pub async fn available_actions(&self, flow_instance_id: Uuid, operator_id: UserId) -> Result<Vec<FlowAction>> {
        let flow = self.flow(flow_instance_id).await?;
        let operator = self.operator(operator_id).await?;
        let document = self.document(flow.document_id).await?;
        self.free_flow
            .available_actions(document.status, &operator.roles, operator.dept_id)
            .await
    }

    /// Users an action would offer as approvers to the operator.
    pub async fn available_approvers(
        &self,
        flow_instance_id: Uuid,
        action_id: ActionId,
        operator_id: UserId,
    ) -> Result<Vec<UserRef>> {
        let flow = self.flow(flow_instance_id).await?;
        let operator = self.operator(operator_id).await?;
        let action = self
            .free_flow
            .action(action_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("action {}", action_id)))?;
        self.free_flow.available_approvers(&action, &operator, &flow).await
    }

    pub async fn approver_scope(&self, action_id: ActionId) -> Result<ApproverScope> {
        self.free_flow.approver_scope(action_id).await
    }

    // ---- variables and queries ----

    pub async fn set_variable(
        &self,
        flow_instance_id: Uuid,
        key: impl Into<String>,
        value: Value,
    ) -> Result<FlowOutcome> {
        let mut flow = self.flow(flow_instance_id).await?;
        flow.ensure_can_proceed("set a variable on")?;
        let key = key.into();
        debug!(flow_instance_id = %flow.id, key = %key, "Process variable set");
        flow.set_variable(key, value);
        self.commit(flow, Vec::new()).await
    }

    pub async fn variable(&self, flow_instance_id: Uuid, key: &str) -> Result<Option<Value>> {
        let flow = self.flow(flow_instance_id).await?;
        Ok(flow.variable(key).cloned())
    }

    pub async fn get(&self, flow_instance_id: Uuid) -> Result<Option<FlowInstance>> {
        self.flows.find(flow_instance_id).await
    }

    pub async fn flows_for_document(&self, document_id: DocumentId) -> Result<Vec<FlowInstance>> {
        self.flows.find_by_document(document_id).await
    }

    /// True when `user_id` may act on the latest activation of `node`.
    pub async fn has_approval_permission(&self, flow_instance_id: Uuid, user_id: UserId, node: NodeKey) -> Result<bool> {
        let flow = self.flow(flow_instance_id).await?;
        Ok(flow.has_approval_permission(user_id, &node))
    }

    // ---- internals ----

    /// Move the pointer after a routing pass and complete the flow when
    /// nothing is left to do.
    fn settle(&self, definition: &FlowDefinition, flow: &mut FlowInstance, advance: &Advance) -> Result<()> {
        if let Some(node_id) = advance.next_pointer() {
            flow.move_to(NodeKey::Static(node_id));
        }
        if advance.is_idle() && self.router.can_complete(definition, flow) {
            flow.complete()?;
            info!(flow_instance_id = %flow.id, "Flow completed");
        }
        Ok(())
    }

    async fn commit(&self, mut flow: FlowInstance, created: Vec<Uuid>) -> Result<FlowOutcome> {
        let events = flow.take_events();
        let version = self.flows.save(&flow).await?;
        flow.set_version(version);
        debug!(flow_instance_id = %flow.id, version, events = events.len(), "Flow committed");

        if let Some(publisher) = &self.publisher {
            let envelopes: Vec<_> = events.iter().map(FlowEvent::to_event).collect();
            if let Err(e) = publisher.publish_batch(&envelopes).await {
                warn!(flow_instance_id = %flow.id, error = %e, "Failed to publish flow events");
            }
        }

        if let Some(invalidator) = &self.invalidator {
            invalidator.evict(flow.id).await;
        }

        if events.iter().any(|e| matches!(e, FlowEvent::FlowCompleted { .. })) {
            if let Err(e) = self.documents.publish(flow.document_id).await {
                warn!(
                    flow_instance_id = %flow.id,
                    document_id = flow.document_id,
                    error = %e,
                    "Document publication failed after flow completion"
                );
            }
        }

        Ok(FlowOutcome {
            flow,
            events,
            created_node_instances: created,
        })
    }

    fn ensure_processing(flow: &FlowInstance, operation: &str) -> Result<()> {
        if flow.status() != FlowStatus::Processing {
            return Err(FlowError::InvalidState(format!(
                "cannot {} flow instance {} in status {}",
                operation,
                flow.id,
                flow.status()
            )));
        }
        Ok(())
    }

    /// A rollback target must be a node of the definition the flow already passed through.
    fn ensure_reached(flow: &FlowInstance, definition: &FlowDefinition, target: NodeId) -> Result<()> {
        if !definition.contains(target) {
            return Err(FlowError::NotFound(format!(
                "rollback target {} in definition {}",
                target, definition.id
            )));
        }
        if flow.instances_of(&NodeKey::Static(target)).next().is_none() {
            return Err(FlowError::InvalidState(format!(
                "flow instance {} never reached node {}",
                flow.id, target
            )));
        }
        Ok(())
    }

    /// The instance `operator_id` wants to act on, checked for ownership and status.
    fn handleable(
        flow: &FlowInstance,
        node_instance_id: Uuid,
        operator_id: UserId,
        operation: &str,
    ) -> Result<FlowNodeInstance> {
        Self::ensure_processing(flow, operation)?;
        let instance = flow
            .node_instance(node_instance_id)
            .ok_or_else(|| FlowError::NotFound(format!("node instance {}", node_instance_id)))?;
        if !instance.is_assigned_to(operator_id) {
            return Err(FlowError::Unauthorized(format!(
                "user {} is not the approver of node instance {}",
                operator_id, node_instance_id
            )));
        }
        if !instance.status().can_handle() {
            return Err(FlowError::InvalidState(format!(
                "cannot {} node instance {} in status {}",
                operation,
                node_instance_id,
                instance.status()
            )));
        }
        Ok(instance.clone())
    }

    async fn flow(&self, id: Uuid) -> Result<FlowInstance> {
        self.flows
            .find(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("flow instance {}", id)))
    }

    async fn flow_of(&self, node_instance_id: Uuid) -> Result<FlowInstance> {
        self.flows
            .find_by_node_instance(node_instance_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("node instance {}", node_instance_id)))
    }

    async fn definition(&self, id: DefinitionId) -> Result<FlowDefinition> {
        self.definitions
            .find(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("definition {}", id)))
    }

    async fn document(&self, id: DocumentId) -> Result<DocumentInfo> {
        self.documents
            .get(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("document {}", id)))
    }

    async fn operator(&self, id: UserId) -> Result<UserRef> {
        self.directory
            .user(id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("user {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        MockActionCatalog, MockDefinitionRepository, MockDocumentLookup, MockFlowRepository, MockOrgDirectory,
    };
    use crate::definition::{ApproverSpec, FlowNode};
    use crate::ErrorKind;

    fn service(
        definitions: MockDefinitionRepository,
        flows: MockFlowRepository,
        documents: MockDocumentLookup,
    ) -> FlowService {
        FlowService::new(
            Arc::new(definitions),
            Arc::new(flows),
            Arc::new(documents),
            Arc::new(MockOrgDirectory::new()),
            Arc::new(MockActionCatalog::new()),
        )
    }

    fn definition() -> FlowDefinition {
        FlowDefinition::new(1, "leave")
            .with_nodes(vec![FlowNode::new(1, 1, "review")
                .with_order(1)
                .with_approver(ApproverSpec::users("7"))])
            .unwrap()
    }

    #[test]
    fn test_start_request_builder() {
        let request = StartFlow::new(1, 2, 3)
            .with_type("dispatch")
            .with_mode(FlowMode::Mixed)
            .with_approver_ids(&[7, 8]);

        assert_eq!(request.flow_type, "dispatch");
        assert_eq!(request.mode, FlowMode::Mixed);
        assert_eq!(request.variables.get(APPROVER_IDS_VAR), Some(&serde_json::json!([7, 8])));
    }

    #[tokio::test]
    async fn test_start_on_disabled_definition_is_invalid_state() {
        let mut disabled = definition();
        disabled.disable();

        let mut definitions = MockDefinitionRepository::new();
        definitions.expect_find().returning(move |_| Ok(Some(disabled.clone())));
        let mut flows = MockFlowRepository::new();
        flows.expect_save().never();

        let result = service(definitions, flows, MockDocumentLookup::new())
            .start(StartFlow::new(1, 2, 3))
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_start_for_missing_document_is_not_found() {
        let enabled = definition();
        let mut definitions = MockDefinitionRepository::new();
        definitions.expect_find().returning(move |_| Ok(Some(enabled.clone())));
        let mut documents = MockDocumentLookup::new();
        documents.expect_get().returning(|_| Ok(None));
        let mut flows = MockFlowRepository::new();
        flows.expect_save().never();

        let result = service(definitions, flows, documents).start(StartFlow::new(1, 2, 3)).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_approve_unknown_node_instance_is_not_found() {
        let mut flows = MockFlowRepository::new();
        flows.expect_find_by_node_instance().returning(|_| Ok(None));
        flows.expect_save().never();

        let result = service(MockDefinitionRepository::new(), flows, MockDocumentLookup::new())
            .approve(Uuid::new_v4(), 7, None)
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
