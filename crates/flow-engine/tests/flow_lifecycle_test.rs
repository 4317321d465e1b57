//! Integration tests for the flow-engine crate.
//!
//! Every test wires a `FlowService` over the in-memory collaborators, with
//! the flow-infra cache, lock and bus where the read path or publication is
//! under test.

use async_trait::async_trait;
use flow_core::EventPublisher;
use flow_engine::memory::{
    InMemoryActionCatalog, InMemoryDefinitions, InMemoryDocuments, InMemoryFlowRepository, InMemoryOrgDirectory,
};
use flow_engine::{
    ActionRule, ActionSelection, ActionType, ApproverScope, ApproverSpec, CachedFlowReader, DocumentInfo,
    DefinitionRepository, DocumentId, ErrorKind, FlowAction, FlowDefinition, FlowError, FlowEvent, FlowInstance, FlowMode, FlowNode,
    FlowRepository, FlowService, FlowStatus, GatewayMode, GatewayType, NodeKey, NodeStatus, ScopeType, StartFlow,
    UserRef,
};
use flow_infra::{InMemoryEventBus, KeyedMutexLock, MemoryCache, MemoryCacheConfig};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const DOCUMENT: DocumentId = 100;
const CREATOR: i64 = 1;

// ==================== Fixtures ====================

fn directory() -> InMemoryOrgDirectory {
    InMemoryOrgDirectory::new()
        .with_user(UserRef::new(1).in_dept(10).with_roles(&["clerk"]))
        .with_user(UserRef::new(2).in_dept(10).with_roles(&["clerk"]))
        .with_user(UserRef::new(3).in_dept(20).with_roles(&["clerk"]))
        .with_user(UserRef::new(4).in_dept(20).with_roles(&["finance"]))
        .with_user(UserRef::new(5).in_dept(30).with_roles(&["audit"]))
        .with_leader(20, 4)
}

fn catalog() -> InMemoryActionCatalog {
    InMemoryActionCatalog::new()
        .with_action(FlowAction::new(1, "unit", "Unit handling", ActionType::UnitHandle))
        .with_action(FlowAction::new(2, "review", "Review", ActionType::Review))
        .with_action(FlowAction::new(3, "external", "External handling", ActionType::External))
        .with_action(FlowAction::new(4, "return", "Return", ActionType::Return))
        .with_action(FlowAction::new(5, "archive", "Archive", ActionType::UnitHandle))
        .with_rule(ActionRule::new(1, 1, 1, "*"))
        .with_rule(ActionRule::new(2, 2, 1, "clerk").for_dept(10).with_priority(5))
        .with_rule(ActionRule::new(3, 3, 1, "finance,clerk").with_priority(1))
        .with_rule(ActionRule::new(4, 4, 1, "*"))
        .with_rule(ActionRule::new(5, 5, 2, "*"))
        .with_scope(ApproverScope::new(2, ScopeType::User).with_roles(&["audit"]))
        .with_scope(ApproverScope::new(3, ScopeType::Dept).with_depts(vec![10, 20]))
}

fn approval(id: i64, order: i32, users: &str) -> FlowNode {
    FlowNode::new(id, 1, format!("step {}", id))
        .with_order(order)
        .with_approver(ApproverSpec::users(users))
}

fn definition(nodes: Vec<FlowNode>) -> FlowDefinition {
    FlowDefinition::new(1, "contract approval").with_nodes(nodes).unwrap()
}

struct Harness {
    service: FlowService,
    definitions: InMemoryDefinitions,
    flows: InMemoryFlowRepository,
    documents: InMemoryDocuments,
}

impl Harness {
    fn new(definition: FlowDefinition) -> Self {
        Self::with_repository(definition, |flows| Arc::new(flows) as Arc<dyn FlowRepository>)
    }

    fn with_repository(
        definition: FlowDefinition,
        wrap: impl FnOnce(InMemoryFlowRepository) -> Arc<dyn FlowRepository>,
    ) -> Self {
        let definitions = InMemoryDefinitions::new().with_definition(definition);
        let flows = InMemoryFlowRepository::new();
        let documents = InMemoryDocuments::new().with_document(DocumentInfo {
            id: DOCUMENT,
            status: 1,
            creator_id: CREATOR,
        });
        let service = FlowService::new(
            Arc::new(definitions.clone()),
            wrap(flows.clone()),
            Arc::new(documents.clone()),
            Arc::new(directory()),
            Arc::new(catalog()),
        );
        Self {
            service,
            definitions,
            flows,
            documents,
        }
    }

    async fn start(&self) -> FlowInstance {
        self.service
            .start(StartFlow::new(1, DOCUMENT, CREATOR))
            .await
            .unwrap()
            .flow
    }

    async fn reload(&self, flow: &FlowInstance) -> FlowInstance {
        self.flows.find(flow.id).await.unwrap().unwrap()
    }
}

fn pending_for(flow: &FlowInstance, user_id: i64) -> Uuid {
    flow.node_instances()
        .iter()
        .find(|ni| ni.status() == NodeStatus::Pending && ni.is_assigned_to(user_id))
        .map(|ni| ni.id)
        .unwrap()
}

fn count(flow: &FlowInstance, status: NodeStatus) -> usize {
    flow.node_instances().iter().filter(|ni| ni.status() == status).count()
}

fn split_join_definition(join_mode: Option<GatewayMode>) -> FlowDefinition {
    definition(vec![
        FlowNode::new(1, 1, "split")
            .with_order(1)
            .with_gateway(GatewayType::ParallelSplit, None)
            .with_successors(vec![2, 3]),
        approval(2, 2, "2").with_next(4),
        approval(3, 3, "3").with_next(4),
        FlowNode::new(4, 1, "join")
            .with_order(4)
            .with_gateway(GatewayType::ParallelJoin, join_mode)
            .with_linked_gateway(1)
            .with_next(5),
        approval(5, 5, "4").as_last(),
    ])
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_linear_flow_completes_and_publishes_document() {
    let h = Harness::new(definition(vec![approval(1, 1, "2"), approval(2, 2, "3").as_last()]));

    let flow = h.start().await;
    assert_eq!(flow.status(), FlowStatus::Processing);
    assert_eq!(flow.current(), Some(NodeKey::Static(1)));
    assert_eq!(flow.version(), 1);

    let first = h.service.approve(pending_for(&flow, 2), 2, Some("ok".into())).await.unwrap();
    assert_eq!(first.flow.current(), Some(NodeKey::Static(2)));
    assert!(!first.completed());
    assert!(h.documents.published().is_empty());

    let last = h.service.approve(pending_for(&first.flow, 3), 3, None).await.unwrap();
    assert!(last.completed());
    assert!(last.flow.ended_at().is_some());
    assert!(last
        .events
        .iter()
        .any(|e| matches!(e, FlowEvent::FlowCompleted { document_id, .. } if *document_id == DOCUMENT)));
    assert_eq!(h.documents.published(), vec![DOCUMENT]);
    assert_eq!(h.reload(&flow).await.version(), 3);
}

#[tokio::test]
async fn test_only_the_assigned_approver_may_handle() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;
    let instance = pending_for(&flow, 2);

    let err = h.service.approve(instance, 3, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    h.service.approve(instance, 2, None).await.unwrap();
    let again = h.service.approve(instance, 2, None).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_suspended_flow_refuses_approval_until_resumed() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;
    let instance = pending_for(&flow, 2);

    h.service.suspend(flow.id).await.unwrap();
    let err = h.service.approve(instance, 2, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    h.service.resume(flow.id).await.unwrap();
    assert!(h.service.approve(instance, 2, None).await.unwrap().completed());
}

#[tokio::test]
async fn test_process_variables_survive_round_trip() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;

    h.service.set_variable(flow.id, "amount", json!(1200)).await.unwrap();

    assert_eq!(h.service.variable(flow.id, "amount").await.unwrap(), Some(json!(1200)));
    assert_eq!(h.service.variable(flow.id, "missing").await.unwrap(), None);
    assert_eq!(h.service.flows_for_document(DOCUMENT).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_initiator_selected_approvers() {
    let node = FlowNode::new(1, 1, "chosen")
        .with_order(1)
        .with_approver(ApproverSpec::initiator())
        .as_last();
    let h = Harness::new(definition(vec![node]));

    let outcome = h
        .service
        .start(StartFlow::new(1, DOCUMENT, CREATOR).with_approver_ids(&[3, 5]))
        .await
        .unwrap();

    let mut approvers: Vec<_> = outcome
        .flow
        .node_instances()
        .iter()
        .filter_map(|ni| ni.approver_id())
        .collect();
    approvers.sort();
    assert_eq!(approvers, vec![3, 5]);
    assert!(h
        .service
        .has_approval_permission(outcome.flow.id, 5, NodeKey::Static(1))
        .await
        .unwrap());
    assert!(!h
        .service
        .has_approval_permission(outcome.flow.id, 2, NodeKey::Static(1))
        .await
        .unwrap());
}

// ==================== Countersign and Join Tests ====================

#[tokio::test]
async fn test_countersign_node_waits_for_every_sibling() {
    let node = approval(1, 1, "2,3").with_parallel_mode(GatewayMode::All);
    let h = Harness::new(definition(vec![node, approval(2, 2, "4").as_last()]));
    let flow = h.start().await;
    assert_eq!(count(&flow, NodeStatus::Pending), 2);

    let first = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap();
    assert_eq!(first.flow.current(), Some(NodeKey::Static(1)));
    assert!(first.created_node_instances.is_empty());

    let second = h.service.approve(pending_for(&first.flow, 3), 3, None).await.unwrap();
    assert_eq!(second.flow.current(), Some(NodeKey::Static(2)));
    assert_eq!(second.created_node_instances.len(), 1);
}

#[tokio::test]
async fn test_any_sign_node_closes_remaining_siblings() {
    let node = approval(1, 1, "2,3").with_parallel_mode(GatewayMode::Any);
    let h = Harness::new(definition(vec![node, approval(2, 2, "4").as_last()]));
    let flow = h.start().await;

    let outcome = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap();

    let at_first: Vec<_> = outcome.flow.instances_of(&NodeKey::Static(1)).map(|ni| ni.status()).collect();
    assert!(at_first.contains(&NodeStatus::Completed));
    assert!(at_first.contains(&NodeStatus::Skipped));
    assert_eq!(outcome.flow.current(), Some(NodeKey::Static(2)));
}

#[tokio::test]
async fn test_parallel_join_waits_for_all_branches() {
    let h = Harness::new(split_join_definition(None));
    let flow = h.start().await;
    assert_eq!(count(&flow, NodeStatus::Pending), 2);

    let left = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap();
    assert!(left.flow.instances_of(&NodeKey::Static(5)).next().is_none());

    let right = h.service.approve(pending_for(&left.flow, 3), 3, None).await.unwrap();
    assert_eq!(right.flow.instances_of(&NodeKey::Static(5)).count(), 1);
    assert_eq!(right.flow.current(), Some(NodeKey::Static(5)));

    let done = h.service.approve(pending_for(&right.flow, 4), 4, None).await.unwrap();
    assert!(done.completed());
}

#[tokio::test]
async fn test_any_join_fires_on_first_branch() {
    let h = Harness::new(split_join_definition(Some(GatewayMode::Any)));
    let flow = h.start().await;

    let left = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap();

    assert_eq!(left.flow.instances_of(&NodeKey::Static(5)).count(), 1);
    assert!(left.flow.has_live_instance(&NodeKey::Static(3)));
}

// ==================== Skip Tests ====================

#[tokio::test]
async fn test_skip_chain_creates_skipped_records_only() {
    let h = Harness::new(definition(vec![
        approval(1, 1, "2").with_skip_condition("#fastTrack"),
        approval(2, 2, "3").with_skip_condition("#fastTrack"),
        approval(3, 3, "4").with_skip_condition("#amount < 500"),
        approval(4, 4, "5").as_last(),
    ]));

    let outcome = h
        .service
        .start(
            StartFlow::new(1, DOCUMENT, CREATOR)
                .with_variable("fastTrack", json!(true))
                .with_variable("amount", json!(120)),
        )
        .await
        .unwrap();

    assert_eq!(count(&outcome.flow, NodeStatus::Skipped), 3);
    assert_eq!(count(&outcome.flow, NodeStatus::Pending), 1);
    assert_eq!(outcome.flow.current(), Some(NodeKey::Static(4)));
    assert!(outcome
        .flow
        .node_instances()
        .iter()
        .filter(|ni| ni.status() == NodeStatus::Skipped)
        .all(|ni| ni.approver.is_none()));
}

#[tokio::test]
async fn test_every_node_skipped_completes_at_start() {
    let h = Harness::new(definition(vec![
        approval(1, 1, "2").with_skip_condition("true"),
        approval(2, 2, "3").with_skip_condition("true").as_last(),
    ]));

    let outcome = h.service.start(StartFlow::new(1, DOCUMENT, CREATOR)).await.unwrap();

    assert!(outcome.completed());
    assert_eq!(count(&outcome.flow, NodeStatus::Pending), 0);
    assert_eq!(h.documents.published(), vec![DOCUMENT]);
}

// ==================== Reject, Rollback, Withdraw and Forward Tests ====================

#[tokio::test]
async fn test_reject_without_target_terminates() {
    let h = Harness::new(definition(vec![approval(1, 1, "2,3"), approval(2, 2, "4").as_last()]));
    let flow = h.start().await;

    let outcome = h
        .service
        .reject(pending_for(&flow, 2), 2, Some("incomplete".into()), None)
        .await
        .unwrap();

    assert_eq!(outcome.flow.status(), FlowStatus::Terminated);
    assert_eq!(outcome.flow.live_instances().count(), 0);
    assert!(outcome.events.iter().any(|e| matches!(e, FlowEvent::FlowTerminated { .. })));
    assert!(h.documents.published().is_empty());
}

#[tokio::test]
async fn test_reject_with_target_reenters_that_node() {
    let h = Harness::new(definition(vec![approval(1, 1, "2"), approval(2, 2, "3").as_last()]));
    let flow = h.start().await;
    let at_second = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap().flow;

    let outcome = h
        .service
        .reject(pending_for(&at_second, 3), 3, None, Some(1))
        .await
        .unwrap();

    assert_eq!(outcome.flow.status(), FlowStatus::Processing);
    assert_eq!(outcome.flow.current(), Some(NodeKey::Static(1)));
    assert_eq!(outcome.flow.instances_of(&NodeKey::Static(1)).count(), 2);
    assert_eq!(count(&outcome.flow, NodeStatus::Rejected), 1);

    let unknown = h.service.reject(pending_for(&outcome.flow, 2), 2, None, Some(42)).await;
    assert_eq!(unknown.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_reject_cannot_jump_to_unvisited_node() {
    let h = Harness::new(definition(vec![
        approval(1, 1, "2"),
        approval(2, 2, "3"),
        approval(3, 3, "4").as_last(),
    ]));
    let flow = h.start().await;
    let instance = pending_for(&flow, 2);

    let err = h.service.reject(instance, 2, None, Some(3)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let stored = h.reload(&flow).await;
    assert_eq!(stored.node_instance(instance).unwrap().status(), NodeStatus::Pending);
    assert_eq!(stored.current(), Some(NodeKey::Static(1)));
    assert_eq!(stored.instances_of(&NodeKey::Static(3)).count(), 0);
}

#[tokio::test]
async fn test_rollback_appends_history() {
    let h = Harness::new(definition(vec![
        approval(1, 1, "2"),
        approval(2, 2, "3"),
        approval(3, 3, "4").as_last(),
    ]));
    let flow = h.start().await;
    let flow = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap().flow;
    let before = flow.node_instances().len();

    let never_reached = h.service.rollback(flow.id, 3, 3, None).await.unwrap_err();
    assert_eq!(never_reached.kind(), ErrorKind::InvalidState);

    let outsider = h.service.rollback(flow.id, 5, 1, None).await.unwrap_err();
    assert_eq!(outsider.kind(), ErrorKind::Unauthorized);

    let outcome = h.service.rollback(flow.id, 3, 1, Some("missing annex".into())).await.unwrap();

    assert_eq!(outcome.flow.node_instances().len(), before + 1);
    assert_eq!(outcome.flow.current(), Some(NodeKey::Static(1)));
    assert_eq!(outcome.flow.instances_of(&NodeKey::Static(2)).next().unwrap().status(), NodeStatus::Skipped);
    assert_eq!(pending_for(&outcome.flow, 2), outcome.created_node_instances[0]);
}

#[tokio::test]
async fn test_withdraw_is_initiator_only() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;

    let err = h.service.withdraw(flow.id, 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let outcome = h.service.withdraw(flow.id, CREATOR).await.unwrap();
    assert_eq!(outcome.flow.status(), FlowStatus::Cancelled);
    assert_eq!(outcome.flow.live_instances().count(), 0);

    let late = h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap_err();
    assert_eq!(late.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_forward_transfers_within_the_same_batch() {
    let h = Harness::new(definition(vec![approval(1, 1, "2,3"), approval(2, 2, "4").as_last()]));
    let flow = h.start().await;
    let original = pending_for(&flow, 2);

    let duplicate = h.service.forward(original, 2, 3, None).await.unwrap_err();
    assert_eq!(duplicate.kind(), ErrorKind::ValidationFailed);
    let missing = h.service.forward(original, 2, 99, None).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    let outcome = h.service.forward(original, 2, 5, Some("on leave".into())).await.unwrap();

    let forwarded = outcome.flow.node_instance(original).unwrap();
    assert_eq!(forwarded.status(), NodeStatus::Skipped);
    let transferred = outcome.flow.node_instance(outcome.created_node_instances[0]).unwrap();
    assert!(transferred.is_assigned_to(5));
    assert_eq!(transferred.batch, forwarded.batch);
    assert_eq!(transferred.node, NodeKey::Static(1));
}

// ==================== Free Flow Tests ====================

#[tokio::test]
async fn test_available_actions_follow_rules() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;

    let ids = |actions: Vec<FlowAction>| {
        let mut ids: Vec<_> = actions.into_iter().map(|a| a.id).collect();
        ids.sort();
        ids
    };

    // clerk in dept 10: wildcard, dept-specific and role-listed rules
    let clerk = h.service.available_actions(flow.id, 2).await.unwrap();
    assert_eq!(clerk[0].id, 2);
    assert_eq!(ids(clerk), vec![1, 2, 3, 4]);

    // clerk outside dept 10 loses the dept-specific rule
    assert_eq!(ids(h.service.available_actions(flow.id, 3).await.unwrap()), vec![1, 3, 4]);

    // the status-2 rule never matches a status-1 document
    assert_eq!(ids(h.service.available_actions(flow.id, 5).await.unwrap()), vec![1, 4]);
}

#[tokio::test]
async fn test_available_approvers_by_action_type() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;

    let users = |list: Vec<UserRef>| list.into_iter().map(|u| u.id).collect::<Vec<_>>();

    assert_eq!(users(h.service.available_approvers(flow.id, 1, 2).await.unwrap()), vec![1, 2]);
    assert_eq!(users(h.service.available_approvers(flow.id, 2, 2).await.unwrap()), vec![5]);
    assert_eq!(users(h.service.available_approvers(flow.id, 3, 2).await.unwrap()), vec![3, 4]);
    assert_eq!(users(h.service.available_approvers(flow.id, 4, 3).await.unwrap()), vec![CREATOR]);

    let scope = h.service.approver_scope(4).await.unwrap();
    assert!(scope.allow_custom);
}

#[tokio::test]
async fn test_free_flow_refused_on_plain_static_node() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h.start().await;

    let err = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(1).to_users(vec![3]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_external_action_routes_to_dept_leader() {
    let node = approval(1, 1, "2").allowing_free_flow();
    let h = Harness::new(definition(vec![node, approval(2, 2, "5").as_last()]));
    let flow = h
        .service
        .start(StartFlow::new(1, DOCUMENT, CREATOR).with_mode(FlowMode::Mixed))
        .await
        .unwrap()
        .flow;

    let outside = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(3).to_depts(vec![30]))
        .await
        .unwrap_err();
    assert_eq!(outside.kind(), ErrorKind::ValidationFailed);

    let outcome = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(3).to_depts(vec![20]))
        .await
        .unwrap();
    assert_eq!(outcome.created_node_instances.len(), 1);
    assert!(matches!(outcome.flow.current(), Some(NodeKey::Dynamic(_))));

    // back on the static graph once the free-flow node is approved
    let resumed = h.service.approve(pending_for(&outcome.flow, 4), 4, None).await.unwrap();
    assert_eq!(resumed.flow.current(), Some(NodeKey::Static(2)));
}

#[tokio::test]
async fn test_fixed_flow_resumes_static_graph_after_free_flow() {
    let node = approval(1, 1, "2").allowing_free_flow();
    let h = Harness::new(definition(vec![node, approval(2, 2, "5").as_last()]));
    let flow = h.start().await;
    assert_eq!(flow.mode, FlowMode::Fixed);

    let handed = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(1).to_users(vec![3]))
        .await
        .unwrap();

    let resumed = h.service.approve(pending_for(&handed.flow, 3), 3, None).await.unwrap();
    assert_eq!(resumed.flow.status(), FlowStatus::Processing);
    assert_eq!(resumed.flow.current(), Some(NodeKey::Static(2)));
    assert_eq!(resumed.flow.instances_of(&NodeKey::Static(2)).count(), 1);

    let done = h.service.approve(pending_for(&resumed.flow, 5), 5, None).await.unwrap();
    assert!(done.completed());
}

#[tokio::test]
async fn test_free_flow_closes_static_siblings() {
    let node = approval(1, 1, "2,3").allowing_free_flow();
    let h = Harness::new(definition(vec![node, approval(2, 2, "5").as_last()]));
    let flow = h
        .service
        .start(StartFlow::new(1, DOCUMENT, CREATOR).with_mode(FlowMode::Mixed))
        .await
        .unwrap()
        .flow;
    let left_behind = pending_for(&flow, 3);

    let handed = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(1).to_users(vec![1]))
        .await
        .unwrap();
    assert_eq!(handed.flow.node_instance(left_behind).unwrap().status(), NodeStatus::Skipped);
    assert!(!handed.flow.has_live_instance(&NodeKey::Static(1)));

    let resumed = h.service.approve(pending_for(&handed.flow, 1), 1, None).await.unwrap();
    assert_eq!(resumed.flow.current(), Some(NodeKey::Static(2)));

    let late = h.service.approve(left_behind, 3, None).await.unwrap_err();
    assert_eq!(late.kind(), ErrorKind::InvalidState);
    assert_eq!(h.reload(&flow).await.instances_of(&NodeKey::Static(2)).count(), 1);
}

#[tokio::test]
async fn test_return_goes_to_creator_then_previous_approver() {
    let h = Harness::new(definition(vec![approval(1, 1, "2").as_last()]));
    let flow = h
        .service
        .start(StartFlow::new(1, DOCUMENT, CREATOR).with_mode(FlowMode::Free))
        .await
        .unwrap()
        .flow;

    // no earlier assignment: the document's creator
    let first = h
        .service
        .execute_action(pending_for(&flow, 2), 2, ActionSelection::new(4))
        .await
        .unwrap();
    let returned = first.flow.node_instance(first.created_node_instances[0]).unwrap();
    assert!(returned.is_assigned_to(CREATOR));
    assert_eq!(returned.free_flow.as_ref().map(|d| d.action_id), Some(4));

    // the latest earlier assignment wins
    let second = h
        .service
        .execute_action(returned.id, CREATOR, ActionSelection::new(4))
        .await
        .unwrap();
    let back = second.flow.node_instance(second.created_node_instances[0]).unwrap();
    assert!(back.is_assigned_to(2));

    let third = h.service.execute_action(back.id, 2, ActionSelection::new(4)).await.unwrap();
    let again = third.flow.node_instance(third.created_node_instances[0]).unwrap();
    assert_eq!(again.approver_id(), returned.approver_id());

    let done = h.service.approve(again.id, CREATOR, None).await.unwrap();
    assert!(done.completed());
}

// ==================== Atomicity and Concurrency Tests ====================

/// Delegates to an in-memory store but can be told to fail every save.
struct FailingSaves {
    inner: InMemoryFlowRepository,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl FlowRepository for FailingSaves {
    async fn find(&self, id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        self.inner.find(id).await
    }

    async fn find_by_node_instance(&self, node_instance_id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        self.inner.find_by_node_instance(node_instance_id).await
    }

    async fn find_by_document(&self, document_id: DocumentId) -> flow_engine::Result<Vec<FlowInstance>> {
        self.inner.find_by_document(document_id).await
    }

    async fn save(&self, flow: &FlowInstance) -> flow_engine::Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FlowError::Storage("disk full".into()));
        }
        self.inner.save(flow).await
    }
}

#[tokio::test]
async fn test_failed_save_leaves_no_partial_state() {
    let fail = Arc::new(AtomicBool::new(false));
    let switch = fail.clone();
    let h = Harness::with_repository(
        definition(vec![approval(1, 1, "2"), approval(2, 2, "3").as_last()]),
        move |inner| Arc::new(FailingSaves { inner, fail: switch }) as Arc<dyn FlowRepository>,
    );
    let flow = h.start().await;
    let instance = pending_for(&flow, 2);

    fail.store(true, Ordering::SeqCst);
    let err = h.service.approve(instance, 2, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    let stored = h.reload(&flow).await;
    assert_eq!(stored.node_instances().len(), flow.node_instances().len());
    assert_eq!(stored.node_instance(instance).unwrap().status(), NodeStatus::Pending);
    assert_eq!(stored.current(), Some(NodeKey::Static(1)));
    assert_eq!(stored.version(), flow.version());

    fail.store(false, Ordering::SeqCst);
    assert!(h.service.approve(instance, 2, None).await.is_ok());
}

#[tokio::test]
async fn test_failed_free_flow_action_leaves_no_partial_state() {
    let fail = Arc::new(AtomicBool::new(false));
    let switch = fail.clone();
    let node = approval(1, 1, "2").allowing_free_flow();
    let h = Harness::with_repository(definition(vec![node, approval(2, 2, "5").as_last()]), move |inner| {
        Arc::new(FailingSaves { inner, fail: switch }) as Arc<dyn FlowRepository>
    });
    let flow = h
        .service
        .start(StartFlow::new(1, DOCUMENT, CREATOR).with_mode(FlowMode::Mixed))
        .await
        .unwrap()
        .flow;
    let instance = pending_for(&flow, 2);

    fail.store(true, Ordering::SeqCst);
    let err = h
        .service
        .execute_action(instance, 2, ActionSelection::new(1).to_users(vec![3]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);

    let stored = h.reload(&flow).await;
    assert_eq!(stored.node_instances().len(), flow.node_instances().len());
    assert!(stored.dynamic_nodes().is_empty());
    assert!(stored.node_instances().iter().all(|ni| ni.free_flow.is_none()));
    assert_eq!(stored.node_instance(instance).unwrap().status(), NodeStatus::Pending);
    assert_eq!(stored.current(), Some(NodeKey::Static(1)));
}

#[tokio::test]
async fn test_failed_start_leaves_definition_editable() {
    let fail = Arc::new(AtomicBool::new(true));
    let switch = fail.clone();
    let h = Harness::with_repository(definition(vec![approval(1, 1, "2").as_last()]), move |inner| {
        Arc::new(FailingSaves { inner, fail: switch }) as Arc<dyn FlowRepository>
    });

    let err = h.service.start(StartFlow::new(1, DOCUMENT, CREATOR)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(h.flows.is_empty());
    assert!(!h.definitions.find(1).await.unwrap().unwrap().is_in_use());

    fail.store(false, Ordering::SeqCst);
    h.start().await;
    assert!(h.definitions.find(1).await.unwrap().unwrap().is_in_use());
}

/// Serves node-instance lookups from a frozen snapshot, simulating a writer
/// that loaded the flow before another one committed.
struct StaleReads {
    inner: InMemoryFlowRepository,
    snapshot: Mutex<Option<FlowInstance>>,
}

#[async_trait]
impl FlowRepository for StaleReads {
    async fn find(&self, id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        self.inner.find(id).await
    }

    async fn find_by_node_instance(&self, node_instance_id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        if let Some(flow) = self.snapshot.lock().clone() {
            return Ok(Some(flow));
        }
        self.inner.find_by_node_instance(node_instance_id).await
    }

    async fn find_by_document(&self, document_id: DocumentId) -> flow_engine::Result<Vec<FlowInstance>> {
        self.inner.find_by_document(document_id).await
    }

    async fn save(&self, flow: &FlowInstance) -> flow_engine::Result<u64> {
        self.inner.save(flow).await
    }
}

#[tokio::test]
async fn test_concurrent_writer_gets_version_conflict() {
    let stale = Arc::new(StaleReads {
        inner: InMemoryFlowRepository::new(),
        snapshot: Mutex::new(None),
    });
    let repo = stale.clone();
    let node = approval(1, 1, "2,3").with_parallel_mode(GatewayMode::All);
    let h = Harness::with_repository(definition(vec![node, approval(2, 2, "4").as_last()]), move |_| {
        repo as Arc<dyn FlowRepository>
    });

    let flow = h.start().await;
    *stale.snapshot.lock() = Some(stale.inner.find(flow.id).await.unwrap().unwrap());

    h.service.approve(pending_for(&flow, 2), 2, None).await.unwrap();
    let err = h.service.approve(pending_for(&flow, 3), 3, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(err, FlowError::Conflict { expected: 1, found: 2, .. }));
}

/// Counts loads that reach the store.
struct CountingLoads {
    inner: InMemoryFlowRepository,
    loads: AtomicUsize,
}

#[async_trait]
impl FlowRepository for CountingLoads {
    async fn find(&self, id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        self.inner.find(id).await
    }

    async fn find_by_node_instance(&self, node_instance_id: Uuid) -> flow_engine::Result<Option<FlowInstance>> {
        self.inner.find_by_node_instance(node_instance_id).await
    }

    async fn find_by_document(&self, document_id: DocumentId) -> flow_engine::Result<Vec<FlowInstance>> {
        self.inner.find_by_document(document_id).await
    }

    async fn save(&self, flow: &FlowInstance) -> flow_engine::Result<u64> {
        self.inner.save(flow).await
    }
}

#[tokio::test]
async fn test_concurrent_cold_reads_load_once() {
    let counting = Arc::new(CountingLoads {
        inner: InMemoryFlowRepository::new(),
        loads: AtomicUsize::new(0),
    });
    let repo = counting.clone();
    let h = Harness::with_repository(definition(vec![approval(1, 1, "2").as_last()]), move |_| {
        repo as Arc<dyn FlowRepository>
    });
    let flow = h.service.start(StartFlow::new(1, DOCUMENT, CREATOR)).await.unwrap().flow;

    let reader = Arc::new(CachedFlowReader::new(
        Arc::new(MemoryCache::new(MemoryCacheConfig::default())),
        Arc::new(KeyedMutexLock::new()),
        counting.clone(),
    ));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let reader = reader.clone();
        let id = flow.id;
        handles.push(tokio::spawn(async move { reader.get(id).await }));
    }
    for handle in handles {
        let loaded = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(loaded.id, flow.id);
    }

    assert_eq!(counting.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_committed_change_evicts_cached_snapshot() {
    let flows = InMemoryFlowRepository::new();
    let reader = Arc::new(CachedFlowReader::new(
        Arc::new(MemoryCache::new(MemoryCacheConfig::default())),
        Arc::new(KeyedMutexLock::new()),
        Arc::new(flows.clone()),
    ));
    let documents = InMemoryDocuments::new().with_document(DocumentInfo {
        id: DOCUMENT,
        status: 1,
        creator_id: CREATOR,
    });
    let service = FlowService::new(
        Arc::new(InMemoryDefinitions::new().with_definition(definition(vec![approval(1, 1, "2").as_last()]))),
        Arc::new(flows),
        Arc::new(documents),
        Arc::new(directory()),
        Arc::new(catalog()),
    )
    .with_cache_invalidator(reader.clone());

    let flow = service.start(StartFlow::new(1, DOCUMENT, CREATOR)).await.unwrap().flow;
    assert_eq!(reader.get(flow.id).await.unwrap().unwrap().version(), 1);

    service.approve(pending_for(&flow, 2), 2, None).await.unwrap();

    let fresh = reader.get(flow.id).await.unwrap().unwrap();
    assert_eq!(fresh.version(), 2);
    assert_eq!(fresh.status(), FlowStatus::Completed);
}

// ==================== Event Publication Tests ====================

#[tokio::test]
async fn test_events_reach_the_bus_after_commit() {
    let bus = Arc::new(InMemoryEventBus::default());
    let mut subscription = bus.subscribe();
    let mut completions = bus.subscribe_pattern("flow.completed");

    let publisher: Arc<dyn EventPublisher> = bus.clone();
    let documents = InMemoryDocuments::new().with_document(DocumentInfo {
        id: DOCUMENT,
        status: 1,
        creator_id: CREATOR,
    });
    let service = FlowService::new(
        Arc::new(InMemoryDefinitions::new().with_definition(definition(vec![approval(1, 1, "2").as_last()]))),
        Arc::new(InMemoryFlowRepository::new()),
        Arc::new(documents),
        Arc::new(directory()),
        Arc::new(catalog()),
    )
    .with_publisher(publisher);

    let flow = service.start(StartFlow::new(1, DOCUMENT, CREATOR)).await.unwrap().flow;
    service.approve(pending_for(&flow, 2), 2, None).await.unwrap();

    let types: Vec<_> = subscription.drain().into_iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec!["flow.started", "node.instance_created", "node.completed", "flow.completed"]
    );

    let completed = completions.recv().await.unwrap();
    match FlowEvent::from_event(&completed).unwrap() {
        FlowEvent::FlowCompleted { flow_instance_id, .. } => assert_eq!(flow_instance_id, flow.id),
        other => panic!("unexpected event {:?}", other),
    }
}
