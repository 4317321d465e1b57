//! Free-flow engine
//!
//! In free flow the current handler picks the next step at run time: an
//! action (unit handling, review, external handling, return) plus the
//! departments and users who should handle it. Each choice creates one
//! dynamic node outside the static graph and one pending instance per
//! resolved approver.
//!
//! [`FreeFlowEngine::execute`] mutates the aggregate it is given and nothing
//! else; the caller persists the result as a single unit, so a failure at any
//! step leaves no partial state behind.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::collaborators::{ActionCatalog, DocumentInfo, OrgDirectory, UserRef};
use crate::definition::{FlowNode, NodeKind};
use crate::instance::{DynamicNode, FlowInstance, FlowMode, NodeKey};
use crate::node_instance::{Approver, FlowNodeInstance, FreeFlowDetail};
use crate::status::NodeStatus;
use crate::{ActionId, DeptId, FlowError, Result, RoleId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Handle within the unit
    UnitHandle,
    Review,
    /// Hand over to another unit
    External,
    /// Send back to the previous handler
    Return,
}

impl ActionType {
    pub fn code(self) -> i32 {
        match self {
            ActionType::UnitHandle => 1,
            ActionType::Review => 2,
            ActionType::External => 3,
            ActionType::Return => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ActionType::UnitHandle),
            2 => Some(ActionType::Review),
            3 => Some(ActionType::External),
            4 => Some(ActionType::Return),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowAction {
    pub id: ActionId,
    pub code: String,
    pub name: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub description: Option<String>,
    pub enabled: bool,
}

impl FlowAction {
    pub fn new(id: ActionId, code: impl Into<String>, name: impl Into<String>, action_type: ActionType) -> Self {
        Self {
            id,
            code: code.into(),
            name: name.into(),
            action_type,
            description: None,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_return(&self) -> bool {
        self.action_type == ActionType::Return
    }
}

/// When an action is offered: document status, role and optional department
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRule {
    pub id: i64,
    pub action_id: ActionId,
    pub document_status: i32,
    /// `*` or a comma-separated list of role codes
    pub user_role: String,
    #[serde(default)]
    pub dept_id: Option<DeptId>,
    #[serde(default)]
    pub priority: i32,
    pub enabled: bool,
}

impl ActionRule {
    pub fn new(id: i64, action_id: ActionId, document_status: i32, user_role: impl Into<String>) -> Self {
        Self {
            id,
            action_id,
            document_status,
            user_role: user_role.into(),
            dept_id: None,
            priority: 0,
            enabled: true,
        }
    }

    pub fn for_dept(mut self, dept_id: DeptId) -> Self {
        self.dept_id = Some(dept_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matches(&self, document_status: i32, roles: &[RoleId], dept_id: Option<DeptId>) -> bool {
        self.enabled
            && self.document_status == document_status
            && self.matches_roles(roles)
            && self.dept_id.map_or(true, |d| Some(d) == dept_id)
    }

    fn matches_roles(&self, roles: &[RoleId]) -> bool {
        if roles.is_empty() {
            return false;
        }
        let rule = self.user_role.trim();
        if rule == "*" {
            return true;
        }
        rule.split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .any(|r| roles.iter().any(|held| held == r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Dept,
    User,
    DeptAndUser,
}

/// Which departments and users an action may be sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverScope {
    pub action_id: ActionId,
    pub scope_type: ScopeType,
    /// Allowed departments; empty means unrestricted
    #[serde(default)]
    pub dept_ids: Vec<DeptId>,
    /// Allowed users; empty means unrestricted
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    #[serde(default)]
    pub role_codes: Vec<RoleId>,
    pub allow_custom: bool,
}

impl ApproverScope {
    pub fn new(action_id: ActionId, scope_type: ScopeType) -> Self {
        Self {
            action_id,
            scope_type,
            dept_ids: Vec::new(),
            user_ids: Vec::new(),
            role_codes: Vec::new(),
            allow_custom: false,
        }
    }

    /// Scope used when an action has none configured.
    pub fn permissive(action_id: ActionId) -> Self {
        Self {
            allow_custom: true,
            ..Self::new(action_id, ScopeType::DeptAndUser)
        }
    }

    pub fn with_depts(mut self, dept_ids: Vec<DeptId>) -> Self {
        self.dept_ids = dept_ids;
        self
    }

    pub fn with_users(mut self, user_ids: Vec<UserId>) -> Self {
        self.user_ids = user_ids;
        self
    }

    pub fn with_roles(mut self, role_codes: &[&str]) -> Self {
        self.role_codes = role_codes.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn allowing_custom(mut self) -> Self {
        self.allow_custom = true;
        self
    }

    pub fn validate(&self, selection: &ActionSelection) -> Result<()> {
        if self.allow_custom {
            return Ok(());
        }
        if !self.dept_ids.is_empty() {
            if let Some(dept) = selection.dept_ids.iter().find(|d| !self.dept_ids.contains(d)) {
                return Err(FlowError::ValidationFailed(format!(
                    "department {} is outside the scope of action {}",
                    dept, self.action_id
                )));
            }
        }
        if !self.user_ids.is_empty() {
            if let Some(user) = selection.user_ids.iter().find(|u| !self.user_ids.contains(u)) {
                return Err(FlowError::ValidationFailed(format!(
                    "user {} is outside the scope of action {}",
                    user, self.action_id
                )));
            }
        }
        Ok(())
    }
}

/// A handler's free-flow choice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSelection {
    pub action_id: ActionId,
    #[serde(default)]
    pub dept_ids: Vec<DeptId>,
    #[serde(default)]
    pub user_ids: Vec<UserId>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ActionSelection {
    pub fn new(action_id: ActionId) -> Self {
        Self {
            action_id,
            ..Self::default()
        }
    }

    pub fn to_depts(mut self, dept_ids: Vec<DeptId>) -> Self {
        self.dept_ids = dept_ids;
        self
    }

    pub fn to_users(mut self, user_ids: Vec<UserId>) -> Self {
        self.user_ids = user_ids;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

pub struct FreeFlowEngine {
    catalog: Arc<dyn ActionCatalog>,
    directory: Arc<dyn OrgDirectory>,
}

impl FreeFlowEngine {
    pub fn new(catalog: Arc<dyn ActionCatalog>, directory: Arc<dyn OrgDirectory>) -> Self {
        Self { catalog, directory }
    }

    /// Enabled actions with at least one enabled rule matching the context,
    /// ordered by their best matching rule priority, highest first.
    pub async fn available_actions(
        &self,
        document_status: i32,
        roles: &[RoleId],
        dept_id: Option<DeptId>,
    ) -> Result<Vec<FlowAction>> {
        let mut ranked = Vec::new();
        for action in self.catalog.enabled_actions().await? {
            if !action.enabled {
                continue;
            }
            let best = self
                .catalog
                .rules_for(action.id)
                .await?
                .iter()
                .filter(|rule| rule.matches(document_status, roles, dept_id))
                .map(|rule| rule.priority)
                .max();
            if let Some(priority) = best {
                ranked.push((priority, action));
            }
        }

        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        debug!(document_status, count = ranked.len(), "Available free-flow actions");
        Ok(ranked.into_iter().map(|(_, action)| action).collect())
    }

    pub async fn action(&self, action_id: ActionId) -> Result<Option<FlowAction>> {
        self.catalog.action(action_id).await
    }

    /// Configured scope of an action, or the permissive default.
    pub async fn approver_scope(&self, action_id: ActionId) -> Result<ApproverScope> {
        Ok(self
            .catalog
            .scope_for(action_id)
            .await?
            .unwrap_or_else(|| ApproverScope::permissive(action_id)))
    }

    /// Users that may be picked for `action`, for presenting a choice.
    pub async fn available_approvers(&self, action: &FlowAction, operator: &UserRef, flow: &FlowInstance) -> Result<Vec<UserRef>> {
        if !action.enabled {
            return Ok(Vec::new());
        }

        let users = match action.action_type {
            ActionType::UnitHandle => match operator.dept_id {
                Some(dept) => self.directory.users_by_dept(dept).await?,
                None => Vec::new(),
            },
            ActionType::Review => {
                let scope = self.approver_scope(action.id).await?;
                if scope.role_codes.is_empty() {
                    Vec::new()
                } else {
                    self.directory.users_by_role(&scope.role_codes).await?
                }
            }
            ActionType::External => {
                let scope = self.approver_scope(action.id).await?;
                let mut users = Vec::new();
                for dept in scope.dept_ids.iter().filter(|d| Some(**d) != operator.dept_id) {
                    users.extend(self.directory.users_by_dept(*dept).await?);
                }
                users
            }
            ActionType::Return => match flow.initiator_id() {
                Some(initiator) => self.directory.users(&[initiator]).await?,
                None => Vec::new(),
            },
        };

        let mut seen = HashSet::new();
        Ok(users.into_iter().filter(|u| seen.insert(u.id)).collect())
    }

    /// Turn a validated selection into concrete approvers.
    pub async fn resolve_approvers(&self, scope: &ApproverScope, selection: &ActionSelection) -> Result<Vec<Approver>> {
        let mut approvers = Vec::new();

        match scope.scope_type {
            ScopeType::Dept => {
                for dept in &selection.dept_ids {
                    approvers.extend(self.dept_handlers(*dept).await?);
                }
            }
            ScopeType::User => {
                approvers.extend(selection.user_ids.iter().map(|u| Approver::new(*u)));
            }
            ScopeType::DeptAndUser => {
                if selection.dept_ids.is_empty() {
                    approvers.extend(selection.user_ids.iter().map(|u| Approver::new(*u)));
                }
                for dept in &selection.dept_ids {
                    if selection.user_ids.is_empty() {
                        approvers.extend(self.dept_handlers(*dept).await?);
                        continue;
                    }
                    let members = self.directory.users_by_dept(*dept).await?;
                    approvers.extend(
                        members
                            .iter()
                            .filter(|m| selection.user_ids.contains(&m.id))
                            .map(|m| Approver::new(m.id).in_dept(*dept)),
                    );
                }
            }
        }

        let mut seen = HashSet::new();
        Ok(approvers.into_iter().filter(|a| seen.insert(a.user_id)).collect())
    }

    /// Department leader, or every member when the department has none.
    async fn dept_handlers(&self, dept_id: DeptId) -> Result<Vec<Approver>> {
        if let Some(leader) = self.directory.dept_leader(dept_id).await? {
            return Ok(vec![Approver::new(leader.id).in_dept(dept_id)]);
        }
        Ok(self
            .directory
            .users_by_dept(dept_id)
            .await?
            .into_iter()
            .map(|u| Approver::new(u.id).in_dept(dept_id))
            .collect())
    }

    /// Approver a return action sends the document back to.
    ///
    /// The latest earlier instance that had an approver wins; with none, the
    /// document's creator.
    pub fn return_target(flow: &FlowInstance, current: &FlowNodeInstance, document: &DocumentInfo) -> Approver {
        flow.previous_assigned(current.sequence)
            .and_then(|ni| ni.approver.clone())
            .unwrap_or_else(|| Approver::new(document.creator_id))
    }

    /// Whether free flow may start from the current position.
    pub fn permits(mode: FlowMode, current: &NodeKey, static_node: Option<&FlowNode>) -> bool {
        match (mode, current) {
            (FlowMode::Free, _) | (_, NodeKey::Dynamic(_)) => true,
            (FlowMode::Fixed | FlowMode::Mixed, NodeKey::Static(_)) => {
                static_node.is_some_and(|n| n.allow_free_flow || n.kind == NodeKind::FreeFlow)
            }
        }
    }

    /// Apply a free-flow action to `flow`.
    ///
    /// Returns the ids of the node instances created. `static_node` is the
    /// definition node of the current instance when it is a static one.
    pub async fn execute(
        &self,
        flow: &mut FlowInstance,
        current_instance_id: Uuid,
        selection: &ActionSelection,
        operator: &UserRef,
        document: &DocumentInfo,
        static_node: Option<&FlowNode>,
    ) -> Result<Vec<Uuid>> {
        flow.ensure_can_proceed("execute a free-flow action on")?;

        let current = flow
            .node_instance(current_instance_id)
            .cloned()
            .ok_or_else(|| FlowError::NotFound(format!("node instance {}", current_instance_id)))?;

        if !current.is_assigned_to(operator.id) {
            return Err(FlowError::Unauthorized(format!(
                "user {} is not the approver of node instance {}",
                operator.id, current_instance_id
            )));
        }
        if current.status() != NodeStatus::Pending {
            return Err(FlowError::InvalidState(format!(
                "node instance {} is {}, not pending",
                current_instance_id,
                current.status()
            )));
        }
        if !Self::permits(flow.mode, &current.node, static_node) {
            return Err(FlowError::InvalidState(format!(
                "free flow is not enabled at {} of flow instance {}",
                current.node, flow.id
            )));
        }

        let action = self
            .catalog
            .action(selection.action_id)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("action {}", selection.action_id)))?;

        let available = self
            .available_actions(document.status, &operator.roles, operator.dept_id)
            .await?;
        if !available.iter().any(|a| a.id == action.id) {
            return Err(FlowError::Unauthorized(format!(
                "action {} is not available to user {}",
                action.id, operator.id
            )));
        }

        let scope = self.approver_scope(action.id).await?;
        scope.validate(selection)?;

        let approvers = if action.is_return() {
            vec![Self::return_target(flow, &current, document)]
        } else {
            self.resolve_approvers(&scope, selection).await?
        };
        if approvers.is_empty() {
            return Err(FlowError::ValidationFailed(format!(
                "action {} resolved no approvers",
                action.id
            )));
        }

        let origin = match current.node {
            NodeKey::Static(id) => Some(id),
            NodeKey::Dynamic(id) => flow.dynamic_node(id).and_then(|n| n.origin),
        };
        let key = flow.add_dynamic_node(DynamicNode::new(action.id, action.name.clone(), action.action_type, origin));

        let detail = FreeFlowDetail {
            action_id: action.id,
            action_name: action.name.clone(),
            selected_dept_ids: selection.dept_ids.clone(),
            selected_user_ids: selection.user_ids.clone(),
            comment: selection.comment.clone(),
        };

        let flow_id = flow.id;
        let batch = Uuid::new_v4();
        let created: Vec<Uuid> = approvers
            .into_iter()
            .map(|approver| {
                flow.add_node_instance(
                    FlowNodeInstance::pending(flow_id, key, batch, approver).with_free_flow(detail.clone()),
                )
            })
            .collect();

        flow.complete_node(current_instance_id, selection.comment.clone())?;
        let closed = flow.close_live_siblings(&current.node, "closed by free-flow action")?;
        if closed > 0 {
            debug!(flow_instance_id = %flow.id, closed, "Live siblings closed");
        }
        flow.move_to(key);

        info!(
            flow_instance_id = %flow.id,
            action_id = action.id,
            action = %action.name,
            approvers = created.len(),
            "Free-flow action executed"
        );

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ProcessVariables;
    use crate::memory::{InMemoryActionCatalog, InMemoryOrgDirectory};

    fn roles(r: &[&str]) -> Vec<RoleId> {
        r.iter().map(|s| s.to_string()).collect()
    }

    fn directory() -> InMemoryOrgDirectory {
        InMemoryOrgDirectory::new()
            .with_user(UserRef::new(1).in_dept(10).with_roles(&["clerk"]))
            .with_user(UserRef::new(2).in_dept(10).with_roles(&["clerk"]))
            .with_user(UserRef::new(3).in_dept(20).with_roles(&["auditor"]))
            .with_user(UserRef::new(4).in_dept(20).with_roles(&["auditor"]))
            .with_leader(20, 4)
    }

    fn engine(catalog: InMemoryActionCatalog) -> FreeFlowEngine {
        FreeFlowEngine::new(Arc::new(catalog), Arc::new(directory()))
    }

    #[test]
    fn test_rule_matching() {
        let wildcard = ActionRule::new(1, 1, 1, "*");
        let scoped = ActionRule::new(2, 1, 1, "manager, clerk").for_dept(10);

        assert!(wildcard.matches(1, &roles(&["anyone"]), None));
        assert!(!wildcard.matches(2, &roles(&["anyone"]), None));
        assert!(!wildcard.matches(1, &[], None));
        assert!(scoped.matches(1, &roles(&["clerk"]), Some(10)));
        assert!(!scoped.matches(1, &roles(&["clerk"]), Some(11)));
        assert!(!scoped.matches(1, &roles(&["guest"]), Some(10)));
        assert!(!wildcard.clone().disabled().matches(1, &roles(&["anyone"]), None));
    }

    #[test]
    fn test_scope_validation() {
        let selection = ActionSelection::new(1).to_depts(vec![10]).to_users(vec![5]);

        assert!(ApproverScope::new(1, ScopeType::DeptAndUser).validate(&selection).is_ok());
        assert!(ApproverScope::new(1, ScopeType::Dept)
            .with_depts(vec![10, 20])
            .validate(&selection)
            .is_ok());
        assert!(matches!(
            ApproverScope::new(1, ScopeType::User).with_users(vec![6]).validate(&selection),
            Err(FlowError::ValidationFailed(_))
        ));
        assert!(ApproverScope::new(1, ScopeType::User)
            .with_users(vec![6])
            .allowing_custom()
            .validate(&selection)
            .is_ok());
    }

    #[tokio::test]
    async fn test_available_actions_set_and_order() {
        let catalog = InMemoryActionCatalog::new()
            .with_action(FlowAction::new(1, "unit", "Unit handling", ActionType::UnitHandle))
            .with_action(FlowAction::new(2, "review", "Review", ActionType::Review))
            .with_action(FlowAction::new(3, "external", "External", ActionType::External))
            .with_action(FlowAction::new(4, "off", "Disabled", ActionType::Review).disabled())
            .with_rule(ActionRule::new(1, 1, 1, "*").with_priority(1))
            .with_rule(ActionRule::new(2, 2, 1, "clerk").for_dept(10).with_priority(5))
            .with_rule(ActionRule::new(3, 3, 1, "auditor"))
            .with_rule(ActionRule::new(4, 4, 1, "*"));

        let actions = engine(catalog)
            .available_actions(1, &roles(&["clerk"]), Some(10))
            .await
            .unwrap();

        assert_eq!(actions.iter().map(|a| a.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_missing_scope_is_permissive() {
        let scope = engine(InMemoryActionCatalog::new()).approver_scope(9).await.unwrap();
        assert_eq!(scope.scope_type, ScopeType::DeptAndUser);
        assert!(scope.allow_custom);
    }

    #[tokio::test]
    async fn test_resolve_by_scope_type() {
        let engine = engine(InMemoryActionCatalog::new());

        // dept 10 has no leader: all members
        let dept = engine
            .resolve_approvers(&ApproverScope::new(1, ScopeType::Dept), &ActionSelection::new(1).to_depts(vec![10, 20]))
            .await
            .unwrap();
        assert_eq!(dept.iter().map(|a| a.user_id).collect::<Vec<_>>(), vec![1, 2, 4]);

        let users = engine
            .resolve_approvers(&ApproverScope::new(1, ScopeType::User), &ActionSelection::new(1).to_users(vec![3, 3, 1]))
            .await
            .unwrap();
        assert_eq!(users.iter().map(|a| a.user_id).collect::<Vec<_>>(), vec![3, 1]);

        let both = engine
            .resolve_approvers(
                &ApproverScope::new(1, ScopeType::DeptAndUser),
                &ActionSelection::new(1).to_depts(vec![10, 20]).to_users(vec![2, 3]),
            )
            .await
            .unwrap();
        assert_eq!(both, vec![Approver::new(2).in_dept(10), Approver::new(3).in_dept(20)]);
    }

    #[tokio::test]
    async fn test_available_approvers_for_unit_handle() {
        let engine = engine(InMemoryActionCatalog::new());
        let action = FlowAction::new(1, "unit", "Unit handling", ActionType::UnitHandle);
        let flow = FlowInstance::start(1, 1, "dispatch", FlowMode::Free, ProcessVariables::new());

        let users = engine
            .available_approvers(&action, &UserRef::new(1).in_dept(20), &flow)
            .await
            .unwrap();
        assert_eq!(users.iter().map(|u| u.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_permits_by_mode() {
        let plain = FlowNode::new(1, 1, "plain");
        let open = FlowNode::new(2, 1, "open").allowing_free_flow();
        let key = NodeKey::Static(1);

        assert!(FreeFlowEngine::permits(FlowMode::Free, &key, Some(&plain)));
        assert!(!FreeFlowEngine::permits(FlowMode::Mixed, &key, Some(&plain)));
        assert!(FreeFlowEngine::permits(FlowMode::Mixed, &key, Some(&open)));
        assert!(!FreeFlowEngine::permits(FlowMode::Fixed, &key, None));
        assert!(FreeFlowEngine::permits(FlowMode::Fixed, &NodeKey::Dynamic(Uuid::new_v4()), None));
    }
}
