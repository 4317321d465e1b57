//! Approver resolution
//!
//! A node's [`ApproverSpec`] is turned into concrete [`Approver`]s by the
//! strategy registered for its [`ApproverType`]. Strategies are looked up in a
//! table, so each one can be replaced or tested on its own.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{OrgDirectory, UserRef};
use crate::definition::{ApproverSpec, ApproverType, FlowNode};
use crate::instance::{FlowInstance, NodeKey, ProcessVariables, APPROVER_IDS_VAR};
use crate::node_instance::Approver;
use crate::{FlowError, Result, RoleId, UserId};

/// Resolves one kind of approver specification
#[async_trait]
pub trait ApproverStrategy: Send + Sync {
    fn approver_type(&self) -> ApproverType;

    async fn resolve(
        &self,
        spec: &ApproverSpec,
        variables: &ProcessVariables,
        directory: &dyn OrgDirectory,
    ) -> Result<Vec<Approver>>;
}

fn to_approver(user: UserRef) -> Approver {
    Approver {
        user_id: user.id,
        dept_id: user.dept_id,
    }
}

/// Explicit user id list
pub struct ExplicitUsers;

#[async_trait]
impl ApproverStrategy for ExplicitUsers {
    fn approver_type(&self) -> ApproverType {
        ApproverType::User
    }

    async fn resolve(
        &self,
        spec: &ApproverSpec,
        _variables: &ProcessVariables,
        directory: &dyn OrgDirectory,
    ) -> Result<Vec<Approver>> {
        let ids = parse_id_list(&spec.value)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let users = directory.users(&ids).await?;
        Ok(users.into_iter().map(to_approver).collect())
    }
}

/// Users holding any of the listed roles
pub struct RoleMembers;

#[async_trait]
impl ApproverStrategy for RoleMembers {
    fn approver_type(&self) -> ApproverType {
        ApproverType::Role
    }

    async fn resolve(
        &self,
        spec: &ApproverSpec,
        _variables: &ProcessVariables,
        directory: &dyn OrgDirectory,
    ) -> Result<Vec<Approver>> {
        let roles = parse_token_list(&spec.value)?;
        if roles.is_empty() {
            return Ok(Vec::new());
        }
        let users = directory.users_by_role(&roles).await?;
        Ok(users.into_iter().map(to_approver).collect())
    }
}

/// Department leaders, falling back to every member of a leaderless department
pub struct DeptLeaders;

#[async_trait]
impl ApproverStrategy for DeptLeaders {
    fn approver_type(&self) -> ApproverType {
        ApproverType::DeptLeader
    }

    async fn resolve(
        &self,
        spec: &ApproverSpec,
        _variables: &ProcessVariables,
        directory: &dyn OrgDirectory,
    ) -> Result<Vec<Approver>> {
        let mut approvers = Vec::new();
        for dept_id in parse_id_list(&spec.value)? {
            match directory.dept_leader(dept_id).await? {
                Some(leader) => approvers.push(Approver::new(leader.id).in_dept(dept_id)),
                None => {
                    let members = directory.users_by_dept(dept_id).await?;
                    debug!(dept_id, members = members.len(), "Department has no leader, using all members");
                    approvers.extend(members.into_iter().map(|u| Approver::new(u.id).in_dept(dept_id)));
                }
            }
        }
        Ok(approvers)
    }
}

/// Users the initiator picked, read from the `approverIds` variable
pub struct InitiatorSelected;

#[async_trait]
impl ApproverStrategy for InitiatorSelected {
    fn approver_type(&self) -> ApproverType {
        ApproverType::Initiator
    }

    async fn resolve(
        &self,
        _spec: &ApproverSpec,
        variables: &ProcessVariables,
        directory: &dyn OrgDirectory,
    ) -> Result<Vec<Approver>> {
        let Some(value) = variables.get(APPROVER_IDS_VAR) else {
            return Ok(Vec::new());
        };
        let ids = parse_id_value(value)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let users = directory.users(&ids).await?;
        Ok(users.into_iter().map(to_approver).collect())
    }
}

/// Strategy lookup table plus the directory strategies resolve against
pub struct ApproverResolver {
    strategies: HashMap<ApproverType, Arc<dyn ApproverStrategy>>,
    directory: Arc<dyn OrgDirectory>,
}

impl ApproverResolver {
    /// Resolver with the four built-in strategies registered.
    pub fn new(directory: Arc<dyn OrgDirectory>) -> Self {
        Self::empty(directory)
            .with_strategy(Arc::new(ExplicitUsers))
            .with_strategy(Arc::new(RoleMembers))
            .with_strategy(Arc::new(DeptLeaders))
            .with_strategy(Arc::new(InitiatorSelected))
    }

    pub fn empty(directory: Arc<dyn OrgDirectory>) -> Self {
        Self {
            strategies: HashMap::new(),
            directory,
        }
    }

    /// Register a strategy, replacing any existing one for the same type.
    pub fn with_strategy(mut self, strategy: Arc<dyn ApproverStrategy>) -> Self {
        self.strategies.insert(strategy.approver_type(), strategy);
        self
    }

    pub fn directory(&self) -> &Arc<dyn OrgDirectory> {
        &self.directory
    }

    /// Resolve the approvers of `node`. Never returns an empty list.
    pub async fn assign(&self, node: &FlowNode, variables: &ProcessVariables) -> Result<Vec<Approver>> {
        let spec = node.approver.as_ref().ok_or_else(|| {
            FlowError::ValidationFailed(format!("node {} has no approver specification", node.id))
        })?;

        let strategy = self.strategies.get(&spec.approver_type).ok_or_else(|| {
            FlowError::Configuration(format!(
                "no approver strategy registered for {:?}",
                spec.approver_type
            ))
        })?;

        let resolved = strategy.resolve(spec, variables, self.directory.as_ref()).await?;

        let mut seen = HashSet::new();
        let approvers: Vec<Approver> = resolved.into_iter().filter(|a| seen.insert(a.user_id)).collect();

        if approvers.is_empty() {
            warn!(node_id = node.id, approver_type = ?spec.approver_type, value = %spec.value, "Approver resolution returned no users");
            return Err(FlowError::ValidationFailed(format!(
                "no approvers resolved for node {} ({:?} '{}')",
                node.id, spec.approver_type, spec.value
            )));
        }

        debug!(node_id = node.id, count = approvers.len(), "Approvers resolved");
        Ok(approvers)
    }
}

/// True iff `user_id` holds a handleable instance of `node` in `flow`.
pub fn has_approval_permission(flow: &FlowInstance, user_id: UserId, node: &NodeKey) -> bool {
    flow.has_approval_permission(user_id, node)
}

/// Parse an id list written as a JSON array (`[1, "2"]`) or a comma list (`1,2`).
pub fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| FlowError::ValidationFailed(format!("invalid id list '{}': {}", raw, e)))?;
        return parse_id_value(&value);
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| FlowError::ValidationFailed(format!("invalid id '{}' in '{}'", s, raw)))
        })
        .collect()
}

/// Id list held in a process variable: array, numeric, or string form.
pub fn parse_id_value(value: &Value) -> Result<Vec<i64>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Number(n) => n
            .as_i64()
            .map(|id| vec![id])
            .ok_or_else(|| FlowError::ValidationFailed(format!("invalid id {}", n))),
        Value::String(s) => parse_id_list(s),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .ok_or_else(|| FlowError::ValidationFailed(format!("invalid id {}", item))))
            .collect(),
        other => Err(FlowError::ValidationFailed(format!("invalid id list {}", other))),
    }
}

/// Parse role codes written as a JSON array or a comma list.
pub fn parse_token_list(raw: &str) -> Result<Vec<RoleId>> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        let items: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| FlowError::ValidationFailed(format!("invalid list '{}': {}", raw, e)))?;
        return Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect());
    }
    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}
