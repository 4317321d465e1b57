//! Contracts for the systems the engine consumes but does not own
//!
//! Storage technology, the organisation directory and the document store live
//! behind these traits. `crate::memory` provides in-process implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::FlowDefinition;
use crate::free_flow::{ActionRule, ApproverScope, FlowAction};
use crate::instance::FlowInstance;
use crate::{ActionId, DefinitionId, DeptId, DocumentId, Result, RoleId, UserId};

/// What the engine needs to know about the subject document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub status: i32,
    pub creator_id: UserId,
}

/// A user as seen by the organisation directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    #[serde(default)]
    pub dept_id: Option<DeptId>,
    /// Role codes held by the user
    #[serde(default)]
    pub roles: Vec<RoleId>,
}

impl UserRef {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            dept_id: None,
            roles: Vec::new(),
        }
    }

    pub fn in_dept(mut self, dept_id: DeptId) -> Self {
        self.dept_id = Some(dept_id);
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentLookup: Send + Sync {
    async fn get(&self, document_id: DocumentId) -> Result<Option<DocumentInfo>>;

    /// Publish the document once its flow has completed.
    async fn publish(&self, document_id: DocumentId) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrgDirectory: Send + Sync {
    async fn user(&self, user_id: UserId) -> Result<Option<UserRef>>;

    /// Known users among `user_ids`; unknown ids are left out.
    async fn users(&self, user_ids: &[UserId]) -> Result<Vec<UserRef>>;

    /// Users holding any of `role_ids`.
    async fn users_by_role(&self, role_ids: &[RoleId]) -> Result<Vec<UserRef>>;

    async fn dept_leader(&self, dept_id: DeptId) -> Result<Option<UserRef>>;

    async fn users_by_dept(&self, dept_id: DeptId) -> Result<Vec<UserRef>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn find(&self, id: DefinitionId) -> Result<Option<FlowDefinition>>;

    async fn save(&self, definition: &FlowDefinition) -> Result<()>;
}

/// Source of truth for flow instance aggregates.
///
/// `save` persists the whole aggregate, node instances included. The stored
/// version must equal `flow.version()`, otherwise the write is refused with
/// `FlowError::Conflict`. Returns the new version.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FlowRepository: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<FlowInstance>>;

    async fn find_by_node_instance(&self, node_instance_id: Uuid) -> Result<Option<FlowInstance>>;

    async fn find_by_document(&self, document_id: DocumentId) -> Result<Vec<FlowInstance>>;

    async fn save(&self, flow: &FlowInstance) -> Result<u64>;
}

/// Free-flow actions, their matching rules and approver scopes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionCatalog: Send + Sync {
    async fn enabled_actions(&self) -> Result<Vec<FlowAction>>;

    async fn action(&self, action_id: ActionId) -> Result<Option<FlowAction>>;

    async fn rules_for(&self, action_id: ActionId) -> Result<Vec<ActionRule>>;

    async fn scope_for(&self, action_id: ActionId) -> Result<Option<ApproverScope>>;
}
