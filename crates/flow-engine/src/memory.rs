//! In-process collaborator implementations
//!
//! Used by tests and by embedders that keep flow state in memory. Each type
//! is cheap to clone and shares its storage between clones.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::collaborators::{
    ActionCatalog, DefinitionRepository, DocumentInfo, DocumentLookup, FlowRepository, OrgDirectory, UserRef,
};
use crate::definition::FlowDefinition;
use crate::free_flow::{ActionRule, ApproverScope, FlowAction};
use crate::instance::FlowInstance;
use crate::{ActionId, DefinitionId, DeptId, DocumentId, FlowError, Result, RoleId, UserId};

#[derive(Clone, Default)]
pub struct InMemoryDocuments {
    documents: Arc<DashMap<DocumentId, DocumentInfo>>,
    published: Arc<Mutex<Vec<DocumentId>>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, document: DocumentInfo) -> Self {
        self.insert(document);
        self
    }

    pub fn insert(&self, document: DocumentInfo) {
        self.documents.insert(document.id, document);
    }

    /// Documents published so far, in call order.
    pub fn published(&self) -> Vec<DocumentId> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DocumentLookup for InMemoryDocuments {
    async fn get(&self, document_id: DocumentId) -> Result<Option<DocumentInfo>> {
        Ok(self.documents.get(&document_id).map(|d| d.clone()))
    }

    async fn publish(&self, document_id: DocumentId) -> Result<()> {
        if !self.documents.contains_key(&document_id) {
            return Err(FlowError::NotFound(format!("document {}", document_id)));
        }
        self.published.lock().push(document_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOrgDirectory {
    users: Arc<DashMap<UserId, UserRef>>,
    leaders: Arc<DashMap<DeptId, UserId>>,
}

impl InMemoryOrgDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: UserRef) -> Self {
        self.users.insert(user.id, user);
        self
    }

    pub fn with_leader(self, dept_id: DeptId, user_id: UserId) -> Self {
        self.leaders.insert(dept_id, user_id);
        self
    }

    fn sorted(mut users: Vec<UserRef>) -> Vec<UserRef> {
        users.sort_by_key(|u| u.id);
        users
    }
}

#[async_trait]
impl OrgDirectory for InMemoryOrgDirectory {
    async fn user(&self, user_id: UserId) -> Result<Option<UserRef>> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn users(&self, user_ids: &[UserId]) -> Result<Vec<UserRef>> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| u.clone()))
            .collect())
    }

    async fn users_by_role(&self, role_ids: &[RoleId]) -> Result<Vec<UserRef>> {
        let users = self
            .users
            .iter()
            .filter(|u| u.roles.iter().any(|r| role_ids.contains(r)))
            .map(|u| u.clone())
            .collect();
        Ok(Self::sorted(users))
    }

    async fn dept_leader(&self, dept_id: DeptId) -> Result<Option<UserRef>> {
        let Some(leader) = self.leaders.get(&dept_id).map(|l| *l) else {
            return Ok(None);
        };
        Ok(self.users.get(&leader).map(|u| u.clone()))
    }

    async fn users_by_dept(&self, dept_id: DeptId) -> Result<Vec<UserRef>> {
        let users = self
            .users
            .iter()
            .filter(|u| u.dept_id == Some(dept_id))
            .map(|u| u.clone())
            .collect();
        Ok(Self::sorted(users))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDefinitions {
    definitions: Arc<DashMap<DefinitionId, FlowDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definition(self, definition: FlowDefinition) -> Self {
        self.definitions.insert(definition.id, definition);
        self
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitions {
    async fn find(&self, id: DefinitionId) -> Result<Option<FlowDefinition>> {
        Ok(self.definitions.get(&id).map(|d| d.clone()))
    }

    async fn save(&self, definition: &FlowDefinition) -> Result<()> {
        self.definitions.insert(definition.id, definition.clone());
        Ok(())
    }
}

/// Versioned flow store. A save must carry the version it was loaded with.
#[derive(Clone, Default)]
pub struct InMemoryFlowRepository {
    flows: Arc<DashMap<Uuid, FlowInstance>>,
}

impl InMemoryFlowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[async_trait]
impl FlowRepository for InMemoryFlowRepository {
    async fn find(&self, id: Uuid) -> Result<Option<FlowInstance>> {
        Ok(self.flows.get(&id).map(|f| f.clone()))
    }

    async fn find_by_node_instance(&self, node_instance_id: Uuid) -> Result<Option<FlowInstance>> {
        Ok(self
            .flows
            .iter()
            .find(|f| f.node_instance(node_instance_id).is_some())
            .map(|f| f.clone()))
    }

    async fn find_by_document(&self, document_id: DocumentId) -> Result<Vec<FlowInstance>> {
        let mut flows: Vec<FlowInstance> = self
            .flows
            .iter()
            .filter(|f| f.document_id == document_id)
            .map(|f| f.clone())
            .collect();
        flows.sort_by_key(|f| f.started_at);
        Ok(flows)
    }

    async fn save(&self, flow: &FlowInstance) -> Result<u64> {
        let expected = flow.version();
        let mut stored = flow.clone();
        stored.take_events();

        let version = match self.flows.entry(flow.id) {
            Entry::Occupied(mut entry) => {
                let found = entry.get().version();
                if found != expected {
                    return Err(FlowError::Conflict {
                        id: flow.id,
                        expected,
                        found,
                    });
                }
                stored.set_version(found + 1);
                entry.insert(stored);
                found + 1
            }
            Entry::Vacant(entry) => {
                if expected != 0 {
                    return Err(FlowError::Conflict {
                        id: flow.id,
                        expected,
                        found: 0,
                    });
                }
                stored.set_version(1);
                entry.insert(stored);
                1
            }
        };

        debug!(flow_instance_id = %flow.id, version, "Flow instance saved");
        Ok(version)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryActionCatalog {
    actions: Arc<DashMap<ActionId, FlowAction>>,
    rules: Arc<DashMap<ActionId, Vec<ActionRule>>>,
    scopes: Arc<DashMap<ActionId, ApproverScope>>,
}

impl InMemoryActionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_action(self, action: FlowAction) -> Self {
        self.actions.insert(action.id, action);
        self
    }

    pub fn with_rule(self, rule: ActionRule) -> Self {
        self.rules.entry(rule.action_id).or_default().push(rule);
        self
    }

    pub fn with_scope(self, scope: ApproverScope) -> Self {
        self.scopes.insert(scope.action_id, scope);
        self
    }
}

#[async_trait]
impl ActionCatalog for InMemoryActionCatalog {
    async fn enabled_actions(&self) -> Result<Vec<FlowAction>> {
        let mut actions: Vec<FlowAction> = self
            .actions
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.clone())
            .collect();
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }

    async fn action(&self, action_id: ActionId) -> Result<Option<FlowAction>> {
        Ok(self.actions.get(&action_id).map(|a| a.clone()))
    }

    async fn rules_for(&self, action_id: ActionId) -> Result<Vec<ActionRule>> {
        Ok(self.rules.get(&action_id).map(|r| r.clone()).unwrap_or_default())
    }

    async fn scope_for(&self, action_id: ActionId) -> Result<Option<ApproverScope>> {
        Ok(self.scopes.get(&action_id).map(|s| s.clone()))
    }
}
