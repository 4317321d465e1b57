//! Approval flow engine
//!
//! This crate routes a document through approval steps that are either
//! predeclared in a flow definition or chosen at run time:
//! - Flow and node lifecycle state machines
//! - Successor routing with parallel/condition split and join gateways
//! - Skip-condition chaining with a bounded depth
//! - Approver resolution by strategy (users, roles, department leaders, initiator)
//! - Free-flow actions that create ephemeral nodes outside the static graph
//! - A cache-aside read path guarded by a single-flight lock

pub mod approver;
pub mod collaborators;
pub mod condition;
pub mod definition;
pub mod events;
pub mod free_flow;
pub mod graph;
pub mod instance;
pub mod memory;
pub mod node_instance;
pub mod read;
pub mod routing;
pub mod service;
pub mod status;

pub use approver::{has_approval_permission, parse_id_list, ApproverResolver, ApproverStrategy};
pub use collaborators::{
    ActionCatalog, DefinitionRepository, DocumentInfo, DocumentLookup, FlowRepository, OrgDirectory, UserRef,
};
pub use condition::{ConditionEvaluator, ExpressionEvaluator};
pub use definition::{ApproverSpec, ApproverType, FlowDefinition, FlowNode, GatewayMode, GatewayType, NodeKind};
pub use events::FlowEvent;
pub use free_flow::{
    ActionRule, ActionSelection, ActionType, ApproverScope, FlowAction, FreeFlowEngine, ScopeType,
};
pub use graph::{FlowGraph, GraphError};
pub use instance::{DynamicNode, FlowInstance, FlowMode, NodeKey, ProcessVariables};
pub use node_instance::{Approver, FlowNodeInstance, FreeFlowDetail};
pub use read::{CacheInvalidator, CachedFlowReader};
pub use routing::{Advance, NodeRouter};
pub use service::{FlowOutcome, FlowService, StartFlow};
pub use status::{FlowStatus, NodeStatus};

use thiserror::Error;

pub type DefinitionId = i64;
pub type NodeId = i64;
pub type DocumentId = i64;
pub type UserId = i64;
pub type DeptId = i64;
pub type ActionId = i64;
pub type RoleId = String;

/// Closed classification of [`FlowError`] for callers that branch on the failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    Unauthorized,
    ValidationFailed,
    Configuration,
    Conflict,
    Storage,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Version conflict on flow instance {id}: expected {expected}, found {found}")]
    Conflict { id: uuid::Uuid, expected: u64, found: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] flow_core::CoreError),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::NotFound(_) => ErrorKind::NotFound,
            FlowError::InvalidState(_) => ErrorKind::InvalidState,
            FlowError::Unauthorized(_) => ErrorKind::Unauthorized,
            FlowError::ValidationFailed(_) | FlowError::Serialization(_) => ErrorKind::ValidationFailed,
            FlowError::Configuration(_) | FlowError::Graph(_) => ErrorKind::Configuration,
            FlowError::Conflict { .. } => ErrorKind::Conflict,
            FlowError::Storage(_) | FlowError::Core(_) => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
