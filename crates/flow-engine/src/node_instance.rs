//! Node instances: one assigned occurrence of a step within a flow instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instance::NodeKey;
use crate::status::NodeStatus;
use crate::{ActionId, DeptId, FlowError, NodeId, Result, UserId};

/// A concrete approver identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Approver {
    pub user_id: UserId,
    #[serde(default)]
    pub dept_id: Option<DeptId>,
}

impl Approver {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            dept_id: None,
        }
    }

    pub fn in_dept(mut self, dept_id: DeptId) -> Self {
        self.dept_id = Some(dept_id);
        self
    }
}

/// Extra detail recorded for instances created by a free-flow action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeFlowDetail {
    pub action_id: ActionId,
    pub action_name: String,
    #[serde(default)]
    pub selected_dept_ids: Vec<DeptId>,
    #[serde(default)]
    pub selected_user_ids: Vec<UserId>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    pub id: Uuid,
    pub flow_instance_id: Uuid,
    pub node: NodeKey,
    /// Instances created by the same assignment share a batch; siblings are batch members
    pub batch: Uuid,
    #[serde(default)]
    pub approver: Option<Approver>,
    status: NodeStatus,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Creation order within the flow instance, assigned by the aggregate
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub free_flow: Option<FreeFlowDetail>,
}

impl FlowNodeInstance {
    /// A pending instance awaiting `approver`.
    pub fn pending(flow_instance_id: Uuid, node: NodeKey, batch: Uuid, approver: Approver) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_instance_id,
            node,
            batch,
            approver: Some(approver),
            status: NodeStatus::Pending,
            comments: None,
            handled_at: None,
            created_at: Utc::now(),
            sequence: 0,
            free_flow: None,
        }
    }

    /// A skipped record with no approver and no pending task.
    pub fn skipped(flow_instance_id: Uuid, node: NodeKey, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_instance_id,
            node,
            batch: Uuid::new_v4(),
            approver: None,
            status: NodeStatus::Skipped,
            comments: Some(reason.into()),
            handled_at: Some(now),
            created_at: now,
            sequence: 0,
            free_flow: None,
        }
    }

    /// A completed record for a gateway routing passed through.
    pub fn passed(flow_instance_id: Uuid, node: NodeKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_instance_id,
            node,
            batch: Uuid::new_v4(),
            approver: None,
            status: NodeStatus::Completed,
            comments: Some("gateway passed".to_string()),
            handled_at: Some(now),
            created_at: now,
            sequence: 0,
            free_flow: None,
        }
    }

    pub fn with_free_flow(mut self, detail: FreeFlowDetail) -> Self {
        self.free_flow = Some(detail);
        self
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Static node id; `None` for free-flow instances.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node.static_id()
    }

    pub fn approver_id(&self) -> Option<UserId> {
        self.approver.as_ref().map(|a| a.user_id)
    }

    pub fn is_assigned_to(&self, user_id: UserId) -> bool {
        self.approver_id() == Some(user_id)
    }

    pub fn is_live(&self) -> bool {
        self.status.can_handle()
    }

    pub fn start_processing(&mut self) -> Result<()> {
        if self.status != NodeStatus::Pending {
            return Err(self.invalid("start processing"));
        }
        self.status = NodeStatus::Processing;
        Ok(())
    }

    pub fn complete(&mut self, comments: Option<String>) -> Result<()> {
        self.finish(NodeStatus::Completed, comments, "complete")
    }

    pub fn reject(&mut self, comments: Option<String>) -> Result<()> {
        self.finish(NodeStatus::Rejected, comments, "reject")
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.finish(NodeStatus::Skipped, Some(reason.into()), "skip")
    }

    fn finish(&mut self, status: NodeStatus, comments: Option<String>, op: &str) -> Result<()> {
        if !self.status.can_handle() {
            return Err(self.invalid(op));
        }
        self.status = status;
        self.comments = comments;
        self.handled_at = Some(Utc::now());
        Ok(())
    }

    fn invalid(&self, op: &str) -> FlowError {
        FlowError::InvalidState(format!(
            "cannot {} node instance {} in status {}",
            op, self.id, self.status
        ))
    }
}
