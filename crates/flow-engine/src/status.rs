//! Flow and node lifecycle status types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Flow is running
    Processing,
    /// Flow reached its end
    Completed,
    /// Flow was stopped by a rejection
    Terminated,
    /// Flow is paused and may be resumed
    Suspended,
    /// Flow was withdrawn by its initiator
    Cancelled,
}

impl FlowStatus {
    pub fn code(self) -> i32 {
        match self {
            FlowStatus::Processing => 0,
            FlowStatus::Completed => 1,
            FlowStatus::Terminated => 2,
            FlowStatus::Suspended => 3,
            FlowStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(FlowStatus::Processing),
            1 => Some(FlowStatus::Completed),
            2 => Some(FlowStatus::Terminated),
            3 => Some(FlowStatus::Suspended),
            4 => Some(FlowStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether completion, termination or cancellation may be applied.
    pub fn can_proceed(self) -> bool {
        matches!(self, FlowStatus::Processing | FlowStatus::Suspended)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Terminated | FlowStatus::Cancelled
        )
    }
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowStatus::Processing => "processing",
            FlowStatus::Completed => "completed",
            FlowStatus::Terminated => "terminated",
            FlowStatus::Suspended => "suspended",
            FlowStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
    Skipped,
}

impl NodeStatus {
    pub fn code(self) -> i32 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Processing => 1,
            NodeStatus::Completed => 2,
            NodeStatus::Rejected => 3,
            NodeStatus::Skipped => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(NodeStatus::Pending),
            1 => Some(NodeStatus::Processing),
            2 => Some(NodeStatus::Completed),
            3 => Some(NodeStatus::Rejected),
            4 => Some(NodeStatus::Skipped),
            _ => None,
        }
    }

    /// Only these states accept complete, reject or skip.
    pub fn can_handle(self) -> bool {
        matches!(self, NodeStatus::Pending | NodeStatus::Processing)
    }

    /// States that satisfy a join. Rejected is terminal but not finished.
    pub fn is_finished(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Processing => "processing",
            NodeStatus::Completed => "completed",
            NodeStatus::Rejected => "rejected",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}
