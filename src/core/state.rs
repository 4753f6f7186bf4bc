//! Execution state models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Created, not yet facilitated
    Queued,
    /// Facilitator is choosing the execution mode
    Facilitating,
    /// Step is running (or its sync outcome is being advised)
    Executing,
    /// Waiting on a delegated task
    TaskWaiting,
    /// Waiting on one or more async callbacks
    AsyncWaiting,
    /// Waiting on spawned child executions
    ChildWaiting,
    /// All awaited results are in, adviser is deciding
    Resuming,
    Succeeded,
    Failed,
    Aborted,
    Skipped,
}

impl NodeStatus {
    /// Check if the status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Aborted | NodeStatus::Skipped
        )
    }

    /// Check if the node is suspended on an outstanding-callback set
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            NodeStatus::TaskWaiting | NodeStatus::AsyncWaiting | NodeStatus::ChildWaiting
        )
    }

    /// Whether `self -> to` is an edge of the node state machine
    pub fn can_transition_to(&self, to: NodeStatus) -> bool {
        use NodeStatus::*;

        if self.is_terminal() {
            return false;
        }
        if to == Aborted {
            return true;
        }

        match (self, to) {
            (Queued, Facilitating) => true,
            (Facilitating, Executing) => true,
            // parameters could not be resolved or facilitation itself errored
            (Facilitating, Failed) => true,
            (Executing, Succeeded | Failed | TaskWaiting | AsyncWaiting | ChildWaiting) => true,
            (TaskWaiting | AsyncWaiting, Resuming) => true,
            // deadline exceeded
            (TaskWaiting | AsyncWaiting, Failed) => true,
            (ChildWaiting, Resuming) => true,
            (Resuming, Executing | Succeeded | Failed | Skipped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Queued => "QUEUED",
            NodeStatus::Facilitating => "FACILITATING",
            NodeStatus::Executing => "EXECUTING",
            NodeStatus::TaskWaiting => "TASK_WAITING",
            NodeStatus::AsyncWaiting => "ASYNC_WAITING",
            NodeStatus::ChildWaiting => "CHILD_WAITING",
            NodeStatus::Resuming => "RESUMING",
            NodeStatus::Succeeded => "SUCCEEDED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Aborted => "ABORTED",
            NodeStatus::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Overall plan execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Running => "Running",
            PlanStatus::Succeeded => "Succeeded",
            PlanStatus::Failed => "Failed",
            PlanStatus::Aborted => "Aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Running" => Some(PlanStatus::Running),
            "Succeeded" => Some(PlanStatus::Succeeded),
            "Failed" => Some(PlanStatus::Failed),
            "Aborted" => Some(PlanStatus::Aborted),
            _ => None,
        }
    }
}
