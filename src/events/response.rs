//! Response events: how workers describe what happened to a node execution

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::advise::AdviserDecision;
use crate::core::{
    error::FailureInfo,
    response::{CallbackId, ExecutableResponse, ExecutionMode, ResponseData, StepResponse, TaskSpec},
};

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide event sequence
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Event kind, used for logging and journal filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseEventKind {
    AddExecutableResponse,
    HandleStepResponse,
    ResumeNodeExecution,
    SpawnChild,
    SpawnChildren,
    SuspendChain,
    QueueTask,
    HandleAdviserResponse,
    HandleFacilitateResponse,
    HandleEventError,
}

impl fmt::Display for ResponseEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseEventKind::AddExecutableResponse => "ADD_EXECUTABLE_RESPONSE",
            ResponseEventKind::HandleStepResponse => "HANDLE_STEP_RESPONSE",
            ResponseEventKind::ResumeNodeExecution => "RESUME_NODE_EXECUTION",
            ResponseEventKind::SpawnChild => "SPAWN_CHILD",
            ResponseEventKind::SpawnChildren => "SPAWN_CHILDREN",
            ResponseEventKind::SuspendChain => "SUSPEND_CHAIN",
            ResponseEventKind::QueueTask => "QUEUE_TASK",
            ResponseEventKind::HandleAdviserResponse => "HANDLE_ADVISER_RESPONSE",
            ResponseEventKind::HandleFacilitateResponse => "HANDLE_FACILITATE_RESPONSE",
            ResponseEventKind::HandleEventError => "HANDLE_EVENT_ERROR",
        };
        f.write_str(name)
    }
}

/// Variant payload of a response event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponsePayload {
    /// Async wait registration
    AddExecutableResponse { response: ExecutableResponse },
    /// Final step outcome, goes to the advisers
    HandleStepResponse { response: StepResponse },
    /// One awaited callback id reported
    ResumeNodeExecution {
        callback_id: CallbackId,
        data: ResponseData,
        /// In-place attempt the callback was issued for; stale attempts are dropped
        #[serde(default)]
        attempt: Option<u32>,
    },
    SpawnChild { child: String },
    SpawnChildren {
        children: Vec<String>,
        max_concurrency: Option<usize>,
    },
    /// A chained child failed; stop starting the remaining links
    SuspendChain { failed_child: Uuid },
    QueueTask { task: TaskSpec },
    HandleAdviserResponse { decision: AdviserDecision },
    HandleFacilitateResponse { mode: ExecutionMode },
    /// The worker could not run the step at all
    HandleEventError { failure: FailureInfo },
}

impl ResponsePayload {
    pub fn kind(&self) -> ResponseEventKind {
        match self {
            ResponsePayload::AddExecutableResponse { .. } => ResponseEventKind::AddExecutableResponse,
            ResponsePayload::HandleStepResponse { .. } => ResponseEventKind::HandleStepResponse,
            ResponsePayload::ResumeNodeExecution { .. } => ResponseEventKind::ResumeNodeExecution,
            ResponsePayload::SpawnChild { .. } => ResponseEventKind::SpawnChild,
            ResponsePayload::SpawnChildren { .. } => ResponseEventKind::SpawnChildren,
            ResponsePayload::SuspendChain { .. } => ResponseEventKind::SuspendChain,
            ResponsePayload::QueueTask { .. } => ResponseEventKind::QueueTask,
            ResponsePayload::HandleAdviserResponse { .. } => ResponseEventKind::HandleAdviserResponse,
            ResponsePayload::HandleFacilitateResponse { .. } => {
                ResponseEventKind::HandleFacilitateResponse
            }
            ResponsePayload::HandleEventError { .. } => ResponseEventKind::HandleEventError,
        }
    }

    /// Translate an executable response into the event that applies it
    pub fn from_executable(response: ExecutableResponse) -> Self {
        match response {
            ExecutableResponse::Sync { response } => ResponsePayload::HandleStepResponse { response },
            ExecutableResponse::Task { task } => ResponsePayload::QueueTask { task },
            ExecutableResponse::SpawnChild { child } => ResponsePayload::SpawnChild { child },
            ExecutableResponse::SpawnChildren {
                children,
                max_concurrency,
            } => ResponsePayload::SpawnChildren {
                children,
                max_concurrency,
            },
            response @ ExecutableResponse::Async { .. } => {
                ResponsePayload::AddExecutableResponse { response }
            }
        }
    }
}

/// Message a worker (or the orchestrator itself) sends about one node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub node_execution_id: Uuid,

    /// Monotonic; with the node id it is the idempotence key
    pub sequence: u64,

    pub payload: ResponsePayload,

    pub created_at: DateTime<Utc>,
}

impl ResponseEvent {
    pub fn new(node_execution_id: Uuid, payload: ResponsePayload) -> Self {
        Self {
            node_execution_id,
            sequence: next_sequence(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> ResponseEventKind {
        self.payload.kind()
    }
}
