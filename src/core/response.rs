//! Step outcomes and executable responses

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::core::error::{FailureInfo, FailureKind};

/// Correlation token for an asynchronous result
pub type CallbackId = String;

/// Results keyed by the callback id that produced them
pub type ResponseMap = BTreeMap<CallbackId, ResponseData>;

/// How a step should run, decided by the facilitator before it runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Run and block the caller
    Sync,
    /// Fire and let the engine track callbacks (also used for spawning children)
    Async,
    /// Delegate execution to a remote worker
    Task,
}

/// Status a step reports for its own work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// A step's final word on its work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: StepStatus,

    #[serde(default)]
    pub output: Value,

    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn succeeded(output: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            output,
            failure: None,
        }
    }

    pub fn failed(failure: FailureInfo) -> Self {
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            failure: Some(failure),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            output: Value::Null,
            failure: None,
        }
    }

    /// Default aggregation of callback results: any failure fails the whole
    pub fn aggregate(responses: &ResponseMap) -> Self {
        let failed: Vec<(&CallbackId, &ResponseData)> = responses
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Failed)
            .collect();

        if !failed.is_empty() {
            let ids: Vec<&str> = failed.iter().map(|(id, _)| id.as_str()).collect();
            let kind = failed
                .iter()
                .find_map(|(_, r)| r.failure.as_ref().map(|f| f.kind))
                .unwrap_or(FailureKind::StepExecution);
            let detail = failed
                .iter()
                .filter_map(|(_, r)| r.failure.as_ref().map(|f| f.message.clone()))
                .collect::<Vec<_>>()
                .join("; ");
            let message = if detail.is_empty() {
                format!("{} of {} results failed: {}", ids.len(), responses.len(), ids.join(", "))
            } else {
                format!(
                    "{} of {} results failed: {} ({})",
                    ids.len(),
                    responses.len(),
                    ids.join(", "),
                    detail
                )
            };
            return StepResponse::failed(FailureInfo::new(kind, message));
        }

        if !responses.is_empty() && responses.values().all(|r| r.status == StepStatus::Skipped) {
            return StepResponse::skipped();
        }

        let output: serde_json::Map<String, Value> = responses
            .iter()
            .map(|(id, r)| (id.clone(), r.payload.clone()))
            .collect();
        StepResponse::succeeded(Value::Object(output))
    }
}

/// What a callback reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    pub status: StepStatus,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub failure: Option<FailureInfo>,
}

impl ResponseData {
    pub fn success(payload: Value) -> Self {
        Self {
            status: StepStatus::Succeeded,
            payload,
            failure: None,
        }
    }

    pub fn failure(failure: FailureInfo) -> Self {
        Self {
            status: StepStatus::Failed,
            payload: Value::Null,
            failure: Some(failure),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: StepStatus::Skipped,
            payload: Value::Null,
            failure: None,
        }
    }
}

/// Join or race semantics for an async wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    /// Resume once every callback id reported
    #[default]
    All,
    /// Resume on the first report
    Any,
}

/// Work handed to a delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Which runner on the delegate side handles this task
    pub kind: String,

    #[serde(default)]
    pub payload: Value,

    /// Overrides the configured default task timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// How a step tells the engine to continue after `execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    /// Finished inline
    Sync { response: StepResponse },
    /// Park until the given callback ids report
    Async {
        callback_ids: Vec<CallbackId>,
        #[serde(default)]
        wait: WaitMode,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Delegate to the remote executor pool
    Task { task: TaskSpec },
    /// Run one child plan node
    SpawnChild { child: String },
    /// Run several child plan nodes; `max_concurrency = Some(1)` makes an ordered chain
    SpawnChildren {
        children: Vec<String>,
        #[serde(default)]
        max_concurrency: Option<usize>,
    },
}

impl ExecutableResponse {
    /// Whether a step facilitated as `mode` may return this response
    pub fn allowed_in(&self, mode: ExecutionMode) -> bool {
        match self {
            ExecutableResponse::Sync { .. } => mode == ExecutionMode::Sync,
            ExecutableResponse::Task { .. } => mode == ExecutionMode::Task,
            ExecutableResponse::Async { .. }
            | ExecutableResponse::SpawnChild { .. }
            | ExecutableResponse::SpawnChildren { .. } => mode == ExecutionMode::Async,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutableResponse::Sync { .. } => "sync",
            ExecutableResponse::Async { .. } => "async",
            ExecutableResponse::Task { .. } => "task",
            ExecutableResponse::SpawnChild { .. } => "spawn_child",
            ExecutableResponse::SpawnChildren { .. } => "spawn_children",
        }
    }
}
