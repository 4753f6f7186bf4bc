//! Task dispatcher
//!
//! Hands task payloads to a [`Delegate`] and correlates the results that come
//! back. The dispatcher never looks inside a payload. Each task id resolves at
//! most once; later reports for it are discarded.

pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::{
    error::{EngineError, FailureInfo, FailureKind, Result},
    response::{ExecutionMode, ResponseData},
};
use crate::events::{ResponseEvent, ResponseEventChannel, ResponsePayload};

pub use local::{LocalDelegatePool, ShellTaskRunner, TaskRunner};

/// Correlation id of a delegated task; also the callback id its node waits on
pub type TaskId = Uuid;

/// Work the orchestrator asks to have delegated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub node_execution_id: Uuid,
    pub mode: ExecutionMode,
    pub kind: String,
    pub scope: HashMap<String, String>,
    pub payload: Value,
    pub timeout: Duration,
}

impl TaskRequest {
    /// New request with a fresh task id
    pub fn new(
        node_execution_id: Uuid,
        kind: impl Into<String>,
        scope: HashMap<String, String>,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            node_execution_id,
            mode: ExecutionMode::Task,
            kind: kind.into(),
            scope,
            payload,
            timeout,
        }
    }
}

/// What a delegate receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTask {
    pub task_id: TaskId,
    pub kind: String,
    /// Serialized task payload
    pub payload: String,
    pub scope: HashMap<String, String>,
    pub timeout: Duration,
}

/// Result a delegate reports for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub data: ResponseData,
}

/// Remote executor pool
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Accept a task; the result comes back later through `report_task_result`
    async fn submit(&self, task: DelegateTask) -> Result<()>;

    /// Best-effort cancellation of in-flight work
    async fn cancel(&self, task_id: TaskId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Resolved,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    node_execution_id: Uuid,
    state: TaskState,
    submitted_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

/// Submits tasks and correlates their results
pub struct TaskDispatcher {
    tasks: DashMap<TaskId, TaskEntry>,
    delegate: Arc<dyn Delegate>,
    channel: Arc<dyn ResponseEventChannel>,
}

impl TaskDispatcher {
    pub fn new(delegate: Arc<dyn Delegate>, channel: Arc<dyn ResponseEventChannel>) -> Self {
        Self {
            tasks: DashMap::new(),
            delegate,
            channel,
        }
    }

    /// Submit a task; returns its correlation id
    ///
    /// A delegate that refuses the task resolves it immediately as a transport failure,
    /// so the owning node resumes instead of waiting out its deadline.
    pub async fn queue_task(&self, request: TaskRequest) -> Result<TaskId> {
        let task_id = request.task_id;
        if self.tasks.contains_key(&task_id) {
            return Err(EngineError::Fatal(format!("task id {} reused", task_id)));
        }

        let payload = serde_json::to_string(&request.payload)
            .map_err(|e| EngineError::Configuration(format!("task payload: {}", e)))?;

        self.tasks.insert(
            task_id,
            TaskEntry {
                node_execution_id: request.node_execution_id,
                state: TaskState::Pending,
                submitted_at: Utc::now(),
                closed_at: None,
            },
        );

        info!(
            task_id = %task_id,
            node_execution_id = %request.node_execution_id,
            kind = %request.kind,
            "Queueing task"
        );

        let task = DelegateTask {
            task_id,
            kind: request.kind,
            payload,
            scope: request.scope,
            timeout: request.timeout,
        };

        if let Err(e) = self.delegate.submit(task).await {
            warn!(task_id = %task_id, "Delegate refused task: {}", e);
            let failure = FailureInfo::new(FailureKind::Transport, format!("task not accepted: {}", e));
            self.report_task_result(task_id, ResponseData::failure(failure))
                .await?;
        }

        Ok(task_id)
    }

    /// Correlate a result with its task; idempotent
    pub async fn report_task_result(&self, task_id: TaskId, data: ResponseData) -> Result<()> {
        let node_execution_id = {
            let Some(mut entry) = self.tasks.get_mut(&task_id) else {
                warn!(task_id = %task_id, "Result for unknown task discarded");
                return Ok(());
            };
            if entry.state != TaskState::Pending {
                info!(
                    task_id = %task_id,
                    state = ?entry.state,
                    "Duplicate or late task result discarded"
                );
                return Ok(());
            }
            entry.state = TaskState::Resolved;
            entry.closed_at = Some(Utc::now());
            entry.node_execution_id
        };

        debug!(task_id = %task_id, node_execution_id = %node_execution_id, "Task resolved");

        self.channel
            .send(ResponseEvent::new(
                node_execution_id,
                ResponsePayload::ResumeNodeExecution {
                    callback_id: task_id.to_string(),
                    data,
                    attempt: None,
                },
            ))
            .await
    }

    /// Deadline passed: stop accepting results and ask the delegate to stop
    pub async fn expire(&self, task_id: TaskId) {
        self.close(task_id, TaskState::Expired).await;
    }

    /// Node aborted: stop accepting results and ask the delegate to stop
    pub async fn cancel(&self, task_id: TaskId) {
        self.close(task_id, TaskState::Cancelled).await;
    }

    async fn close(&self, task_id: TaskId, state: TaskState) {
        let was_pending = match self.tasks.get_mut(&task_id) {
            Some(mut entry) if entry.state == TaskState::Pending => {
                entry.state = state;
                entry.closed_at = Some(Utc::now());
                true
            }
            _ => false,
        };
        if !was_pending {
            return;
        }

        if let Err(e) = self.delegate.cancel(task_id).await {
            warn!(task_id = %task_id, ?state, "Remote cancel failed: {}", e);
        }
    }

    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|e| e.state)
    }

    /// Forget tasks closed before `cutoff`; later reports for them are discarded as unknown
    pub fn prune_closed(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        self.tasks
            .retain(|_, entry| entry.closed_at.map_or(true, |closed| closed >= cutoff));
        before.saturating_sub(self.tasks.len())
    }

    /// Tasks still waiting for a result, oldest first
    pub fn pending_tasks(&self) -> Vec<(TaskId, Uuid)> {
        let mut pending: Vec<(DateTime<Utc>, TaskId, Uuid)> = self
            .tasks
            .iter()
            .filter(|e| e.state == TaskState::Pending)
            .map(|e| (e.submitted_at, *e.key(), e.node_execution_id))
            .collect();
        pending.sort();
        pending.into_iter().map(|(_, task, node)| (task, node)).collect()
    }
}
