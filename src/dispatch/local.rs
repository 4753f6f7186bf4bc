//! In-process delegate pool

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::{
    error::{EngineError, FailureInfo, FailureKind, Result},
    response::ResponseData,
};
use crate::dispatch::{Delegate, DelegateTask, TaskId, TaskResult};

/// Runs one kind of task
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &DelegateTask) -> ResponseData;
}

/// Delegate that runs tasks on the local runtime and reports over a channel
pub struct LocalDelegatePool {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
    results: mpsc::UnboundedSender<TaskResult>,
    running: Arc<DashMap<TaskId, AbortHandle>>,
}

impl LocalDelegatePool {
    /// Pool plus the receiving end of its result stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskResult>) {
        let (results, rx) = mpsc::unbounded_channel();
        (
            Self {
                runners: HashMap::new(),
                results,
                running: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    pub fn with_runner(mut self, kind: impl Into<String>, runner: Arc<dyn TaskRunner>) -> Self {
        self.runners.insert(kind.into(), runner);
        self
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl Delegate for LocalDelegatePool {
    async fn submit(&self, task: DelegateTask) -> Result<()> {
        let runner = self.runners.get(&task.kind).cloned().ok_or_else(|| {
            EngineError::Configuration(format!("no runner for task kind '{}'", task.kind))
        })?;

        let task_id = task.task_id;
        let results = self.results.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            debug!(task_id = %task.task_id, kind = %task.kind, "Running task");
            let data = match timeout(task.timeout, runner.run(&task)).await {
                Ok(data) => data,
                Err(_) => ResponseData::failure(FailureInfo::new(
                    FailureKind::Timeout,
                    format!("task exceeded {:?}", task.timeout),
                )),
            };
            running.remove(&task.task_id);
            if results
                .send(TaskResult {
                    task_id: task.task_id,
                    data,
                })
                .is_err()
            {
                warn!(task_id = %task.task_id, "Result stream closed, task result lost");
            }
        });

        self.running.insert(task_id, handle.abort_handle());
        // the task may already have finished and removed itself
        if handle.is_finished() {
            self.running.remove(&task_id);
        }
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId) -> Result<()> {
        match self.running.remove(&task_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(task_id = %task_id, "Task cancelled");
                Ok(())
            }
            None => Err(EngineError::NotFound(task_id)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ShellPayload {
    script: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Runs a script with `sh -c`, scope metadata exported as environment variables
#[derive(Debug, Clone)]
pub struct ShellTaskRunner {
    shell: String,
}

impl ShellTaskRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn env_name(key: &str) -> String {
        let mut name = String::from("ORCH_");
        for c in key.chars() {
            if c.is_ascii_uppercase() {
                name.push('_');
            }
            name.push(c.to_ascii_uppercase());
        }
        name
    }
}

impl Default for ShellTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRunner for ShellTaskRunner {
    async fn run(&self, task: &DelegateTask) -> ResponseData {
        let payload: ShellPayload = match serde_json::from_str(&task.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return ResponseData::failure(FailureInfo::step(format!(
                    "invalid shell payload: {}",
                    e
                )))
            }
        };

        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&payload.script).kill_on_drop(true);
        for (key, value) in &task.scope {
            command.env(Self::env_name(key), value);
        }
        command.envs(&payload.env);

        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                return ResponseData::failure(FailureInfo::step(format!(
                    "failed to spawn {}: {}",
                    self.shell, e
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            ResponseData::success(json!({ "exit_code": exit_code, "stdout": stdout }))
        } else {
            warn!(task_id = %task.task_id, exit_code, "Script failed: {}", stderr);
            ResponseData {
                payload: json!({ "exit_code": exit_code, "stdout": stdout, "stderr": stderr }),
                ..ResponseData::failure(FailureInfo::step(format!(
                    "script exited with code {}: {}",
                    exit_code, stderr
                )))
            }
        }
    }
}
