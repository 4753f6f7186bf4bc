//! Built-in step types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::{
    error::{FailureInfo, Result, StepError},
    response::{
        ExecutableResponse, ExecutionMode, ResponseData, ResponseMap, StepResponse, StepStatus,
        TaskSpec, WaitMode,
    },
};
use crate::step::{Step, StepContext, StepRegistryBuilder};

/// Task kind handled by the local shell runner
pub const SHELL_TASK: &str = "shell";

/// Register every built-in step type
pub fn register_all(builder: StepRegistryBuilder) -> Result<StepRegistryBuilder> {
    builder
        .register("echo", EchoStep)?
        .register("fail", FailStep)?
        .register("wait", WaitStep)?
        .register("shell", ShellStep)?
        .register("parallel", ParallelStep)?
        .register("chain", ChainStep)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoParams {
    #[serde(default)]
    pub message: String,

    /// Report SKIPPED instead of succeeding
    #[serde(default)]
    pub skip: bool,
}

/// Succeeds inline with its message
pub struct EchoStep;

#[async_trait]
impl Step for EchoStep {
    type Parameters = EchoParams;

    async fn execute(
        &self,
        params: &EchoParams,
        _ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        let response = if params.skip {
            StepResponse::skipped()
        } else {
            StepResponse::succeeded(json!({ "message": params.message }))
        };
        Ok(ExecutableResponse::Sync { response })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailParams {
    #[serde(default = "default_fail_message")]
    pub message: String,
}

fn default_fail_message() -> String {
    "step failed".to_string()
}

/// Always errors
pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    type Parameters = FailParams;

    async fn execute(
        &self,
        params: &FailParams,
        _ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        Err(StepError::Failed(params.message.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitParams {
    /// Delay before the first callback fires
    #[serde(default = "default_wait_millis")]
    pub millis: u64,

    /// Number of callback ids to wait on; callback `i` fires after `millis * (i + 1)`
    #[serde(default = "default_callbacks")]
    pub callbacks: usize,

    #[serde(default)]
    pub wait: WaitMode,

    /// Callbacks report failure
    #[serde(default)]
    pub fail: bool,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_wait_millis() -> u64 {
    10
}

fn default_callbacks() -> usize {
    1
}

/// Parks on timer callbacks
pub struct WaitStep;

#[async_trait]
impl Step for WaitStep {
    type Parameters = WaitParams;

    fn facilitate(&self, _params: &WaitParams, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        params: &WaitParams,
        ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        let callback_ids: Vec<String> = (0..params.callbacks)
            .map(|i| ctx.callbacks.callback_id(&format!("timer-{}", i)))
            .collect();

        for (i, callback_id) in callback_ids.iter().cloned().enumerate() {
            let delay = Duration::from_millis(params.millis * (i as u64 + 1));
            let callbacks = ctx.callbacks.clone();
            let data = if params.fail {
                ResponseData::failure(FailureInfo::step(format!("timer {} failed", callback_id)))
            } else {
                ResponseData::success(json!({ "waited_ms": delay.as_millis() as u64 }))
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = callbacks.notify(callback_id.clone(), data).await {
                    tracing::warn!(callback_id = %callback_id, "Timer callback not delivered: {}", e);
                }
            });
        }

        Ok(ExecutableResponse::Async {
            callback_ids,
            wait: params.wait,
            timeout_secs: params.timeout_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellParams {
    pub script: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Runs a script on the delegate pool
pub struct ShellStep;

#[async_trait]
impl Step for ShellStep {
    type Parameters = ShellParams;

    fn facilitate(&self, _params: &ShellParams, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Task
    }

    async fn execute(
        &self,
        params: &ShellParams,
        _ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        if params.script.trim().is_empty() {
            return Err(StepError::InvalidParameters("script is empty".to_string()));
        }
        Ok(ExecutableResponse::Task {
            task: TaskSpec {
                kind: SHELL_TASK.to_string(),
                payload: json!({ "script": params.script, "env": params.env }),
                timeout_secs: params.timeout_secs,
            },
        })
    }

    async fn handle_response(
        &self,
        _params: &ShellParams,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> std::result::Result<StepResponse, StepError> {
        let Some(result) = responses.values().next() else {
            return Err(StepError::Failed("task reported no result".to_string()));
        };
        Ok(match result.status {
            StepStatus::Succeeded => StepResponse::succeeded(result.payload.clone()),
            StepStatus::Skipped => StepResponse::skipped(),
            StepStatus::Failed => StepResponse {
                status: StepStatus::Failed,
                output: result.payload.clone(),
                failure: Some(
                    result
                        .failure
                        .clone()
                        .unwrap_or_else(|| FailureInfo::step("task failed")),
                ),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelParams {
    pub children: Vec<String>,

    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Spawns its children; parent outcome aggregates theirs
pub struct ParallelStep;

#[async_trait]
impl Step for ParallelStep {
    type Parameters = ParallelParams;

    fn facilitate(&self, _params: &ParallelParams, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        params: &ParallelParams,
        _ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        match params.children.as_slice() {
            [] => Err(StepError::InvalidParameters("no children".to_string())),
            [only] => Ok(ExecutableResponse::SpawnChild { child: only.clone() }),
            children => Ok(ExecutableResponse::SpawnChildren {
                children: children.to_vec(),
                max_concurrency: params.max_concurrency,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainParams {
    pub children: Vec<String>,
}

/// Runs its children one after another, stopping at the first failure
pub struct ChainStep;

#[async_trait]
impl Step for ChainStep {
    type Parameters = ChainParams;

    fn facilitate(&self, _params: &ChainParams, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        params: &ChainParams,
        _ctx: &StepContext,
    ) -> std::result::Result<ExecutableResponse, StepError> {
        if params.children.is_empty() {
            return Err(StepError::InvalidParameters("no children".to_string()));
        }
        Ok(ExecutableResponse::SpawnChildren {
            children: params.children.clone(),
            max_concurrency: Some(1),
        })
    }

    /// Links never started are absent from `responses`
    async fn handle_response(
        &self,
        params: &ChainParams,
        _ctx: &StepContext,
        responses: &ResponseMap,
    ) -> std::result::Result<StepResponse, StepError> {
        let mut response = StepResponse::aggregate(responses);
        if response.status == StepStatus::Succeeded && responses.len() < params.children.len() {
            response = StepResponse::failed(FailureInfo::step(format!(
                "chain stopped after {} of {} links",
                responses.len(),
                params.children.len()
            )));
        }
        if let Value::Object(map) = &mut response.output {
            map.insert("links".to_string(), json!(params.children.len()));
        }
        Ok(response)
    }
}
