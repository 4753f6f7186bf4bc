//! Step worker - runs step capabilities and reports what happened
//!
//! Workers hold no execution state. Every job carries what the step needs,
//! and every outcome goes back to the orchestrator as a response event.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{
    ambiance::Ambiance,
    error::{FailureInfo, StepError},
    response::{ExecutableResponse, ExecutionMode, ResponseMap, StepResponse},
};
use crate::events::{ResponseEvent, ResponseEventChannel, ResponsePayload};
use crate::step::{
    CallbackHandle, StepCapability, StepContext, StepRegistry, StepType, TypedParameters,
};

/// What a worker needs to call a step for one node execution
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub node_execution_id: Uuid,
    /// In-place retry count when the job was issued
    pub attempt: u32,
    pub step_type: StepType,
    pub parameters: Value,
    pub ambiance: Ambiance,
}

/// Unit of work for the pool
#[derive(Debug, Clone)]
pub enum WorkerJob {
    /// Choose the execution mode
    Facilitate(StepInvocation),
    /// Run the step in the chosen mode
    Execute {
        invocation: StepInvocation,
        mode: ExecutionMode,
    },
    /// Fold awaited results into the final step response
    Resume {
        invocation: StepInvocation,
        responses: ResponseMap,
    },
}

impl WorkerJob {
    pub fn invocation(&self) -> &StepInvocation {
        match self {
            WorkerJob::Facilitate(invocation)
            | WorkerJob::Execute { invocation, .. }
            | WorkerJob::Resume { invocation, .. } => invocation,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WorkerJob::Facilitate(_) => "facilitate",
            WorkerJob::Execute { .. } => "execute",
            WorkerJob::Resume { .. } => "resume",
        }
    }
}

/// Bounded pool of step workers
#[derive(Clone)]
pub struct WorkerPool {
    registry: Arc<StepRegistry>,
    channel: Arc<dyn ResponseEventChannel>,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        registry: Arc<StepRegistry>,
        channel: Arc<dyn ResponseEventChannel>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            channel,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run a job as soon as a worker is free
    pub fn submit(&self, job: WorkerJob) {
        self.submit_after(Duration::ZERO, job);
    }

    /// Run a job after `delay` (retry backoff)
    pub fn submit_after(&self, delay: Duration, job: WorkerJob) {
        let worker = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(
                    node_execution_id = %job.invocation().node_execution_id,
                    delay_ms = delay.as_millis() as u64,
                    "Delaying {} job",
                    job.name()
                );
                tokio::time::sleep(delay).await;
            }
            let Ok(_permit) = worker.permits.clone().acquire_owned().await else {
                warn!("Worker pool closed, job dropped");
                return;
            };
            worker.run(job).await;
        });
    }

    /// Run one job inline and report its outcome
    pub async fn run(&self, job: WorkerJob) {
        let invocation = job.invocation().clone();
        debug!(
            node_execution_id = %invocation.node_execution_id,
            step_type = %invocation.step_type,
            "Running {} job",
            job.name()
        );

        let payload = match job {
            WorkerJob::Facilitate(invocation) => self.facilitate(&invocation),
            WorkerJob::Execute { invocation, mode } => self.execute(&invocation, mode).await,
            WorkerJob::Resume {
                invocation,
                responses,
            } => self.resume(&invocation, &responses).await,
        };

        let event = ResponseEvent::new(invocation.node_execution_id, payload);
        let kind = event.kind();
        if let Err(e) = self.channel.send(event).await {
            error!(
                node_execution_id = %invocation.node_execution_id,
                event = %kind,
                "Failed to report step outcome: {}",
                e
            );
        }
    }

    fn context(&self, invocation: &StepInvocation) -> StepContext {
        StepContext {
            ambiance: invocation.ambiance.clone(),
            node_execution_id: invocation.node_execution_id,
            callbacks: CallbackHandle::new(
                invocation.node_execution_id,
                invocation.attempt,
                self.channel.clone(),
            ),
        }
    }

    /// Resolve the capability and bind the raw parameters to it
    fn bind(
        &self,
        invocation: &StepInvocation,
    ) -> Result<(Arc<dyn StepCapability>, TypedParameters), FailureInfo> {
        let capability = self
            .registry
            .resolve(&invocation.step_type)
            .map_err(|e| FailureInfo::from(&e))?;
        let params = capability
            .parse_parameters(&invocation.parameters)
            .map_err(|e| FailureInfo::from(&e))?;
        Ok((capability, params))
    }

    fn facilitate(&self, invocation: &StepInvocation) -> ResponsePayload {
        let (capability, params) = match self.bind(invocation) {
            Ok(bound) => bound,
            Err(failure) => return ResponsePayload::HandleEventError { failure },
        };

        match capability.facilitate(&params, &self.context(invocation)) {
            Ok(mode) => ResponsePayload::HandleFacilitateResponse { mode },
            Err(e) => ResponsePayload::HandleEventError {
                failure: FailureInfo::from(&e),
            },
        }
    }

    async fn execute(&self, invocation: &StepInvocation, mode: ExecutionMode) -> ResponsePayload {
        let (capability, params) = match self.bind(invocation) {
            Ok(bound) => bound,
            Err(failure) => return ResponsePayload::HandleEventError { failure },
        };

        let response = match capability.execute(&params, &self.context(invocation)).await {
            Ok(response) => response,
            Err(e) => {
                info!(
                    node_execution_id = %invocation.node_execution_id,
                    "Step {} failed: {}",
                    invocation.step_type,
                    e
                );
                return step_failure(&e);
            }
        };

        if !response.allowed_in(mode) {
            return ResponsePayload::HandleEventError {
                failure: FailureInfo::step(format!(
                    "step {} returned a {} response while facilitated as {:?}",
                    invocation.step_type,
                    response.kind(),
                    mode
                )),
            };
        }

        let nothing_to_wait_on = match &response {
            ExecutableResponse::Async { callback_ids, .. } => callback_ids.is_empty(),
            ExecutableResponse::SpawnChildren { children, .. } => children.is_empty(),
            _ => false,
        };
        if nothing_to_wait_on {
            return step_failure(&StepError::Failed(format!(
                "{} response has nothing to wait on",
                response.kind()
            )));
        }

        ResponsePayload::from_executable(response)
    }

    async fn resume(&self, invocation: &StepInvocation, responses: &ResponseMap) -> ResponsePayload {
        let (capability, params) = match self.bind(invocation) {
            Ok(bound) => bound,
            Err(failure) => return ResponsePayload::HandleEventError { failure },
        };

        match capability
            .handle_response(&params, &self.context(invocation), responses)
            .await
        {
            Ok(response) => ResponsePayload::HandleStepResponse { response },
            Err(e) => step_failure(&e),
        }
    }
}

/// A step error becomes adviser input
fn step_failure(error: &StepError) -> ResponsePayload {
    ResponsePayload::HandleStepResponse {
        response: StepResponse::failed(FailureInfo::from(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        error::{FailureKind, Result},
        response::{ResponseData, StepStatus},
    };
    use crate::step::{builtin::EchoStep, Step};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingChannel {
        events: Mutex<Vec<ResponseEvent>>,
    }

    #[async_trait]
    impl ResponseEventChannel for CapturingChannel {
        async fn send(&self, event: ResponseEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "capturing"
        }
    }

    /// Async response with nothing to wait on
    struct Confused;

    #[async_trait]
    impl Step for Confused {
        type Parameters = serde_json::Map<String, Value>;

        async fn execute(
            &self,
            _params: &Self::Parameters,
            _ctx: &StepContext,
        ) -> std::result::Result<ExecutableResponse, StepError> {
            Ok(ExecutableResponse::Async {
                callback_ids: vec![],
                wait: Default::default(),
                timeout_secs: None,
            })
        }
    }

    fn pool() -> (WorkerPool, Arc<CapturingChannel>) {
        let registry = StepRegistry::builder()
            .register("echo", EchoStep)
            .unwrap()
            .register("confused", Confused)
            .unwrap()
            .build();
        let channel = Arc::new(CapturingChannel::default());
        (
            WorkerPool::new(Arc::new(registry), channel.clone(), 2),
            channel,
        )
    }

    fn invocation(step_type: &str, parameters: Value) -> StepInvocation {
        StepInvocation {
            node_execution_id: Uuid::new_v4(),
            attempt: 0,
            step_type: StepType::new(step_type),
            parameters,
            ambiance: Ambiance::new("acc", "org", "proj", "plan", Uuid::new_v4()),
        }
    }

    fn last_payload(channel: &CapturingChannel) -> ResponsePayload {
        channel.events.lock().unwrap().last().unwrap().payload.clone()
    }

    #[tokio::test]
    async fn test_facilitate_reports_mode() {
        let (pool, channel) = pool();
        pool.run(WorkerJob::Facilitate(invocation("echo", json!({"message": "hi"}))))
            .await;
        assert_eq!(
            last_payload(&channel),
            ResponsePayload::HandleFacilitateResponse {
                mode: ExecutionMode::Sync
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_step_type_is_event_error() {
        let (pool, channel) = pool();
        pool.run(WorkerJob::Facilitate(invocation("missing", json!({}))))
            .await;
        match last_payload(&channel) {
            ResponsePayload::HandleEventError { failure } => {
                assert_eq!(failure.kind, FailureKind::Configuration)
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_sync_reports_step_response() {
        let (pool, channel) = pool();
        pool.run(WorkerJob::Execute {
            invocation: invocation("echo", json!({"message": "hi"})),
            mode: ExecutionMode::Sync,
        })
        .await;
        match last_payload(&channel) {
            ResponsePayload::HandleStepResponse { response } => {
                assert_eq!(response.status, StepStatus::Succeeded);
                assert_eq!(response.output, json!({"message": "hi"}));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_response_not_allowed_in_mode() {
        let (pool, channel) = pool();
        pool.run(WorkerJob::Execute {
            invocation: invocation("confused", json!({})),
            mode: ExecutionMode::Sync,
        })
        .await;
        assert!(matches!(
            last_payload(&channel),
            ResponsePayload::HandleEventError { .. }
        ));
    }

    #[tokio::test]
    async fn test_async_without_callback_ids_is_step_failure() {
        let (pool, channel) = pool();
        pool.run(WorkerJob::Execute {
            invocation: invocation("confused", json!({})),
            mode: ExecutionMode::Async,
        })
        .await;
        match last_payload(&channel) {
            ResponsePayload::HandleStepResponse { response } => {
                assert_eq!(response.status, StepStatus::Failed)
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_aggregates() {
        let (pool, channel) = pool();
        let mut responses = ResponseMap::new();
        responses.insert("a".to_string(), ResponseData::success(json!(1)));
        pool.run(WorkerJob::Resume {
            invocation: invocation("echo", json!({})),
            responses,
        })
        .await;
        match last_payload(&channel) {
            ResponsePayload::HandleStepResponse { response } => {
                assert_eq!(response.output, json!({"a": 1}))
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
