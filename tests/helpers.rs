//! Test utility functions for the orchestrator
#![allow(dead_code)]

use async_trait::async_trait;
use orchestrator::core::config::{OrchestratorConfig, PlanConfig, TransportKind};
use orchestrator::core::error::{FailureInfo, StepError};
use orchestrator::core::response::{ExecutableResponse, ExecutionMode, ResponseData, StepResponse};
use orchestrator::dispatch::{Delegate, DelegateTask, TaskId};
use orchestrator::events::{event_handler, HandlerMode, OrchestrationEvent};
use orchestrator::step::{builtin, Step, StepContext, StepRegistry};
use orchestrator::{Engine, EngineBuilder, NodeExecution, NodeStatus, PlanExecution, PlanStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Callback id a [`GateStep`] waits on
pub const GATE: &str = "gate";

pub const WAIT: Duration = Duration::from_secs(10);

/// Async step that parks until the test opens it with `engine.notify_callback`
pub struct GateStep;

#[async_trait]
impl Step for GateStep {
    type Parameters = Value;

    fn facilitate(&self, _params: &Value, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        _params: &Value,
        _ctx: &StepContext,
    ) -> Result<ExecutableResponse, StepError> {
        Ok(ExecutableResponse::Async {
            callback_ids: vec![GATE.to_string()],
            wait: Default::default(),
            timeout_secs: None,
        })
    }
}

/// Sync step failing its first `failures` runs
pub struct FlakyStep {
    pub failures: usize,
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for FlakyStep {
    type Parameters = Value;

    async fn execute(
        &self,
        _params: &Value,
        _ctx: &StepContext,
    ) -> Result<ExecutableResponse, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(StepError::Failed(format!("flaky failure {}", call + 1)));
        }
        Ok(ExecutableResponse::Sync {
            response: StepResponse::succeeded(json!({ "call": call + 1 })),
        })
    }
}

/// Async step whose callback reports failure for the first `failures` runs
pub struct FlakyAsyncStep {
    pub failures: usize,
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for FlakyAsyncStep {
    type Parameters = Value;

    fn facilitate(&self, _params: &Value, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        _params: &Value,
        ctx: &StepContext,
    ) -> Result<ExecutableResponse, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let data = if call < self.failures {
            ResponseData::failure(FailureInfo::step(format!("remote failure {}", call + 1)))
        } else {
            ResponseData::success(json!({ "call": call + 1 }))
        };
        let callbacks = ctx.callbacks.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = callbacks.notify("attempt", data).await;
        });
        Ok(ExecutableResponse::Async {
            callback_ids: vec!["attempt".to_string()],
            wait: Default::default(),
            timeout_secs: None,
        })
    }
}

/// Async race on `fast` and `slow`; the first run fails both, `slow` arriving late
pub struct RacingFlakyStep {
    pub calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for RacingFlakyStep {
    type Parameters = Value;

    fn facilitate(&self, _params: &Value, _ctx: &StepContext) -> ExecutionMode {
        ExecutionMode::Async
    }

    async fn execute(
        &self,
        _params: &Value,
        ctx: &StepContext,
    ) -> Result<ExecutableResponse, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let callbacks = ctx.callbacks.clone();
        tokio::spawn(async move {
            if call == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = callbacks
                    .notify("fast", ResponseData::failure(FailureInfo::step("fast lane down")))
                    .await;
                tokio::time::sleep(Duration::from_millis(40)).await;
                let _ = callbacks
                    .notify("slow", ResponseData::failure(FailureInfo::step("slow lane down")))
                    .await;
            } else {
                tokio::time::sleep(Duration::from_millis(120)).await;
                let _ = callbacks
                    .notify("fast", ResponseData::success(json!({ "call": call + 1 })))
                    .await;
            }
        });
        Ok(ExecutableResponse::Async {
            callback_ids: vec!["fast".to_string(), "slow".to_string()],
            wait: orchestrator::core::response::WaitMode::Any,
            timeout_secs: None,
        })
    }
}

/// Call counters for the flaky test steps
#[derive(Clone, Default)]
pub struct Counters {
    pub flaky: Arc<AtomicUsize>,
    pub flaky_async: Arc<AtomicUsize>,
    pub racing: Arc<AtomicUsize>,
}

impl Counters {
    pub fn flaky_calls(&self) -> usize {
        self.flaky.load(Ordering::SeqCst)
    }

    pub fn flaky_async_calls(&self) -> usize {
        self.flaky_async.load(Ordering::SeqCst)
    }

    pub fn racing_calls(&self) -> usize {
        self.racing.load(Ordering::SeqCst)
    }
}

/// Built-ins plus the test steps; flaky steps fail twice then succeed
pub fn test_registry(counters: &Counters) -> StepRegistry {
    builtin::register_all(StepRegistry::builder())
        .and_then(|b| b.register("gate", GateStep))
        .and_then(|b| {
            b.register(
                "flaky",
                FlakyStep {
                    failures: 2,
                    calls: counters.flaky.clone(),
                },
            )
        })
        .and_then(|b| {
            b.register(
                "flaky_async",
                FlakyAsyncStep {
                    failures: 2,
                    calls: counters.flaky_async.clone(),
                },
            )
        })
        .and_then(|b| {
            b.register(
                "racing_flaky",
                RacingFlakyStep {
                    calls: counters.racing.clone(),
                },
            )
        })
        .expect("test registry")
        .build()
}

/// Every lifecycle event the bus published, in order
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<OrchestrationEvent>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().unwrap().clone()
    }

    /// How many NodeEnded events were published for a plan node
    pub fn ended_count(&self, plan_node_id: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| {
                matches!(e, OrchestrationEvent::NodeEnded { plan_node_id: id, .. } if id == plan_node_id)
            })
            .count()
    }

    pub fn plan_ended_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, OrchestrationEvent::PlanEnded { .. }))
            .count()
    }
}

pub fn test_config(transport: TransportKind) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_transport(transport)
        .with_timeout_sweep_interval(Duration::from_millis(50))
}

pub fn builder(transport: TransportKind, counters: &Counters, log: &EventLog) -> EngineBuilder {
    let events = log.events.clone();
    Engine::builder()
        .with_config(test_config(transport))
        .with_registry(test_registry(counters))
        .on_all_events(
            "recorder",
            HandlerMode::Sync,
            event_handler(move |event| {
                events.lock().unwrap().push(event.clone());
                Ok(())
            }),
        )
}

/// Engine over the given transport with the test registry and an event log
pub fn test_engine(transport: TransportKind) -> (Engine, EventLog, Counters) {
    let counters = Counters::default();
    let log = EventLog::default();
    let engine = builder(transport, &counters, &log).build().expect("engine");
    (engine, log, counters)
}

pub fn plan_from_yaml(yaml: &str) -> PlanConfig {
    PlanConfig::from_yaml(yaml).expect("plan yaml")
}

pub async fn run_yaml(engine: &Engine, yaml: &str) -> PlanExecution {
    engine
        .run_plan(&plan_from_yaml(yaml), WAIT)
        .await
        .expect("plan run")
}

/// Poll until a node for `plan_node_id` exists and satisfies `ready`
pub async fn wait_for_node<F>(
    engine: &Engine,
    plan_execution_id: Uuid,
    plan_node_id: &str,
    ready: F,
) -> NodeExecution
where
    F: Fn(&NodeExecution) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let nodes = engine
            .effective_executions(plan_execution_id)
            .await
            .expect("node executions");
        if let Some(node) = nodes
            .into_iter()
            .find(|n| n.plan_node_id == plan_node_id && ready(n))
        {
            return node;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node {} never became ready",
            plan_node_id
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a gate node to park, then open it
pub async fn open_gate(engine: &Engine, plan_execution_id: Uuid, plan_node_id: &str, data: ResponseData) {
    let node = wait_for_node(engine, plan_execution_id, plan_node_id, |n| {
        n.status == NodeStatus::AsyncWaiting
    })
    .await;
    engine
        .notify_callback(node.id, GATE, data)
        .await
        .expect("notify gate");
}

pub async fn status_of(engine: &Engine, plan_execution_id: Uuid, plan_node_id: &str) -> NodeStatus {
    engine
        .effective_executions(plan_execution_id)
        .await
        .expect("node executions")
        .into_iter()
        .find(|n| n.plan_node_id == plan_node_id)
        .map(|n| n.status)
        .unwrap_or_else(|| panic!("node {} never instantiated", plan_node_id))
}

pub async fn executions_of(engine: &Engine, plan_execution_id: Uuid, plan_node_id: &str) -> Vec<NodeExecution> {
    let mut nodes: Vec<NodeExecution> = engine
        .node_executions(plan_execution_id)
        .await
        .expect("node executions")
        .into_iter()
        .filter(|n| n.plan_node_id == plan_node_id)
        .collect();
    nodes.sort_by_key(|n| n.retry_index);
    nodes
}

/// Delegate that keeps every task and never answers
#[derive(Default)]
pub struct RecordingDelegate {
    pub submitted: Mutex<Vec<DelegateTask>>,
    pub cancelled: Mutex<Vec<TaskId>>,
}

impl RecordingDelegate {
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.submitted.lock().unwrap().iter().map(|t| t.task_id).collect()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Poll until at least one task arrived
    pub async fn first_task(&self) -> DelegateTask {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(task) = self.submitted.lock().unwrap().first().cloned() {
                return task;
            }
            assert!(tokio::time::Instant::now() < deadline, "no task submitted");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Delegate for RecordingDelegate {
    async fn submit(&self, task: DelegateTask) -> orchestrator::Result<()> {
        self.submitted.lock().unwrap().push(task);
        Ok(())
    }

    async fn cancel(&self, task_id: TaskId) -> orchestrator::Result<()> {
        self.cancelled.lock().unwrap().push(task_id);
        Ok(())
    }
}

pub fn assert_plan_succeeded(execution: &PlanExecution) {
    assert_eq!(
        execution.status,
        PlanStatus::Succeeded,
        "plan failed: failed={:?} not_run={:?}",
        execution.failed_nodes,
        execution.not_run
    );
}

pub fn assert_plan_failed(execution: &PlanExecution, node: &str) {
    assert_eq!(execution.status, PlanStatus::Failed);
    assert!(
        execution.failed_nodes.iter().any(|n| n == node),
        "expected {} among failed nodes {:?}",
        node,
        execution.failed_nodes
    );
}

pub const TRANSPORTS: [TransportKind; 2] = [TransportKind::Queued, TransportKind::Direct];
