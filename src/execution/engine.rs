//! Engine - wires registry, transport, dispatcher, workers and the orchestrator

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::advise::DecisionInterceptor;
use crate::core::{
    config::{OrchestratorConfig, PlanConfig, TransportKind},
    error::{EngineError, Result},
    node_execution::NodeExecution,
    response::{CallbackId, ResponseData},
    state::NodeStatus,
};
use crate::dispatch::{Delegate, LocalDelegatePool, ShellTaskRunner, TaskDispatcher, TaskId};
use crate::events::{
    DirectResponseChannel, EventHandler, HandlerMode, OrchestrationEventBus,
    OrchestrationEventBusBuilder, OrchestrationEventType, QueuedResponseChannel, ResponseEvent,
    ResponseEventChannel, ResponseEventHandler, ResponsePayload,
};
use crate::execution::{
    orchestrator::{Orchestrator, PlanExecution},
    timeout::TimeoutSweeper,
    worker::WorkerPool,
};
use crate::persistence::{ExecutionSummary, InMemoryNodeExecutionStore, NodeExecutionStore, SummaryTracker};
use crate::step::{builtin::SHELL_TASK, StepRegistry};

/// Assembles an [`Engine`]
pub struct EngineBuilder {
    config: OrchestratorConfig,
    registry: Option<StepRegistry>,
    store: Option<Arc<dyn NodeExecutionStore>>,
    delegate: Option<Arc<dyn Delegate>>,
    bus: OrchestrationEventBusBuilder,
    interceptors: Vec<Arc<dyn DecisionInterceptor>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            registry: None,
            store: None,
            delegate: None,
            bus: OrchestrationEventBus::builder(),
            interceptors: Vec::new(),
        }
    }
}

impl EngineBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Step registry to resolve step types against; built-ins when unset
    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Node execution store; in-memory when unset
    pub fn with_store(mut self, store: Arc<dyn NodeExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Delegate for queued tasks; a local pool running shell tasks when unset
    pub fn with_delegate(mut self, delegate: Arc<dyn Delegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn on_event(
        mut self,
        event_type: OrchestrationEventType,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: EventHandler,
    ) -> Self {
        self.bus = self.bus.register_handler(event_type, name, mode, handler);
        self
    }

    pub fn on_all_events(
        mut self,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: EventHandler,
    ) -> Self {
        self.bus = self.bus.register_for_all(name, mode, handler);
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn DecisionInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the engine; must be called inside a tokio runtime
    pub fn build(self) -> Result<Engine> {
        let registry = Arc::new(match self.registry {
            Some(registry) => registry,
            None => StepRegistry::with_builtins()?,
        });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryNodeExecutionStore::new()));

        let summaries = Arc::new(SummaryTracker::new());
        let bus = self
            .bus
            .register_for_all("summary", HandlerMode::Sync, summaries.handler())
            .build();

        let (delegate, results) = match self.delegate {
            Some(delegate) => (delegate, None),
            None => {
                let (pool, results) = LocalDelegatePool::new();
                let pool = pool.with_runner(SHELL_TASK, Arc::new(ShellTaskRunner::new()));
                (Arc::new(pool) as Arc<dyn Delegate>, Some(results))
            }
        };

        let config = self.config;
        let interceptors = self.interceptors;
        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator>| {
            let handler: Weak<dyn ResponseEventHandler> = weak.clone();
            let channel: Arc<dyn ResponseEventChannel> = match config.transport {
                TransportKind::Queued => Arc::new(QueuedResponseChannel::start(handler, &config)),
                TransportKind::Direct => Arc::new(DirectResponseChannel::new(handler, &config)),
            };
            let dispatcher = Arc::new(TaskDispatcher::new(delegate, channel.clone()));
            let workers = WorkerPool::new(registry.clone(), channel.clone(), config.worker_concurrency);
            Orchestrator::new(
                config.clone(),
                store,
                channel,
                dispatcher,
                workers,
                bus,
                interceptors,
            )
        });

        let mut background = Vec::new();
        if let Some(mut results) = results {
            let dispatcher = orchestrator.dispatcher();
            background.push(tokio::spawn(async move {
                while let Some(result) = results.recv().await {
                    if let Err(e) = dispatcher
                        .report_task_result(result.task_id, result.data)
                        .await
                    {
                        warn!(task_id = %result.task_id, "Could not report task result: {}", e);
                    }
                }
            }));
        }
        background.push(
            TimeoutSweeper::new(Arc::downgrade(&orchestrator), config.timeout_sweep_interval).spawn(),
        );

        info!(
            transport = orchestrator.channel().name(),
            step_types = registry.step_types().len(),
            "Engine ready"
        );

        Ok(Engine {
            orchestrator,
            registry,
            summaries,
            background,
        })
    }
}

/// Running orchestration engine
pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<StepRegistry>,
    summaries: Arc<SummaryTracker>,
    background: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Validate a plan and start a run of it
    pub async fn start_plan(&self, config: &PlanConfig) -> Result<Uuid> {
        config.validate()?;

        let mut missing: Vec<String> = config
            .step_types()
            .into_iter()
            .filter(|t| !self.registry.contains(t))
            .map(|t| t.to_string())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(EngineError::Configuration(format!(
                "plan '{}' uses unregistered step types: {}",
                config.name,
                missing.join(", ")
            )));
        }

        self.orchestrator.start_plan(Arc::new(config.to_plan())).await
    }

    /// Start a plan and wait for it to finish
    pub async fn run_plan(&self, config: &PlanConfig, timeout: Duration) -> Result<PlanExecution> {
        let id = self.start_plan(config).await?;
        self.wait_for_plan(id, timeout).await
    }

    pub async fn wait_for_plan(&self, plan_execution_id: Uuid, timeout: Duration) -> Result<PlanExecution> {
        self.orchestrator.wait_for_plan(plan_execution_id, timeout).await
    }

    pub async fn abort_plan(&self, plan_execution_id: Uuid) -> Result<()> {
        self.orchestrator.abort_plan(plan_execution_id).await
    }

    pub fn plan_execution(&self, plan_execution_id: Uuid) -> Option<PlanExecution> {
        self.orchestrator.plan_execution(plan_execution_id)
    }

    pub async fn node_execution(&self, id: Uuid) -> Result<NodeExecution> {
        self.orchestrator.node_execution(id).await
    }

    pub async fn node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        self.orchestrator.node_executions(plan_execution_id).await
    }

    pub async fn effective_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        self.orchestrator.effective_executions(plan_execution_id).await
    }

    pub async fn children_of(&self, id: Uuid, recursive: bool) -> Result<Vec<NodeExecution>> {
        self.orchestrator.children_of(id, recursive).await
    }

    pub async fn count_children_by_status(&self, id: Uuid) -> Result<HashMap<NodeStatus, usize>> {
        self.orchestrator.count_children_by_status(id).await
    }

    /// Report the result of a delegated task; duplicates are discarded
    pub async fn report_task_result(&self, task_id: TaskId, data: ResponseData) -> Result<()> {
        self.orchestrator
            .dispatcher()
            .report_task_result(task_id, data)
            .await
    }

    /// Report one async callback id for a waiting node
    pub async fn notify_callback(
        &self,
        node_execution_id: Uuid,
        callback_id: impl Into<CallbackId>,
        data: ResponseData,
    ) -> Result<()> {
        self.orchestrator
            .channel()
            .send(ResponseEvent::new(
                node_execution_id,
                ResponsePayload::ResumeNodeExecution {
                    callback_id: callback_id.into(),
                    data,
                    attempt: None,
                },
            ))
            .await
    }

    /// Progress summary kept from lifecycle events
    pub fn summary(&self, plan_execution_id: Uuid) -> Option<ExecutionSummary> {
        self.summaries.get(plan_execution_id)
    }

    /// Every applied response event, in application order
    pub fn journal(&self) -> Vec<ResponseEvent> {
        self.orchestrator.journal()
    }

    /// Feed an event straight to the orchestrator, bypassing the transport
    pub async fn apply(&self, event: ResponseEvent) -> Result<()> {
        self.orchestrator.apply(event).await
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &'static str {
        self.orchestrator.channel().name()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}
