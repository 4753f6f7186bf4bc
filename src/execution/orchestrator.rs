//! Orchestrator - the only writer of node execution state
//!
//! Response events are applied one node at a time: the node is loaded under its
//! lock, a handler mutates it and lists follow-up effects, and the node is saved
//! with an optimistic version check. Effects (worker jobs, events to other nodes,
//! bus notifications) run once the lock is released.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::advise::{AdviserChain, AdviserDecision, AdvisingInput, DecisionInterceptor};
use crate::core::{
    ambiance::Ambiance,
    config::OrchestratorConfig,
    error::{EngineError, FailureInfo, FailureKind, Result},
    node_execution::{CallbackObservation, NodeExecution, RetryAttempt, WaitKind},
    plan::Plan,
    response::{
        CallbackId, ExecutableResponse, ExecutionMode, ResponseData, StepResponse, StepStatus,
        TaskSpec, WaitMode,
    },
    state::{NodeStatus, PlanStatus},
};
use crate::dispatch::{TaskDispatcher, TaskId, TaskRequest};
use crate::events::{
    OrchestrationEvent, OrchestrationEventBus, ResponseEvent, ResponseEventChannel,
    ResponseEventHandler, ResponsePayload,
};
use crate::execution::{
    locks::KeyedLock,
    worker::{StepInvocation, WorkerJob, WorkerPool},
};
use crate::persistence::NodeExecutionStore;

/// Record of one plan run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: Uuid,
    pub plan_name: String,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Top-level plan nodes whose latest execution failed
    pub failed_nodes: Vec<String>,

    /// Top-level plan nodes never instantiated
    pub not_run: Vec<String>,
}

struct PlanRun {
    plan: Arc<Plan>,
    record: PlanExecution,
    /// Node whose adviser decided to end the plan
    ended_by: Option<Uuid>,
    aborting: bool,
    /// Route decisions committed but not yet instantiated
    pending_routes: usize,
    status: watch::Sender<PlanStatus>,
}

impl PlanRun {
    fn is_halted(&self) -> bool {
        self.aborting || self.ended_by.is_some() || self.record.status.is_terminal()
    }
}

/// Follow-up work of an applied change
#[derive(Debug)]
enum Effect {
    Publish(OrchestrationEvent),
    Dispatch {
        job: WorkerJob,
        delay: Duration,
    },
    Send(ResponseEvent),
    Create(NodeExecution),
    Start {
        id: Uuid,
        delay: Duration,
    },
    QueueTask(TaskRequest),
    CancelTask(TaskId),
    ExpireTask(TaskId),
    Abort {
        id: Uuid,
        reason: String,
    },
    /// Instantiate `target` beside the node that routed to it
    Route {
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
        scope: Ambiance,
        target: String,
    },
    EndPlan {
        plan_execution_id: Uuid,
        ended_by: Uuid,
    },
    Ended(NodeExecution),
    Advance(Uuid),
}

/// Applies response events and drives plan runs
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn NodeExecutionStore>,
    channel: Arc<dyn ResponseEventChannel>,
    dispatcher: Arc<TaskDispatcher>,
    workers: WorkerPool,
    bus: OrchestrationEventBus,
    interceptors: Vec<Arc<dyn DecisionInterceptor>>,
    locks: KeyedLock,
    plans: DashMap<Uuid, PlanRun>,
    journal: Mutex<VecDeque<ResponseEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn NodeExecutionStore>,
        channel: Arc<dyn ResponseEventChannel>,
        dispatcher: Arc<TaskDispatcher>,
        workers: WorkerPool,
        bus: OrchestrationEventBus,
        interceptors: Vec<Arc<dyn DecisionInterceptor>>,
    ) -> Self {
        Self {
            config,
            store,
            channel,
            dispatcher,
            workers,
            bus,
            interceptors,
            locks: KeyedLock::new(),
            plans: DashMap::new(),
            journal: Mutex::new(VecDeque::new()),
        }
    }

    pub fn channel(&self) -> Arc<dyn ResponseEventChannel> {
        self.channel.clone()
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        self.dispatcher.clone()
    }

    /// Register a plan run and instantiate its root nodes
    pub async fn start_plan(&self, plan: Arc<Plan>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let (status, _) = watch::channel(PlanStatus::Running);

        info!("Starting plan execution: {} ({})", plan.id, id);

        self.plans.insert(
            id,
            PlanRun {
                record: PlanExecution {
                    id,
                    plan_name: plan.id.clone(),
                    status: PlanStatus::Running,
                    started_at,
                    ended_at: None,
                    failed_nodes: Vec::new(),
                    not_run: Vec::new(),
                },
                plan: plan.clone(),
                ended_by: None,
                aborting: false,
                pending_routes: 0,
                status,
            },
        );

        self.bus.publish(&OrchestrationEvent::PlanStarted {
            plan_execution_id: id,
            plan_id: plan.id.clone(),
            at: started_at,
        });

        self.run_effects(vec![Effect::Advance(id)]).await;
        Ok(id)
    }

    /// Abort every non-terminal node of a run, skipping adviser evaluation
    pub async fn abort_plan(&self, plan_execution_id: Uuid) -> Result<()> {
        {
            let mut run = self
                .plans
                .get_mut(&plan_execution_id)
                .ok_or(EngineError::NotFound(plan_execution_id))?;
            if run.record.status.is_terminal() {
                info!("Plan execution {} already finished", plan_execution_id);
                return Ok(());
            }
            run.aborting = true;
        }

        info!("Aborting plan execution {}", plan_execution_id);

        let nodes = self.store.list_by_plan(plan_execution_id).await?;
        let mut effects = Vec::new();
        for node in nodes.iter().filter(|n| !n.status.is_terminal()) {
            match self.abort_node(node.id, "plan aborted").await {
                Ok(more) => effects.extend(more),
                Err(e) => warn!(node_execution_id = %node.id, "Abort failed: {}", e),
            }
        }
        effects.push(Effect::Advance(plan_execution_id));
        self.run_effects(effects).await;
        Ok(())
    }

    /// Fail a waiting node whose deadline passed
    pub async fn expire(&self, node_execution_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let effects = self
            .update(node_execution_id, None, |node, _| {
                let overdue = node.status.is_waiting() && node.deadline.is_some_and(|d| d <= now);
                if !overdue {
                    return Ok(Vec::new());
                }

                let waited = waited_for(node, now);
                warn!(
                    node_execution_id = %node.id,
                    plan_node_id = %node.plan_node_id,
                    "Wait deadline passed after {:?}",
                    waited
                );
                fail_timed_out(node, FailureInfo::from(&EngineError::Timeout(waited)))
            })
            .await?;

        if let Some(effects) = effects {
            self.run_effects(effects).await;
        }
        Ok(())
    }

    /// Expire every waiting node whose deadline passed; returns how many were due
    pub async fn expire_overdue(&self) -> Result<usize> {
        let now = Utc::now();
        let overdue: Vec<Uuid> = self
            .store
            .list_waiting()
            .await?
            .into_iter()
            .filter(|n| n.deadline.is_some_and(|d| d <= now))
            .map(|n| n.id)
            .collect();

        for id in &overdue {
            if let Err(e) = self.expire(*id).await {
                warn!(node_execution_id = %id, "Could not expire node execution: {}", e);
            }
        }
        Ok(overdue.len())
    }

    pub fn plan_execution(&self, plan_execution_id: Uuid) -> Option<PlanExecution> {
        self.plans
            .get(&plan_execution_id)
            .map(|run| run.record.clone())
    }

    /// Wait until a run reaches a terminal status
    pub async fn wait_for_plan(
        &self,
        plan_execution_id: Uuid,
        timeout: Duration,
    ) -> Result<PlanExecution> {
        let mut status = self
            .plans
            .get(&plan_execution_id)
            .map(|run| run.status.subscribe())
            .ok_or(EngineError::NotFound(plan_execution_id))?;

        tokio::time::timeout(timeout, status.wait_for(|s| s.is_terminal()))
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
            .map_err(|_| EngineError::Fatal("plan status channel closed".to_string()))?;

        self.plan_execution(plan_execution_id)
            .ok_or(EngineError::NotFound(plan_execution_id))
    }

    /// Most recent applied response events, in application order
    pub fn journal(&self) -> Vec<ResponseEvent> {
        self.journal
            .lock()
            .map(|journal| journal.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop plan runs and closed tasks that finished longer ago than the retention window
    pub fn prune_finished(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let before = self.plans.len();
        self.plans.retain(|_, run| {
            !(run.record.status.is_terminal() && run.record.ended_at.is_some_and(|ended| ended < cutoff))
        });
        let plans = before.saturating_sub(self.plans.len());
        let tasks = self.dispatcher.prune_closed(cutoff);
        if plans + tasks > 0 {
            debug!(plans, tasks, "Pruned finished runs");
        }
        plans + tasks
    }

    pub async fn node_execution(&self, id: Uuid) -> Result<NodeExecution> {
        self.store.load(id).await
    }

    /// Every execution of a run, superseded retries included
    pub async fn node_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        self.store.list_by_plan(plan_execution_id).await
    }

    /// Latest execution of every instantiated plan node
    pub async fn effective_executions(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let nodes = self.store.list_by_plan(plan_execution_id).await?;
        Ok(effective_executions(&nodes).into_iter().cloned().collect())
    }

    /// Children of a node, optionally their descendants too
    pub async fn children_of(&self, id: Uuid, recursive: bool) -> Result<Vec<NodeExecution>> {
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(parent) = queue.pop_front() {
            let children = self.store.list_children(parent).await?;
            if recursive {
                queue.extend(children.iter().map(|c| c.id));
            }
            result.extend(children);
        }
        Ok(result)
    }

    /// Latest execution of each direct child, counted by status
    pub async fn count_children_by_status(&self, id: Uuid) -> Result<HashMap<NodeStatus, usize>> {
        let children = self.store.list_children(id).await?;
        let mut counts = HashMap::new();
        for child in effective_executions(&children) {
            *counts.entry(child.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn plan_for(&self, plan_execution_id: Uuid) -> Result<Arc<Plan>> {
        self.plans
            .get(&plan_execution_id)
            .map(|run| run.plan.clone())
            .ok_or_else(|| {
                EngineError::Fatal(format!(
                    "plan execution {} is not known to this orchestrator",
                    plan_execution_id
                ))
            })
    }

    fn is_halted(&self, plan_execution_id: Uuid) -> bool {
        self.plans
            .get(&plan_execution_id)
            .map_or(true, |run| run.is_halted())
    }

    fn track_routes(&self, plan_execution_id: Uuid, added: usize, removed: usize) {
        if let Some(mut run) = self.plans.get_mut(&plan_execution_id) {
            run.pending_routes = (run.pending_routes + added).saturating_sub(removed);
        }
    }

    fn record(&self, event: ResponseEvent) {
        match self.journal.lock() {
            Ok(mut journal) => {
                journal.push_back(event);
                while journal.len() > self.config.journal_capacity {
                    journal.pop_front();
                }
            }
            Err(_) => warn!("Event journal lock poisoned, event not recorded"),
        }
    }

    /// Run `work` while holding the lock on `key`
    async fn locked<T, F>(&self, key: Uuid, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = self.locks.acquire(key, self.config.lock_wait).await?;
        let result = work.await;
        drop(guard);
        self.locks.release(&key);
        result
    }

    /// Load, mutate and save one node under its lock
    ///
    /// Returns `None` when the change was skipped: the sequence was already applied
    /// or the node has ended.
    async fn update<F>(
        &self,
        id: Uuid,
        sequence: Option<u64>,
        mut mutate: F,
    ) -> Result<Option<Vec<Effect>>>
    where
        F: FnMut(&mut NodeExecution, &Plan) -> Result<Vec<Effect>> + Send,
    {
        self.locked(id, self.update_locked(id, sequence, &mut mutate))
            .await
    }

    async fn update_locked<F>(
        &self,
        id: Uuid,
        sequence: Option<u64>,
        mutate: &mut F,
    ) -> Result<Option<Vec<Effect>>>
    where
        F: FnMut(&mut NodeExecution, &Plan) -> Result<Vec<Effect>> + Send,
    {
        let mut conflicts = 0;
        loop {
            let mut node = self.store.load(id).await?;

            if let Some(sequence) = sequence {
                if node.has_applied(sequence) {
                    info!(node_execution_id = %id, sequence, "Duplicate response event ignored");
                    return Ok(None);
                }
            }
            if node.status.is_terminal() {
                debug!(
                    node_execution_id = %id,
                    status = %node.status,
                    "Node execution already ended, nothing to apply"
                );
                return Ok(None);
            }

            let plan = self.plan_for(node.plan_execution_id)?;
            let before = node.clone();
            let mut effects = mutate(&mut node, &plan)?;
            if let Some(sequence) = sequence {
                node.mark_applied(sequence);
            }
            if node == before {
                return Ok(Some(effects));
            }

            // counted before the save so a concurrent advance cannot settle the plan early
            let routes = effects
                .iter()
                .filter(|e| matches!(e, Effect::Route { .. }))
                .count();
            self.track_routes(node.plan_execution_id, routes, 0);

            match self.store.save(&node).await {
                Ok(version) => node.version = version,
                Err(EngineError::StateConflict { .. })
                    if conflicts < self.config.max_state_conflict_retries =>
                {
                    self.track_routes(node.plan_execution_id, 0, routes);
                    conflicts += 1;
                    warn!(node_execution_id = %id, attempt = conflicts, "State conflict, reapplying");
                    continue;
                }
                Err(EngineError::StateConflict { expected, .. }) => {
                    self.track_routes(node.plan_execution_id, 0, routes);
                    return Err(EngineError::Fatal(format!(
                        "node execution {} still conflicting at version {} after {} retries",
                        id, expected, conflicts
                    )));
                }
                Err(e) => {
                    self.track_routes(node.plan_execution_id, 0, routes);
                    return Err(e);
                }
            }

            if node.status != before.status {
                info!(
                    node_execution_id = %id,
                    plan_node_id = %node.plan_node_id,
                    "{} -> {}",
                    before.status,
                    node.status
                );
                effects.insert(
                    0,
                    Effect::Publish(OrchestrationEvent::NodeStatusUpdate {
                        plan_execution_id: node.plan_execution_id,
                        node_execution_id: node.id,
                        plan_node_id: node.plan_node_id.clone(),
                        from: before.status,
                        to: node.status,
                        at: Utc::now(),
                    }),
                );
                if node.status.is_terminal() {
                    effects.push(Effect::Ended(node));
                }
            }
            return Ok(Some(effects));
        }
    }

    async fn run_effects(&self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            match self.run_effect(effect).await {
                Ok(more) => queue.extend(more),
                Err(e) => error!("Follow-up effect failed: {}", e),
            }
        }
    }

    async fn run_effect(&self, effect: Effect) -> Result<Vec<Effect>> {
        match effect {
            Effect::Publish(event) => {
                self.bus.publish(&event);
                Ok(Vec::new())
            }
            Effect::Dispatch { job, delay } => {
                self.workers.submit_after(delay, job);
                Ok(Vec::new())
            }
            Effect::Send(event) => {
                self.channel.send(event).await?;
                Ok(Vec::new())
            }
            Effect::Create(node) => {
                self.store.insert(&node).await?;
                Ok(Vec::new())
            }
            Effect::Start { id, delay } => self.start_node(id, delay).await,
            Effect::QueueTask(request) => {
                self.dispatcher.queue_task(request).await?;
                Ok(Vec::new())
            }
            Effect::CancelTask(task_id) => {
                self.dispatcher.cancel(task_id).await;
                Ok(Vec::new())
            }
            Effect::ExpireTask(task_id) => {
                self.dispatcher.expire(task_id).await;
                Ok(Vec::new())
            }
            Effect::Abort { id, reason } => self.abort_node(id, &reason).await,
            Effect::Route {
                plan_execution_id,
                parent_id,
                scope,
                target,
            } => Ok(self.route(plan_execution_id, parent_id, scope, target).await),
            Effect::EndPlan {
                plan_execution_id,
                ended_by,
            } => self.end_plan(plan_execution_id, ended_by).await,
            Effect::Ended(node) => Ok(self.node_ended(node)),
            Effect::Advance(plan_execution_id) => self.advance_plan(plan_execution_id).await,
        }
    }

    async fn start_node(&self, id: Uuid, delay: Duration) -> Result<Vec<Effect>> {
        let effects = self
            .update(id, None, |node, _| {
                if node.status != NodeStatus::Queued {
                    return Ok(Vec::new());
                }
                if self.is_halted(node.plan_execution_id) {
                    node.failure = Some(FailureInfo::new(
                        FailureKind::Aborted,
                        "plan is no longer running",
                    ));
                    node.transition(NodeStatus::Aborted)?;
                    return Ok(Vec::new());
                }

                node.transition(NodeStatus::Facilitating)?;
                Ok(vec![
                    Effect::Publish(OrchestrationEvent::NodeStarted {
                        plan_execution_id: node.plan_execution_id,
                        node_execution_id: node.id,
                        plan_node_id: node.plan_node_id.clone(),
                        step_type: node.step_type.clone(),
                        parent_id: node.parent_id,
                        at: Utc::now(),
                    }),
                    Effect::Dispatch {
                        job: WorkerJob::Facilitate(invocation(node)),
                        delay,
                    },
                ])
            })
            .await?;
        Ok(effects.unwrap_or_default())
    }

    async fn abort_node(&self, id: Uuid, reason: &str) -> Result<Vec<Effect>> {
        let effects = self
            .update(id, None, |node, _| {
                let effects = task_ids(node).into_iter().map(Effect::CancelTask).collect();
                node.failure = Some(FailureInfo::new(FailureKind::Aborted, reason));
                node.transition(NodeStatus::Aborted)?;
                Ok(effects)
            })
            .await?;
        Ok(effects.unwrap_or_default())
    }

    async fn route(
        &self,
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
        scope: Ambiance,
        target: String,
    ) -> Vec<Effect> {
        let routed = self
            .locked(
                plan_execution_id,
                self.route_locked(plan_execution_id, parent_id, &scope, &target),
            )
            .await;
        self.track_routes(plan_execution_id, 0, 1);

        let mut effects = routed.unwrap_or_else(|e| {
            error!(plan_execution_id = %plan_execution_id, target = %target, "Routing failed: {}", e);
            Vec::new()
        });
        effects.push(Effect::Advance(plan_execution_id));
        effects
    }

    async fn route_locked(
        &self,
        plan_execution_id: Uuid,
        parent_id: Option<Uuid>,
        scope: &Ambiance,
        target: &str,
    ) -> Result<Vec<Effect>> {
        if self.is_halted(plan_execution_id) {
            info!(target = %target, "Plan is stopping, route not taken");
            return Ok(Vec::new());
        }

        let plan = self.plan_for(plan_execution_id)?;
        let plan_node = plan.node(target).ok_or_else(|| {
            EngineError::Configuration(format!("route target '{}' is not in the plan", target))
        })?;

        let nodes = self.store.list_by_plan(plan_execution_id).await?;
        if nodes
            .iter()
            .any(|n| n.plan_node_id == target && n.parent_id == parent_id && !n.status.is_terminal())
        {
            info!(target = %target, "Route target already running");
            return Ok(Vec::new());
        }

        let node = NodeExecution::from_plan_node(plan_node, scope, parent_id, None);
        info!(
            plan_execution_id = %plan_execution_id,
            node_execution_id = %node.id,
            "Routing to {}",
            target
        );
        self.store.insert(&node).await?;
        Ok(vec![Effect::Start {
            id: node.id,
            delay: Duration::ZERO,
        }])
    }

    async fn end_plan(&self, plan_execution_id: Uuid, ended_by: Uuid) -> Result<Vec<Effect>> {
        if let Some(mut run) = self.plans.get_mut(&plan_execution_id) {
            run.ended_by.get_or_insert(ended_by);
        }
        info!(
            "Plan execution {} ended early by node execution {}",
            plan_execution_id, ended_by
        );

        let nodes = self.store.list_by_plan(plan_execution_id).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.id != ended_by && !n.status.is_terminal())
            .map(|n| Effect::Abort {
                id: n.id,
                reason: format!("plan ended by node execution {}", ended_by),
            })
            .collect())
    }

    /// Announce a terminal node and wake whoever waits on it
    fn node_ended(&self, node: NodeExecution) -> Vec<Effect> {
        self.bus.publish(&OrchestrationEvent::NodeEnded {
            plan_execution_id: node.plan_execution_id,
            node_execution_id: node.id,
            plan_node_id: node.plan_node_id.clone(),
            parent_id: node.parent_id,
            status: node.status,
            failure: node.failure.clone(),
            at: node.ended_at.unwrap_or_else(Utc::now),
        });

        if let Some(replacement) = node.retried_by {
            debug!(node_execution_id = %node.id, %replacement, "Superseded by retry");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let (Some(parent_id), Some(notify_id)) = (node.parent_id, node.notify_id.clone()) {
            if !aborted_by_engine(&node) {
                if counts_as_failure(&node) {
                    effects.push(Effect::Send(ResponseEvent::new(
                        parent_id,
                        ResponsePayload::SuspendChain {
                            failed_child: node.id,
                        },
                    )));
                }
                effects.push(Effect::Send(ResponseEvent::new(
                    parent_id,
                    ResponsePayload::ResumeNodeExecution {
                        callback_id: notify_id,
                        data: child_result(&node),
                        attempt: None,
                    },
                )));
            }
        }
        effects.push(Effect::Advance(node.plan_execution_id));
        effects
    }

    /// Instantiate ready nodes, or settle the run once nothing is left to do
    async fn advance_plan(&self, plan_execution_id: Uuid) -> Result<Vec<Effect>> {
        let Some((plan, halted)) = self.plans.get(&plan_execution_id).and_then(|run| {
            (!run.record.status.is_terminal()).then(|| (run.plan.clone(), run.is_halted()))
        }) else {
            return Ok(Vec::new());
        };

        self.locked(
            plan_execution_id,
            self.advance_locked(plan_execution_id, &plan, halted),
        )
        .await
    }

    async fn advance_locked(
        &self,
        plan_execution_id: Uuid,
        plan: &Plan,
        halted: bool,
    ) -> Result<Vec<Effect>> {
        let nodes = self.store.list_by_plan(plan_execution_id).await?;
        let effective = effective_executions(&nodes);

        if !halted {
            let statuses: HashMap<String, NodeStatus> = effective
                .iter()
                .filter(|n| n.parent_id.is_none())
                .map(|n| {
                    // a superseded execution stands in for its replacement until that exists
                    let status = if n.retried_by.is_some() {
                        NodeStatus::Queued
                    } else {
                        n.status
                    };
                    (n.plan_node_id.clone(), status)
                })
                .collect();

            let ready = plan.ready_nodes(&statuses);
            if !ready.is_empty() {
                let scope = plan.root_scope(plan_execution_id);
                let mut effects = Vec::with_capacity(ready.len());
                for plan_node in ready {
                    let node = NodeExecution::from_plan_node(plan_node, &scope, None, None);
                    info!(
                        plan_execution_id = %plan_execution_id,
                        node_execution_id = %node.id,
                        "Instantiating node {}",
                        plan_node.id
                    );
                    self.store.insert(&node).await?;
                    effects.push(Effect::Start {
                        id: node.id,
                        delay: Duration::ZERO,
                    });
                }
                return Ok(effects);
            }
        }

        let pending_routes = self
            .plans
            .get(&plan_execution_id)
            .map_or(0, |run| run.pending_routes);
        let settled = pending_routes == 0
            && nodes.iter().all(|n| n.status.is_terminal())
            && effective.iter().all(|n| n.retried_by.is_none());
        if settled {
            self.finish_plan(plan_execution_id, plan, &effective);
        }
        Ok(Vec::new())
    }

    fn finish_plan(&self, plan_execution_id: Uuid, plan: &Plan, effective: &[&NodeExecution]) {
        let top_level: Vec<&NodeExecution> = effective
            .iter()
            .copied()
            .filter(|n| n.parent_id.is_none())
            .collect();
        let failed_nodes: Vec<String> = top_level
            .iter()
            .filter(|n| counts_as_failure(n))
            .map(|n| n.plan_node_id.clone())
            .collect();
        let instantiated: HashSet<&str> = top_level.iter().map(|n| n.plan_node_id.as_str()).collect();
        let not_run: Vec<String> = plan
            .execution_order()
            .iter()
            .filter(|id| !plan.is_child(id) && !instantiated.contains(id.as_str()))
            .cloned()
            .collect();

        let ended_at = Utc::now();
        let status = {
            let Some(mut run) = self.plans.get_mut(&plan_execution_id) else {
                return;
            };
            if run.record.status.is_terminal() {
                return;
            }
            let status = if run.aborting {
                PlanStatus::Aborted
            } else if !failed_nodes.is_empty() || (!not_run.is_empty() && run.ended_by.is_none()) {
                PlanStatus::Failed
            } else {
                PlanStatus::Succeeded
            };
            run.record.status = status;
            run.record.ended_at = Some(ended_at);
            run.record.failed_nodes = failed_nodes;
            run.record.not_run = not_run;
            status
        };

        info!("Plan execution {} finished: {:?}", plan_execution_id, status);
        self.bus.publish(&OrchestrationEvent::PlanEnded {
            plan_execution_id,
            status,
            at: ended_at,
        });
        if let Some(run) = self.plans.get(&plan_execution_id) {
            run.status.send_replace(status);
        }
    }

    /// Apply one payload to a locked node
    fn handle(
        &self,
        node: &mut NodeExecution,
        plan: &Plan,
        payload: &ResponsePayload,
    ) -> Result<Vec<Effect>> {
        match payload {
            ResponsePayload::HandleFacilitateResponse { mode } => {
                node.transition(NodeStatus::Executing)?;
                node.mode = Some(*mode);
                Ok(vec![dispatch(WorkerJob::Execute {
                    invocation: invocation(node),
                    mode: *mode,
                })])
            }
            ResponsePayload::AddExecutableResponse { response } => {
                self.wait_async(node, plan, response)
            }
            ResponsePayload::ResumeNodeExecution {
                callback_id,
                data,
                attempt,
            } => {
                if attempt.is_some_and(|a| a != node.retry_count) {
                    info!(
                        node_execution_id = %node.id,
                        callback_id = %callback_id,
                        "Callback from an earlier attempt ignored"
                    );
                    return Ok(Vec::new());
                }
                if let Some(failure) = task_timed_out(node, callback_id, data) {
                    warn!(
                        node_execution_id = %node.id,
                        plan_node_id = %node.plan_node_id,
                        task_id = %callback_id,
                        "Task timed out: {}",
                        failure.message
                    );
                    return fail_timed_out(node, failure);
                }
                handle_callback(node, callback_id, data)
            }
            ResponsePayload::SpawnChild { child } => {
                node.executable_responses.push(ExecutableResponse::SpawnChild {
                    child: child.clone(),
                });
                spawn_children(node, plan, std::slice::from_ref(child), None)
            }
            ResponsePayload::SpawnChildren {
                children,
                max_concurrency,
            } => {
                node.executable_responses.push(ExecutableResponse::SpawnChildren {
                    children: children.clone(),
                    max_concurrency: *max_concurrency,
                });
                spawn_children(node, plan, children, *max_concurrency)
            }
            ResponsePayload::SuspendChain { failed_child } => suspend_chain(node, *failed_child),
            ResponsePayload::QueueTask { task } => self.queue_task(node, plan, task),
            ResponsePayload::HandleStepResponse { response } => advise(node, plan, response),
            ResponsePayload::HandleAdviserResponse { decision } => {
                self.commit(node, decision.clone())
            }
            ResponsePayload::HandleEventError { failure } => {
                warn!(
                    node_execution_id = %node.id,
                    plan_node_id = %node.plan_node_id,
                    "Step could not run: {}",
                    failure.message
                );
                fail_hard(node, failure.clone())
            }
        }
    }

    fn wait_async(
        &self,
        node: &mut NodeExecution,
        plan: &Plan,
        response: &ExecutableResponse,
    ) -> Result<Vec<Effect>> {
        let ExecutableResponse::Async {
            callback_ids,
            wait,
            timeout_secs,
        } = response
        else {
            return Err(EngineError::StepExecution(format!(
                "expected an async response, got {}",
                response.kind()
            )));
        };

        let deadline = timeout_secs
            .or_else(|| plan_timeout_secs(plan, node))
            .and_then(|secs| deadline_after(Duration::from_secs(secs)));

        node.executable_responses.push(response.clone());
        let resumed = node.begin_wait(WaitKind::Async, *wait, callback_ids.iter().cloned(), deadline)?;
        debug!(
            node_execution_id = %node.id,
            callbacks = callback_ids.len(),
            ?wait,
            "Waiting on async callbacks"
        );

        Ok(if resumed {
            vec![resume_job(node)]
        } else {
            Vec::new()
        })
    }

    fn queue_task(&self, node: &mut NodeExecution, plan: &Plan, task: &TaskSpec) -> Result<Vec<Effect>> {
        let timeout = task
            .timeout_secs
            .or_else(|| plan_timeout_secs(plan, node))
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_task_timeout);

        let request = TaskRequest::new(
            node.id,
            task.kind.as_str(),
            node.ambiance.scope_metadata(),
            task.payload.clone(),
            timeout,
        );

        node.executable_responses.push(ExecutableResponse::Task { task: task.clone() });
        node.begin_wait(
            WaitKind::Task,
            WaitMode::All,
            [request.task_id.to_string()],
            deadline_after(timeout),
        )?;
        Ok(vec![Effect::QueueTask(request)])
    }

    /// Commit the (possibly intercepted) adviser decision
    fn commit(&self, node: &mut NodeExecution, decision: AdviserDecision) -> Result<Vec<Effect>> {
        let Some(outcome) = node.outcome.clone() else {
            return Err(EngineError::StepExecution(format!(
                "adviser response for node execution {} without a step outcome",
                node.id
            )));
        };

        let decision = self
            .interceptors
            .iter()
            .fold(decision, |decision, interceptor| interceptor.intercept(node, decision));
        node.next_action = Some(decision.clone());

        info!(
            node_execution_id = %node.id,
            plan_node_id = %node.plan_node_id,
            ?decision,
            "Committing adviser decision"
        );

        let own = match outcome.status {
            StepStatus::Succeeded => NodeStatus::Succeeded,
            StepStatus::Failed => NodeStatus::Failed,
            // EXECUTING has no edge to SKIPPED
            StepStatus::Skipped if node.status == NodeStatus::Resuming => NodeStatus::Skipped,
            StepStatus::Skipped => NodeStatus::Succeeded,
        };

        let mut effects = Vec::new();
        let status = match decision {
            AdviserDecision::Proceed => own,
            AdviserDecision::MarkSuccess => NodeStatus::Succeeded,
            AdviserDecision::MarkFailure => NodeStatus::Failed,
            AdviserDecision::NextStep { target } => {
                effects.push(Effect::Route {
                    plan_execution_id: node.plan_execution_id,
                    parent_id: node.parent_id,
                    scope: node.ambiance.parent_scope(),
                    target,
                });
                own
            }
            AdviserDecision::End => {
                effects.push(Effect::EndPlan {
                    plan_execution_id: node.plan_execution_id,
                    ended_by: node.id,
                });
                own
            }
            AdviserDecision::Retry { backoff_ms } if outcome.status == StepStatus::Failed => {
                return retry(node, &outcome, Duration::from_millis(backoff_ms));
            }
            AdviserDecision::Retry { .. } => own,
        };

        node.failure = match status {
            NodeStatus::Failed => Some(
                outcome
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureInfo::step("marked as failed by adviser")),
            ),
            _ => None,
        };
        node.transition(status)?;
        Ok(effects)
    }
}

#[async_trait]
impl ResponseEventHandler for Orchestrator {
    async fn apply(&self, event: ResponseEvent) -> Result<()> {
        debug!(
            node_execution_id = %event.node_execution_id,
            sequence = event.sequence,
            "Applying {}",
            event.kind()
        );

        let applied = self
            .update(event.node_execution_id, Some(event.sequence), |node, plan| {
                self.handle(node, plan, &event.payload)
            })
            .await?;

        if let Some(effects) = applied {
            self.record(event);
            self.run_effects(effects).await;
        }
        Ok(())
    }

    async fn undeliverable(&self, event: ResponseEvent, error: EngineError) {
        error!(
            node_execution_id = %event.node_execution_id,
            event = %event.kind(),
            "Response event could not be applied: {}",
            error
        );

        let failure = FailureInfo::from(&error);
        match self
            .update(event.node_execution_id, None, |node, _| {
                fail_hard(node, failure.clone())
            })
            .await
        {
            Ok(Some(effects)) => self.run_effects(effects).await,
            Ok(None) => {}
            Err(e) => error!(
                node_execution_id = %event.node_execution_id,
                "Could not fail node execution: {}",
                e
            ),
        }
    }
}

fn dispatch(job: WorkerJob) -> Effect {
    Effect::Dispatch {
        job,
        delay: Duration::ZERO,
    }
}

fn invocation(node: &NodeExecution) -> StepInvocation {
    StepInvocation {
        node_execution_id: node.id,
        attempt: node.retry_count,
        step_type: node.step_type.clone(),
        parameters: node.resolved_parameters.clone(),
        ambiance: node.ambiance.clone(),
    }
}

fn resume_job(node: &NodeExecution) -> Effect {
    dispatch(WorkerJob::Resume {
        invocation: invocation(node),
        responses: node.responses.clone(),
    })
}

fn plan_timeout_secs(plan: &Plan, node: &NodeExecution) -> Option<u64> {
    plan.node(&node.plan_node_id)
        .and_then(|plan_node| plan.timeout_secs_for(plan_node))
}

fn deadline_after(timeout: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_add_signed(timeout))
}

/// Task ids a node is waiting on
fn task_ids(node: &NodeExecution) -> Vec<TaskId> {
    match &node.outstanding {
        Some(wait) if wait.kind == WaitKind::Task => wait
            .pending
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Failure of an awaited task that the delegate gave up on
fn task_timed_out(node: &NodeExecution, callback_id: &str, data: &ResponseData) -> Option<FailureInfo> {
    let wait = node.outstanding.as_ref()?;
    if node.status != NodeStatus::TaskWaiting
        || wait.kind != WaitKind::Task
        || !wait.pending.contains(callback_id)
    {
        return None;
    }
    data.failure
        .clone()
        .filter(|failure| failure.kind == FailureKind::Timeout)
}

/// Timeouts fail the node directly; advisers are not consulted
fn fail_timed_out(node: &mut NodeExecution, failure: FailureInfo) -> Result<Vec<Effect>> {
    let effects = task_ids(node).into_iter().map(Effect::ExpireTask).collect();
    node.failure = Some(failure);
    node.transition(NodeStatus::Failed)?;
    Ok(effects)
}

/// Time spent in the current wait, falling back to the whole execution
fn waited_for(node: &NodeExecution, now: DateTime<Utc>) -> Duration {
    node.wait_started_at
        .or(node.started_at)
        .and_then(|since| (now - since).to_std().ok())
        .unwrap_or_default()
}

/// Aborted by an operator, an ending adviser or a suspended chain
fn aborted_by_engine(node: &NodeExecution) -> bool {
    node.status == NodeStatus::Aborted
        && node
            .failure
            .as_ref()
            .map_or(true, |f| f.kind == FailureKind::Aborted)
}

fn counts_as_failure(node: &NodeExecution) -> bool {
    match node.status {
        NodeStatus::Failed => true,
        NodeStatus::Aborted => !aborted_by_engine(node),
        _ => false,
    }
}

/// What a parent observes for an ended child
fn child_result(node: &NodeExecution) -> ResponseData {
    let output = node
        .outcome
        .as_ref()
        .map(|o| o.output.clone())
        .unwrap_or(Value::Null);

    match node.status {
        NodeStatus::Succeeded => ResponseData::success(output),
        NodeStatus::Skipped => ResponseData::skipped(),
        status => ResponseData {
            payload: output,
            ..ResponseData::failure(node.failure.clone().unwrap_or_else(|| {
                FailureInfo::step(format!("child {} ended {}", node.plan_node_id, status))
            }))
        },
    }
}

/// Latest execution per (parent, plan node), in creation order
fn effective_executions(nodes: &[NodeExecution]) -> Vec<&NodeExecution> {
    let mut latest: HashMap<(Option<Uuid>, &str), &NodeExecution> = HashMap::new();
    for node in nodes {
        let key = (node.parent_id, node.plan_node_id.as_str());
        match latest.get(&key) {
            Some(existing) if existing.created_at > node.created_at => {}
            _ => {
                latest.insert(key, node);
            }
        }
    }
    let mut effective: Vec<&NodeExecution> = latest.into_values().collect();
    effective.sort_by_key(|n| n.created_at);
    effective
}

/// Fail a node from whatever state it is in
fn fail_hard(node: &mut NodeExecution, failure: FailureInfo) -> Result<Vec<Effect>> {
    let effects = task_ids(node).into_iter().map(Effect::CancelTask).collect();
    node.failure = Some(failure);
    let to = if node.status.can_transition_to(NodeStatus::Failed) {
        NodeStatus::Failed
    } else {
        NodeStatus::Aborted
    };
    node.transition(to)?;
    Ok(effects)
}

fn handle_callback(
    node: &mut NodeExecution,
    callback_id: &CallbackId,
    data: &ResponseData,
) -> Result<Vec<Effect>> {
    match node.observe_callback(callback_id, data.clone())? {
        CallbackObservation::Resumed => {
            debug!(node_execution_id = %node.id, callback_id = %callback_id, "Wait satisfied");
            Ok(vec![resume_job(node)])
        }
        CallbackObservation::Pending(remaining) => {
            debug!(node_execution_id = %node.id, callback_id = %callback_id, remaining, "Callback recorded");
            Ok(start_more_children(node))
        }
        CallbackObservation::Duplicate => {
            info!(node_execution_id = %node.id, callback_id = %callback_id, "Duplicate callback ignored");
            Ok(Vec::new())
        }
        CallbackObservation::Buffered => {
            debug!(node_execution_id = %node.id, callback_id = %callback_id, "Callback arrived before its wait, buffered");
            Ok(Vec::new())
        }
        CallbackObservation::Unknown => {
            warn!(node_execution_id = %node.id, callback_id = %callback_id, "Callback not awaited, ignored");
            Ok(Vec::new())
        }
    }
}

fn spawn_children(
    node: &mut NodeExecution,
    plan: &Plan,
    children: &[String],
    max_concurrency: Option<usize>,
) -> Result<Vec<Effect>> {
    let mut created = Vec::with_capacity(children.len());
    for child_id in children {
        let plan_node = plan.node(child_id).ok_or_else(|| {
            EngineError::StepExecution(format!("unknown child node '{}'", child_id))
        })?;
        let mut child = NodeExecution::from_plan_node(plan_node, &node.ambiance, Some(node.id), None);
        child.notify_id = Some(child.id.to_string());
        created.push(child);
    }

    node.children = created.iter().map(|c| c.id).collect();
    node.children_started = 0;
    node.child_concurrency = max_concurrency;
    let notify_ids: Vec<CallbackId> = created.iter().filter_map(|c| c.notify_id.clone()).collect();
    node.begin_wait(WaitKind::Children, WaitMode::All, notify_ids, None)?;

    info!(
        node_execution_id = %node.id,
        children = created.len(),
        ?max_concurrency,
        "Spawning children"
    );

    let mut effects: Vec<Effect> = created.into_iter().map(Effect::Create).collect();
    effects.extend(start_more_children(node));
    Ok(effects)
}

/// Start waiting children up to the concurrency limit
fn start_more_children(node: &mut NodeExecution) -> Vec<Effect> {
    let waiting_on_children = node
        .outstanding
        .as_ref()
        .is_some_and(|wait| wait.kind == WaitKind::Children);
    if !waiting_on_children {
        return Vec::new();
    }

    let limit = node.child_concurrency.unwrap_or(usize::MAX).max(1);
    let running = node.children_started.saturating_sub(node.responses.len());

    let mut effects = Vec::new();
    while node.children_started < node.children.len() && running + effects.len() < limit {
        effects.push(Effect::Start {
            id: node.children[node.children_started],
            delay: Duration::ZERO,
        });
        node.children_started += 1;
    }
    effects
}

fn suspend_chain(node: &mut NodeExecution, failed_child: Uuid) -> Result<Vec<Effect>> {
    if !node.is_chain() || node.status != NodeStatus::ChildWaiting {
        return Ok(Vec::new());
    }

    let unstarted = node.unstarted_children().to_vec();
    node.children_started = node.children.len();
    if unstarted.is_empty() {
        return Ok(Vec::new());
    }

    info!(
        node_execution_id = %node.id,
        %failed_child,
        skipped = unstarted.len(),
        "Suspending chain"
    );

    let notify_ids: Vec<CallbackId> = unstarted.iter().map(|id| id.to_string()).collect();
    let resumed = node.drop_callbacks(&notify_ids)?;

    let mut effects: Vec<Effect> = unstarted
        .into_iter()
        .map(|id| Effect::Abort {
            id,
            reason: format!("chain suspended after {} failed", failed_child),
        })
        .collect();
    if resumed {
        effects.push(resume_job(node));
    }
    Ok(effects)
}

/// Run the advisers on a step outcome; the decision travels as its own event
fn advise(node: &mut NodeExecution, plan: &Plan, response: &StepResponse) -> Result<Vec<Effect>> {
    if !matches!(node.status, NodeStatus::Executing | NodeStatus::Resuming) {
        return Err(EngineError::StepExecution(format!(
            "step response for node execution {} while {}",
            node.id, node.status
        )));
    }

    let plan_node = plan.node(&node.plan_node_id).ok_or_else(|| {
        EngineError::Fatal(format!("plan node '{}' disappeared", node.plan_node_id))
    })?;
    let decision = AdviserChain::for_node(plan, plan_node).evaluate(&AdvisingInput {
        node,
        response,
    });

    node.outcome = Some(response.clone());
    node.next_action = Some(decision.clone());
    Ok(vec![Effect::Send(ResponseEvent::new(
        node.id,
        ResponsePayload::HandleAdviserResponse { decision },
    ))])
}

fn retry(node: &mut NodeExecution, outcome: &StepResponse, backoff: Duration) -> Result<Vec<Effect>> {
    if node.status == NodeStatus::Resuming {
        let attempt = node.attempts_used() + 1;
        info!(
            node_execution_id = %node.id,
            plan_node_id = %node.plan_node_id,
            attempt,
            "Retrying in place"
        );
        node.retry_history.push(RetryAttempt {
            attempt,
            failure: outcome.failure.clone(),
            at: Utc::now(),
        });
        node.retire_attempt();
        node.outcome = None;
        node.children.clear();
        node.children_started = 0;
        node.child_concurrency = None;
        node.transition(NodeStatus::Executing)?;

        let mode = node.mode.unwrap_or(ExecutionMode::Sync);
        return Ok(vec![Effect::Dispatch {
            job: WorkerJob::Execute {
                invocation: invocation(node),
                mode,
            },
            delay: backoff,
        }]);
    }

    // EXECUTING cannot re-enter itself; a fresh execution takes over
    node.failure = Some(
        outcome
            .failure
            .clone()
            .unwrap_or_else(|| FailureInfo::step("step failed")),
    );
    node.transition(NodeStatus::Failed)?;
    let replacement = NodeExecution::retry_of(node);
    node.retried_by = Some(replacement.id);

    info!(
        node_execution_id = %node.id,
        plan_node_id = %node.plan_node_id,
        replacement = %replacement.id,
        attempt = replacement.retry_index,
        "Retrying as a new execution"
    );

    let id = replacement.id;
    Ok(vec![
        Effect::Create(replacement),
        Effect::Start { id, delay: backoff },
    ])
}
