//! Persistence for node executions and plan run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::{SqliteHistoryStore, SqliteNodeExecutionStore};

use crate::core::{
    error::{EngineError, Result},
    node_execution::NodeExecution,
    state::{NodeStatus, PlanStatus},
};
use crate::events::{event_handler, EventHandler, OrchestrationEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for node executions with optimistic concurrency
#[async_trait::async_trait]
pub trait NodeExecutionStore: Send + Sync {
    /// Store a new node execution at version 0
    async fn insert(&self, node: &NodeExecution) -> Result<()>;

    /// Load a node execution by id
    async fn load(&self, id: Uuid) -> Result<NodeExecution>;

    /// Overwrite if the stored version still equals `node.version`; returns the new version
    async fn save(&self, node: &NodeExecution) -> Result<u64>;

    /// Every execution of a plan run, including superseded retries
    async fn list_by_plan(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>>;

    /// Direct children of a node execution
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>>;

    /// Nodes parked in a waiting state with a deadline
    async fn list_waiting(&self) -> Result<Vec<NodeExecution>>;
}

/// In-memory node execution store
pub struct InMemoryNodeExecutionStore {
    nodes: RwLock<HashMap<Uuid, NodeExecution>>,
}

impl InMemoryNodeExecutionStore {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryNodeExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NodeExecutionStore for InMemoryNodeExecutionStore {
    async fn insert(&self, node: &NodeExecution) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(EngineError::Persistence(format!(
                "node execution {} already exists",
                node.id
            )));
        }
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<NodeExecution> {
        let nodes = self.nodes.read().await;
        nodes.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn save(&self, node: &NodeExecution) -> Result<u64> {
        let mut nodes = self.nodes.write().await;
        let stored = nodes.get_mut(&node.id).ok_or(EngineError::NotFound(node.id))?;
        if stored.version != node.version {
            return Err(EngineError::StateConflict {
                id: node.id,
                expected: node.version,
            });
        }
        let mut updated = node.clone();
        updated.version += 1;
        let version = updated.version;
        *stored = updated;
        Ok(version)
    }

    async fn list_by_plan(&self, plan_execution_id: Uuid) -> Result<Vec<NodeExecution>> {
        let nodes = self.nodes.read().await;
        let mut result: Vec<NodeExecution> = nodes
            .values()
            .filter(|n| n.plan_execution_id == plan_execution_id)
            .cloned()
            .collect();
        result.sort_by_key(|n| n.created_at);
        Ok(result)
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<NodeExecution>> {
        let nodes = self.nodes.read().await;
        let mut result: Vec<NodeExecution> = nodes
            .values()
            .filter(|n| n.parent_id == Some(parent_id))
            .cloned()
            .collect();
        result.sort_by_key(|n| n.created_at);
        Ok(result)
    }

    async fn list_waiting(&self) -> Result<Vec<NodeExecution>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .values()
            .filter(|n| n.status.is_waiting() && n.deadline.is_some())
            .cloned()
            .collect())
    }
}

/// Summary of a plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Plan execution id
    pub execution_id: Uuid,

    pub plan_name: String,

    pub status: PlanStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    /// Node executions that ended
    pub completed_nodes: usize,

    pub failed_nodes: usize,

    /// Node executions started so far
    pub total_nodes: usize,
}

impl ExecutionSummary {
    pub fn new(execution_id: Uuid, plan_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            plan_name: plan_name.into(),
            status: PlanStatus::Running,
            started_at,
            completed_at: None,
            progress: 0.0,
            completed_nodes: 0,
            failed_nodes: 0,
            total_nodes: 0,
        }
    }

    /// Fold one lifecycle event into the summary
    pub fn apply(&mut self, event: &OrchestrationEvent) {
        match event {
            OrchestrationEvent::NodeStarted { .. } => self.total_nodes += 1,
            OrchestrationEvent::NodeEnded { status, .. } => {
                self.completed_nodes += 1;
                if *status == NodeStatus::Failed {
                    self.failed_nodes += 1;
                }
            }
            OrchestrationEvent::PlanEnded { status, at, .. } => {
                self.status = *status;
                self.completed_at = Some(*at);
            }
            OrchestrationEvent::PlanStarted { .. } | OrchestrationEvent::NodeStatusUpdate { .. } => {}
        }
        self.progress = if self.total_nodes == 0 {
            0.0
        } else {
            self.completed_nodes as f64 / self.total_nodes as f64
        };
    }
}

/// Keeps an [`ExecutionSummary`] per plan run, fed by a sync bus handler
#[derive(Default)]
pub struct SummaryTracker {
    summaries: Mutex<HashMap<Uuid, ExecutionSummary>>,
}

impl SummaryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus handler updating this tracker
    pub fn handler(self: &Arc<Self>) -> EventHandler {
        let tracker = Arc::clone(self);
        event_handler(move |event| tracker.record(event))
    }

    pub fn record(&self, event: &OrchestrationEvent) -> anyhow::Result<()> {
        let mut summaries = self
            .summaries
            .lock()
            .map_err(|_| anyhow::anyhow!("summary tracker lock poisoned"))?;

        if let OrchestrationEvent::PlanStarted {
            plan_execution_id,
            plan_id,
            at,
        } = event
        {
            summaries.insert(
                *plan_execution_id,
                ExecutionSummary::new(*plan_execution_id, plan_id.as_str(), *at),
            );
            return Ok(());
        }

        let Some(summary) = summaries.get_mut(&event.plan_execution_id()) else {
            anyhow::bail!("no summary for plan execution {}", event.plan_execution_id());
        };
        summary.apply(event);
        Ok(())
    }

    pub fn get(&self, plan_execution_id: Uuid) -> Option<ExecutionSummary> {
        self.summaries
            .lock()
            .ok()
            .and_then(|s| s.get(&plan_execution_id).cloned())
    }
}

/// Trait for plan history backends
#[async_trait::async_trait]
pub trait PlanHistoryStore: Send + Sync {
    /// Save a plan execution summary
    async fn save_execution(&self, execution: &ExecutionSummary) -> anyhow::Result<()>;

    /// Load an execution by ID
    async fn load_execution(&self, execution_id: Uuid) -> anyhow::Result<Option<ExecutionSummary>>;

    /// List all executions of a plan, newest first
    async fn list_executions(&self, plan_name: &str) -> anyhow::Result<Vec<ExecutionSummary>>;

    /// List all plan names
    async fn list_plans(&self) -> anyhow::Result<Vec<String>>;
}

/// In-memory history (for testing or ephemeral use)
pub struct InMemoryHistory {
    executions: RwLock<HashMap<Uuid, ExecutionSummary>>,
    by_plan: RwLock<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            by_plan: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PlanHistoryStore for InMemoryHistory {
    async fn save_execution(&self, execution: &ExecutionSummary) -> anyhow::Result<()> {
        let mut execs = self.executions.write().await;
        let is_new = execs.insert(execution.execution_id, execution.clone()).is_none();

        if is_new {
            let mut by_plan = self.by_plan.write().await;
            by_plan
                .entry(execution.plan_name.clone())
                .or_default()
                .push(execution.execution_id);
        }

        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> anyhow::Result<Option<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(execs.get(&execution_id).cloned())
    }

    async fn list_executions(&self, plan_name: &str) -> anyhow::Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        let by_plan = self.by_plan.read().await;

        let mut result: Vec<ExecutionSummary> = by_plan
            .get(plan_name)
            .map(|ids| ids.iter().filter_map(|id| execs.get(id).cloned()).collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn list_plans(&self) -> anyhow::Result<Vec<String>> {
        let by_plan = self.by_plan.read().await;
        let mut names: Vec<String> = by_plan.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
