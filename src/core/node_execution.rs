//! Live instance of a plan node for one plan run

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::advise::AdviserDecision;
use crate::core::{
    ambiance::{Ambiance, Level},
    error::{EngineError, FailureInfo, Result},
    plan::PlanNode,
    response::{
        CallbackId, ExecutableResponse, ExecutionMode, ResponseData, ResponseMap, StepResponse,
        WaitMode,
    },
    state::NodeStatus,
};
use crate::step::StepType;

/// What a node is suspended on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    Task,
    Async,
    Children,
}

impl WaitKind {
    fn status(&self) -> NodeStatus {
        match self {
            WaitKind::Task => NodeStatus::TaskWaiting,
            WaitKind::Async => NodeStatus::AsyncWaiting,
            WaitKind::Children => NodeStatus::ChildWaiting,
        }
    }
}

/// The active outstanding-callback set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackWait {
    pub kind: WaitKind,
    pub mode: WaitMode,
    pub pending: BTreeSet<CallbackId>,
}

/// Result of reporting a callback id to a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackObservation {
    /// Wait satisfied, node moved to RESUMING
    Resumed,
    /// Recorded, still waiting on this many ids
    Pending(usize),
    /// Already observed earlier
    Duplicate,
    /// Arrived before the wait was registered; replayed by `begin_wait`
    Buffered,
    /// Not awaited by this node
    Unknown,
}

/// One retry of a node, in-place or as a new execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub failure: Option<FailureInfo>,
    pub at: DateTime<Utc>,
}

/// Runtime instance of a [`PlanNode`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub plan_execution_id: Uuid,
    pub plan_node_id: String,
    pub name: String,
    pub step_type: StepType,

    /// None for top-level nodes
    pub parent_id: Option<Uuid>,

    /// Callback id under which the parent awaits this node; inherited by retries
    pub notify_id: Option<CallbackId>,

    pub ambiance: Ambiance,
    pub status: NodeStatus,
    pub mode: Option<ExecutionMode>,

    /// Opaque until the step registry binds it to a concrete type
    pub resolved_parameters: Value,

    pub executable_responses: Vec<ExecutableResponse>,
    pub outstanding: Option<CallbackWait>,

    /// Results collected for the current wait
    pub responses: ResponseMap,

    /// Every callback id ever observed, for duplicate detection
    pub resolved_callbacks: BTreeSet<CallbackId>,

    /// Results that overtook their wait registration
    #[serde(default)]
    pub early_callbacks: ResponseMap,

    /// Ids resolved by earlier in-place attempts; late reports for them are duplicates
    #[serde(default)]
    pub retired_callbacks: BTreeSet<CallbackId>,

    /// Step outcome waiting for the adviser's decision
    pub outcome: Option<StepResponse>,
    pub next_action: Option<AdviserDecision>,

    /// In-place retries (RESUMING -> EXECUTING)
    pub retry_count: u32,
    /// Position in the retry lineage (0 for the first execution of this plan node)
    pub retry_index: u32,
    /// Earlier executions of the same plan node, oldest first
    pub retry_ids: Vec<Uuid>,
    /// Set when a newer execution replaced this one
    pub retried_by: Option<Uuid>,
    pub retry_history: Vec<RetryAttempt>,

    /// Ordered child execution ids
    pub children: Vec<Uuid>,
    /// Children started so far, in `children` order
    pub children_started: usize,
    pub child_concurrency: Option<usize>,

    pub deadline: Option<DateTime<Utc>>,
    /// When the current (or last) wait began
    #[serde(default)]
    pub wait_started_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureInfo>,

    pub applied_sequences: BTreeSet<u64>,
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Expand a plan node into a fresh QUEUED execution
    ///
    /// `scope` is the ambiance of the parent (or the plan root); the new level is pushed on it.
    pub fn from_plan_node(
        plan_node: &PlanNode,
        scope: &Ambiance,
        parent_id: Option<Uuid>,
        notify_id: Option<CallbackId>,
    ) -> Self {
        let id = Uuid::new_v4();
        let ambiance = scope.with_level(Level {
            node_execution_id: id,
            plan_node_id: plan_node.id.clone(),
            step_type: plan_node.step_type.clone(),
            retry_index: 0,
        });

        Self {
            id,
            plan_execution_id: scope.plan_execution_id,
            plan_node_id: plan_node.id.clone(),
            name: plan_node.name.clone(),
            step_type: plan_node.step_type.clone(),
            parent_id,
            notify_id,
            ambiance,
            status: NodeStatus::Queued,
            mode: None,
            resolved_parameters: plan_node.parameters.clone(),
            executable_responses: Vec::new(),
            outstanding: None,
            responses: ResponseMap::new(),
            resolved_callbacks: BTreeSet::new(),
            early_callbacks: ResponseMap::new(),
            retired_callbacks: BTreeSet::new(),
            outcome: None,
            next_action: None,
            retry_count: 0,
            retry_index: 0,
            retry_ids: Vec::new(),
            retried_by: None,
            retry_history: Vec::new(),
            children: Vec::new(),
            children_started: 0,
            child_concurrency: None,
            deadline: None,
            wait_started_at: None,
            failure: None,
            applied_sequences: BTreeSet::new(),
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// New QUEUED execution of the same plan node, linked into the retry lineage
    pub fn retry_of(previous: &NodeExecution) -> Self {
        let id = Uuid::new_v4();
        let retry_index = previous.retry_index + 1;
        let ambiance = previous.ambiance.with_replaced_level(Level {
            node_execution_id: id,
            plan_node_id: previous.plan_node_id.clone(),
            step_type: previous.step_type.clone(),
            retry_index,
        });

        let mut retry_ids = previous.retry_ids.clone();
        retry_ids.push(previous.id);

        let mut retry_history = previous.retry_history.clone();
        retry_history.push(RetryAttempt {
            attempt: previous.attempts_used() + 1,
            failure: previous.failure.clone(),
            at: Utc::now(),
        });

        Self {
            id,
            ambiance,
            status: NodeStatus::Queued,
            mode: None,
            executable_responses: Vec::new(),
            outstanding: None,
            responses: ResponseMap::new(),
            resolved_callbacks: BTreeSet::new(),
            early_callbacks: ResponseMap::new(),
            retired_callbacks: BTreeSet::new(),
            outcome: None,
            next_action: None,
            retry_index,
            retry_ids,
            retried_by: None,
            retry_history,
            children: Vec::new(),
            children_started: 0,
            child_concurrency: None,
            deadline: None,
            wait_started_at: None,
            failure: None,
            applied_sequences: BTreeSet::new(),
            version: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            ..previous.clone()
        }
    }

    /// Apply a state machine edge
    pub fn transition(&mut self, to: NodeStatus) -> Result<NodeStatus> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                id: self.id,
                from,
                to,
            });
        }

        self.status = to;
        if to == NodeStatus::Facilitating {
            self.started_at = Some(Utc::now());
        }
        if from.is_waiting() {
            self.outstanding = None;
            self.deadline = None;
        }
        if to.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.outstanding = None;
            self.deadline = None;
        }
        Ok(from)
    }

    /// Park the node on a new outstanding-callback set
    ///
    /// Returns true when buffered early results already satisfy the wait.
    pub fn begin_wait(
        &mut self,
        kind: WaitKind,
        mode: WaitMode,
        callback_ids: impl IntoIterator<Item = CallbackId>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if let Some(active) = &self.outstanding {
            return Err(EngineError::StepExecution(format!(
                "node execution {} is still waiting on {} callback(s)",
                self.id,
                active.pending.len()
            )));
        }

        let pending: BTreeSet<CallbackId> = callback_ids.into_iter().collect();
        if pending.is_empty() {
            return Err(EngineError::StepExecution(format!(
                "node execution {} cannot wait on an empty callback set",
                self.id
            )));
        }

        self.transition(kind.status())?;
        self.responses.clear();
        self.retired_callbacks.retain(|id| !pending.contains(id));
        self.wait_started_at = Some(Utc::now());
        self.outstanding = Some(CallbackWait {
            kind,
            mode,
            pending,
        });
        self.deadline = deadline;

        for (callback_id, data) in std::mem::take(&mut self.early_callbacks) {
            if self.observe_callback(&callback_id, data)? == CallbackObservation::Resumed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Record a callback result; moves to RESUMING once the wait is satisfied
    pub fn observe_callback(&mut self, callback_id: &str, data: ResponseData) -> Result<CallbackObservation> {
        let Some(wait) = self.outstanding.as_mut() else {
            if self.resolved_callbacks.contains(callback_id)
                || self.retired_callbacks.contains(callback_id)
                || self.early_callbacks.contains_key(callback_id)
            {
                return Ok(CallbackObservation::Duplicate);
            }
            if matches!(
                self.status,
                NodeStatus::Queued | NodeStatus::Facilitating | NodeStatus::Executing
            ) {
                self.early_callbacks.insert(callback_id.to_string(), data);
                return Ok(CallbackObservation::Buffered);
            }
            return Ok(CallbackObservation::Unknown);
        };

        if !wait.pending.remove(callback_id) {
            return Ok(if self.resolved_callbacks.contains(callback_id)
                || self.retired_callbacks.contains(callback_id)
            {
                CallbackObservation::Duplicate
            } else {
                CallbackObservation::Unknown
            });
        }

        let satisfied = match wait.mode {
            WaitMode::All => wait.pending.is_empty(),
            WaitMode::Any => true,
        };
        let remaining = wait.pending.len();

        self.resolved_callbacks.insert(callback_id.to_string());
        self.responses.insert(callback_id.to_string(), data);

        if satisfied {
            self.transition(NodeStatus::Resuming)?;
            Ok(CallbackObservation::Resumed)
        } else {
            Ok(CallbackObservation::Pending(remaining))
        }
    }

    /// Stop waiting on some ids without a result; resumes if nothing is left
    pub fn drop_callbacks(&mut self, callback_ids: &[CallbackId]) -> Result<bool> {
        let Some(wait) = self.outstanding.as_mut() else {
            return Ok(false);
        };
        for id in callback_ids {
            wait.pending.remove(id);
        }
        if wait.pending.is_empty() {
            self.transition(NodeStatus::Resuming)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn pending_callbacks(&self) -> Vec<CallbackId> {
        self.outstanding
            .as_ref()
            .map(|w| w.pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Start the next in-place attempt; ids seen so far stay retired
    pub fn retire_attempt(&mut self) {
        let resolved = std::mem::take(&mut self.resolved_callbacks);
        self.retired_callbacks.extend(resolved);
        self.retired_callbacks
            .extend(std::mem::take(&mut self.early_callbacks).into_keys());
        self.responses.clear();
        self.retry_count += 1;
    }

    /// Retries consumed across the in-place counter and the retry lineage
    pub fn attempts_used(&self) -> u32 {
        self.retry_count + self.retry_index
    }

    /// Latest execution of its plan node (not superseded by a retry)
    pub fn is_effective(&self) -> bool {
        self.retried_by.is_none()
    }

    pub fn has_applied(&self, sequence: u64) -> bool {
        self.applied_sequences.contains(&sequence)
    }

    pub fn mark_applied(&mut self, sequence: u64) {
        self.applied_sequences.insert(sequence);
    }

    /// Children that have not been started yet, in order
    pub fn unstarted_children(&self) -> &[Uuid] {
        &self.children[self.children_started.min(self.children.len())..]
    }

    pub fn is_chain(&self) -> bool {
        self.child_concurrency == Some(1)
    }
}
