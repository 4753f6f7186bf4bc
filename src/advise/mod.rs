//! Advisers decide what happens after a step reports its outcome
//!
//! A node is advised by its own (step-level) advisers first, in declaration
//! order. Stage-level advisers from the plan's failure strategy are consulted
//! only when every step-level adviser declines. When nobody has an opinion the
//! node proceeds with the status its step reported.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{
    node_execution::NodeExecution,
    plan::{Plan, PlanNode},
    response::{StepResponse, StepStatus},
};

/// What to do with a node whose step has reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserDecision {
    /// Commit the status the step reported
    Proceed,
    /// Run the step again after `backoff_ms`
    Retry { backoff_ms: u64 },
    /// Commit SUCCEEDED regardless of the step status
    MarkSuccess,
    /// Commit FAILED regardless of the step status
    MarkFailure,
    /// Commit the step status, then start `target` beside this node
    NextStep { target: String },
    /// Commit the step status and stop the plan
    End,
}

/// What a retry adviser does once its budget is used up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    #[default]
    MarkFailure,
    Ignore,
    End,
}

/// Action taken by an on-failure adviser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Treat the failure as success
    Ignore,
    MarkFailure,
    End,
    /// Start `target` instead of failing the plan
    NextStep,
}

/// Adviser declaration as it appears in plan YAML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserSpec {
    Retry {
        max_retries: u32,
        #[serde(default)]
        backoff_ms: u64,
        #[serde(default)]
        on_exhausted: ExhaustedAction,
    },
    OnSuccess {
        next: String,
    },
    OnFailure {
        action: FailureAction,
        #[serde(default)]
        target: Option<String>,
    },
}

impl AdviserSpec {
    /// Plan node this adviser may route to
    pub fn target(&self) -> Option<&str> {
        match self {
            AdviserSpec::Retry { .. } => None,
            AdviserSpec::OnSuccess { next } => Some(next.as_str()),
            AdviserSpec::OnFailure { target, .. } => target.as_deref(),
        }
    }

    /// Build the adviser this declaration describes
    pub fn build(&self) -> Arc<dyn Adviser> {
        match self {
            AdviserSpec::Retry {
                max_retries,
                backoff_ms,
                on_exhausted,
            } => Arc::new(RetryAdviser {
                max_retries: *max_retries,
                backoff_ms: *backoff_ms,
                on_exhausted: *on_exhausted,
            }),
            AdviserSpec::OnSuccess { next } => Arc::new(OnSuccessAdviser {
                next: next.clone(),
            }),
            AdviserSpec::OnFailure { action, target } => Arc::new(OnFailureAdviser {
                action: *action,
                target: target.clone(),
            }),
        }
    }
}

/// Everything an adviser may look at
pub struct AdvisingInput<'a> {
    pub node: &'a NodeExecution,
    pub response: &'a StepResponse,
}

/// Policy that may (or may not) have an opinion about a step outcome
pub trait Adviser: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` declines and passes the decision on
    fn advise(&self, input: &AdvisingInput<'_>) -> Option<AdviserDecision>;
}

/// Retries failed steps up to `max_retries`
#[derive(Debug, Clone)]
pub struct RetryAdviser {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub on_exhausted: ExhaustedAction,
}

impl Adviser for RetryAdviser {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn advise(&self, input: &AdvisingInput<'_>) -> Option<AdviserDecision> {
        if input.response.status != StepStatus::Failed {
            return None;
        }
        if input.node.attempts_used() < self.max_retries {
            return Some(AdviserDecision::Retry {
                backoff_ms: self.backoff_ms,
            });
        }
        Some(match self.on_exhausted {
            ExhaustedAction::MarkFailure => AdviserDecision::MarkFailure,
            ExhaustedAction::Ignore => AdviserDecision::MarkSuccess,
            ExhaustedAction::End => AdviserDecision::End,
        })
    }
}

/// Routes to another node once this one succeeds
#[derive(Debug, Clone)]
pub struct OnSuccessAdviser {
    pub next: String,
}

impl Adviser for OnSuccessAdviser {
    fn name(&self) -> &'static str {
        "on_success"
    }

    fn advise(&self, input: &AdvisingInput<'_>) -> Option<AdviserDecision> {
        (input.response.status == StepStatus::Succeeded).then(|| AdviserDecision::NextStep {
            target: self.next.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct OnFailureAdviser {
    pub action: FailureAction,
    pub target: Option<String>,
}

impl Adviser for OnFailureAdviser {
    fn name(&self) -> &'static str {
        "on_failure"
    }

    fn advise(&self, input: &AdvisingInput<'_>) -> Option<AdviserDecision> {
        if input.response.status != StepStatus::Failed {
            return None;
        }
        match (self.action, &self.target) {
            (FailureAction::Ignore, _) => Some(AdviserDecision::MarkSuccess),
            (FailureAction::MarkFailure, _) => Some(AdviserDecision::MarkFailure),
            (FailureAction::End, _) => Some(AdviserDecision::End),
            (FailureAction::NextStep, Some(target)) => Some(AdviserDecision::NextStep {
                target: target.clone(),
            }),
            (FailureAction::NextStep, None) => None,
        }
    }
}

/// Step-level advisers followed by stage-level ones
#[derive(Clone, Default)]
pub struct AdviserChain {
    step_level: Vec<Arc<dyn Adviser>>,
    stage_level: Vec<Arc<dyn Adviser>>,
}

impl AdviserChain {
    pub fn new(step_level: Vec<Arc<dyn Adviser>>, stage_level: Vec<Arc<dyn Adviser>>) -> Self {
        Self {
            step_level,
            stage_level,
        }
    }

    /// Chain for a plan node
    pub fn for_node(plan: &Plan, node: &PlanNode) -> Self {
        Self::new(
            node.advisers.iter().map(AdviserSpec::build).collect(),
            plan.stage_advisers.iter().map(AdviserSpec::build).collect(),
        )
    }

    /// First opinion wins; Proceed when everyone declines
    pub fn evaluate(&self, input: &AdvisingInput<'_>) -> AdviserDecision {
        for adviser in self.step_level.iter().chain(self.stage_level.iter()) {
            if let Some(decision) = adviser.advise(input) {
                tracing::debug!(
                    node_execution_id = %input.node.id,
                    adviser = adviser.name(),
                    ?decision,
                    "Adviser decided"
                );
                return decision;
            }
        }
        AdviserDecision::Proceed
    }
}

/// Hook that sees, and may replace, every decision before it is committed
pub trait DecisionInterceptor: Send + Sync {
    fn intercept(&self, node: &NodeExecution, decision: AdviserDecision) -> AdviserDecision;
}
