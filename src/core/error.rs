//! Error taxonomy for the orchestration engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::core::state::NodeStatus;

/// Errors raised by the engine itself
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Duplicate or missing step-type registration, invalid plan. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Event delivery failed; retried by the transport before surfacing
    #[error("transport error: {0}")]
    Transport(String),

    /// A task or async wait exceeded its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The step itself failed
    #[error("step execution error: {0}")]
    StepExecution(String),

    /// Optimistic-concurrency violation on save
    #[error("state conflict on node execution {id}: expected version {expected}")]
    StateConflict { id: Uuid, expected: u64 },

    #[error("node execution {0} not found")]
    NotFound(Uuid),

    #[error("illegal transition {from:?} -> {to:?} for node execution {id}")]
    IllegalTransition {
        id: Uuid,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    /// Retries exhausted on an error that should never happen under normal operation
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether the transport should redeliver the event that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::StateConflict { .. } | EngineError::Persistence(_)
        )
    }

    /// Failure kind recorded on a node that failed because of this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Configuration(_) => FailureKind::Configuration,
            EngineError::Transport(_) => FailureKind::Transport,
            EngineError::Timeout(_) => FailureKind::Timeout,
            EngineError::StepExecution(_) => FailureKind::StepExecution,
            EngineError::StateConflict { .. }
            | EngineError::NotFound(_)
            | EngineError::IllegalTransition { .. }
            | EngineError::Persistence(_)
            | EngineError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by step implementations
#[derive(Debug, Clone, Error)]
pub enum StepError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Failed(String),

    /// The step does not implement the requested capability
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Category of a node failure, reported to users and advisers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Transport,
    Timeout,
    StepExecution,
    Aborted,
    Fatal,
}

/// Failure details attached to a failed node or step response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn step(message: impl Into<String>) -> Self {
        Self::new(FailureKind::StepExecution, message)
    }
}

impl From<&EngineError> for FailureInfo {
    fn from(error: &EngineError) -> Self {
        FailureInfo::new(error.failure_kind(), error.to_string())
    }
}

impl From<&StepError> for FailureInfo {
    fn from(error: &StepError) -> Self {
        FailureInfo::step(error.to_string())
    }
}
