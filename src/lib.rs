//! orchestrator - pipeline node-execution orchestration engine

pub mod advise;
pub mod cli;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod execution;
pub mod persistence;
pub mod step;

// Re-export commonly used types
pub use crate::advise::{AdviserDecision, AdviserSpec, DecisionInterceptor};
pub use crate::core::config::{OrchestratorConfig, PlanConfig, TransportKind};
pub use crate::core::{EngineError, NodeExecution, NodeStatus, PlanStatus, Result};
pub use crate::events::{HandlerMode, OrchestrationEvent, OrchestrationEventType};
pub use crate::execution::{Engine, EngineBuilder, PlanExecution};
pub use crate::step::{Step, StepContext, StepRegistry, StepType};
