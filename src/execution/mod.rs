//! Node execution: the orchestrator, its step workers and the engine facade

pub mod engine;
pub mod locks;
pub mod orchestrator;
pub mod timeout;
pub mod worker;

pub use engine::{Engine, EngineBuilder};
pub use orchestrator::{Orchestrator, PlanExecution};
pub use timeout::TimeoutSweeper;
pub use worker::{StepInvocation, WorkerJob, WorkerPool};
