//! Scenario-based tests for the orchestrator

mod async_waits;
mod child_failure;
mod plan_control;
mod registration;
mod replay;
mod retry_behavior;
mod sibling_completion;
mod task_results;
mod timeouts;
