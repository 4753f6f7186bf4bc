//! Core domain models for the orchestrator
//!
//! This module defines plans, node executions, their lifecycle states,
//! step outcomes and the engine's error taxonomy.

pub mod ambiance;
pub mod config;
pub mod error;
pub mod node_execution;
pub mod plan;
pub mod response;
pub mod state;

pub use ambiance::*;
pub use error::*;
pub use node_execution::*;
pub use plan::*;
pub use response::*;
pub use state::*;
