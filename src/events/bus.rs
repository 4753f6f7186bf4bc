//! Orchestration event bus
//!
//! Lifecycle notifications fan out to handlers registered per event type.
//! The handler map is fixed when the bus is built. Sync handlers run inline
//! before `publish` returns; async handlers run on the tokio runtime. Handler
//! errors and panics are logged and never reach the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::{
    error::FailureInfo,
    state::{NodeStatus, PlanStatus},
};
use crate::step::StepType;

/// Lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    PlanStarted {
        plan_execution_id: Uuid,
        plan_id: String,
        at: DateTime<Utc>,
    },
    NodeStarted {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        plan_node_id: String,
        step_type: StepType,
        parent_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    NodeStatusUpdate {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        plan_node_id: String,
        from: NodeStatus,
        to: NodeStatus,
        at: DateTime<Utc>,
    },
    NodeEnded {
        plan_execution_id: Uuid,
        node_execution_id: Uuid,
        plan_node_id: String,
        parent_id: Option<Uuid>,
        status: NodeStatus,
        failure: Option<FailureInfo>,
        at: DateTime<Utc>,
    },
    PlanEnded {
        plan_execution_id: Uuid,
        status: PlanStatus,
        at: DateTime<Utc>,
    },
}

/// Key handlers are registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationEventType {
    PlanStarted,
    NodeStarted,
    NodeStatusUpdate,
    NodeEnded,
    PlanEnded,
}

impl OrchestrationEventType {
    pub const ALL: [OrchestrationEventType; 5] = [
        OrchestrationEventType::PlanStarted,
        OrchestrationEventType::NodeStarted,
        OrchestrationEventType::NodeStatusUpdate,
        OrchestrationEventType::NodeEnded,
        OrchestrationEventType::PlanEnded,
    ];
}

impl fmt::Display for OrchestrationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestrationEventType::PlanStarted => "plan_started",
            OrchestrationEventType::NodeStarted => "node_started",
            OrchestrationEventType::NodeStatusUpdate => "node_status_update",
            OrchestrationEventType::NodeEnded => "node_ended",
            OrchestrationEventType::PlanEnded => "plan_ended",
        };
        f.write_str(name)
    }
}

impl OrchestrationEvent {
    pub fn event_type(&self) -> OrchestrationEventType {
        match self {
            OrchestrationEvent::PlanStarted { .. } => OrchestrationEventType::PlanStarted,
            OrchestrationEvent::NodeStarted { .. } => OrchestrationEventType::NodeStarted,
            OrchestrationEvent::NodeStatusUpdate { .. } => OrchestrationEventType::NodeStatusUpdate,
            OrchestrationEvent::NodeEnded { .. } => OrchestrationEventType::NodeEnded,
            OrchestrationEvent::PlanEnded { .. } => OrchestrationEventType::PlanEnded,
        }
    }

    pub fn plan_execution_id(&self) -> Uuid {
        match self {
            OrchestrationEvent::PlanStarted { plan_execution_id, .. }
            | OrchestrationEvent::NodeStarted { plan_execution_id, .. }
            | OrchestrationEvent::NodeStatusUpdate { plan_execution_id, .. }
            | OrchestrationEvent::NodeEnded { plan_execution_id, .. }
            | OrchestrationEvent::PlanEnded { plan_execution_id, .. } => *plan_execution_id,
        }
    }
}

/// Where a handler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// Inline, before `publish` returns
    Sync,
    /// Spawned on the runtime
    Async,
}

/// Handler closure
pub type EventHandler = Arc<dyn Fn(&OrchestrationEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as an [`EventHandler`]
pub fn event_handler<F>(handler: F) -> EventHandler
where
    F: Fn(&OrchestrationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

#[derive(Clone)]
struct RegisteredHandler {
    name: String,
    mode: HandlerMode,
    handler: EventHandler,
}

/// Immutable map from event type to its ordered handlers
#[derive(Clone, Default)]
pub struct OrchestrationEventBus {
    handlers: HashMap<OrchestrationEventType, Vec<RegisteredHandler>>,
}

/// Collects handlers before the bus is frozen
#[derive(Default)]
pub struct OrchestrationEventBusBuilder {
    handlers: HashMap<OrchestrationEventType, Vec<RegisteredHandler>>,
}

impl OrchestrationEventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event type; handlers run in registration order
    pub fn register_handler(
        mut self,
        event_type: OrchestrationEventType,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: EventHandler,
    ) -> Self {
        self.handlers
            .entry(event_type)
            .or_default()
            .push(RegisteredHandler {
                name: name.into(),
                mode,
                handler,
            });
        self
    }

    /// Register the same handler for every event type
    pub fn register_for_all(
        mut self,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: EventHandler,
    ) -> Self {
        let name = name.into();
        for event_type in OrchestrationEventType::ALL {
            self = self.register_handler(event_type, name.clone(), mode, handler.clone());
        }
        self
    }

    pub fn build(self) -> OrchestrationEventBus {
        OrchestrationEventBus {
            handlers: self.handlers,
        }
    }
}

impl OrchestrationEventBus {
    pub fn builder() -> OrchestrationEventBusBuilder {
        OrchestrationEventBusBuilder::new()
    }

    pub fn handler_count(&self, event_type: OrchestrationEventType) -> usize {
        self.handlers.get(&event_type).map_or(0, Vec::len)
    }

    /// Publish an event; never fails
    pub fn publish(&self, event: &OrchestrationEvent) {
        let event_type = event.event_type();
        let Some(handlers) = self.handlers.get(&event_type) else {
            return;
        };

        debug!(event = %event_type, handlers = handlers.len(), "Publishing orchestration event");

        for registered in handlers {
            match registered.mode {
                HandlerMode::Sync => run_handler(registered, event),
                HandlerMode::Async => match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        let registered = registered.clone();
                        let event = event.clone();
                        runtime.spawn(async move { run_handler(&registered, &event) });
                    }
                    Err(_) => {
                        warn!(
                            handler = %registered.name,
                            "No runtime for async handler, running inline"
                        );
                        run_handler(registered, event);
                    }
                },
            }
        }
    }
}

fn run_handler(registered: &RegisteredHandler, event: &OrchestrationEvent) {
    match catch_unwind(AssertUnwindSafe(|| (registered.handler)(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                handler = %registered.name,
                event = %event.event_type(),
                "Event handler failed: {:#}",
                e
            );
        }
        Err(_) => {
            error!(
                handler = %registered.name,
                event = %event.event_type(),
                "Event handler panicked"
            );
        }
    }
}
