//! Response events flowing into the orchestrator and lifecycle events flowing out

pub mod bus;
pub mod channel;
pub mod response;

pub use bus::{
    event_handler, EventHandler, HandlerMode, OrchestrationEvent, OrchestrationEventBus,
    OrchestrationEventBusBuilder, OrchestrationEventType,
};
pub use channel::{
    DirectResponseChannel, QueuedResponseChannel, ResponseEventChannel, ResponseEventHandler,
};
pub use response::{ResponseEvent, ResponseEventKind, ResponsePayload};
