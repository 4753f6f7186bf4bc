//! Transports carrying response events to the orchestrator
//!
//! Two adapters sit behind [`ResponseEventChannel`]:
//!
//! - [`QueuedResponseChannel`]: partitioned publish-and-forget queue. Events for one
//!   node execution always land on the same partition, so they are applied in the
//!   order they were sent. This is the default transport.
//! - [`DirectResponseChannel`]: calls straight into the orchestrator and returns
//!   once the event has been applied.
//!
//! Both use the same delivery loop, so the orchestrator sees identical traffic.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::config::OrchestratorConfig;
use crate::core::error::{EngineError, Result};
use crate::events::response::ResponseEvent;

/// Orchestrator side of the channel
#[async_trait]
pub trait ResponseEventHandler: Send + Sync {
    /// Apply one event; retryable errors are redelivered
    async fn apply(&self, event: ResponseEvent) -> Result<()>;

    /// Called once delivery has been given up on
    async fn undeliverable(&self, event: ResponseEvent, error: EngineError);
}

/// Worker side of the channel
#[async_trait]
pub trait ResponseEventChannel: Send + Sync {
    async fn send(&self, event: ResponseEvent) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Redelivery policy shared by both transports
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&OrchestratorConfig> for DeliveryPolicy {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts.max(1),
            backoff: config.delivery_backoff,
        }
    }
}

/// Apply `event`, redelivering on retryable errors with linear backoff
async fn deliver(handler: &dyn ResponseEventHandler, event: ResponseEvent, policy: DeliveryPolicy) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match handler.apply(event.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    node_execution_id = %event.node_execution_id,
                    kind = %event.kind(),
                    sequence = event.sequence,
                    attempt,
                    "Redelivering response event: {}",
                    e
                );
                tokio::time::sleep(policy.backoff * attempt).await;
            }
            Err(e) => {
                error!(
                    node_execution_id = %event.node_execution_id,
                    kind = %event.kind(),
                    sequence = event.sequence,
                    attempt,
                    "Giving up on response event: {}",
                    e
                );
                let error = if e.is_retryable() {
                    EngineError::Transport(format!(
                        "event {} undeliverable after {} attempts: {}",
                        event.kind(),
                        attempt,
                        e
                    ))
                } else {
                    e
                };
                handler.undeliverable(event, error).await;
                return;
            }
        }
    }
}

/// Partitioned in-process queue
pub struct QueuedResponseChannel {
    partitions: Vec<mpsc::UnboundedSender<ResponseEvent>>,
}

impl QueuedResponseChannel {
    /// Spawn one consumer per partition; must be called inside a tokio runtime
    pub fn start(handler: Weak<dyn ResponseEventHandler>, config: &OrchestratorConfig) -> Self {
        let policy = DeliveryPolicy::from(config);
        let partitions = (0..config.partitions.max(1))
            .map(|partition| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(consume(partition, rx, handler.clone(), policy));
                tx
            })
            .collect();
        Self { partitions }
    }

    /// Partition that owns a node execution
    pub fn partition_for(&self, node_execution_id: &Uuid) -> usize {
        let mut hasher = DefaultHasher::new();
        node_execution_id.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

async fn consume(
    partition: usize,
    mut rx: mpsc::UnboundedReceiver<ResponseEvent>,
    handler: Weak<dyn ResponseEventHandler>,
    policy: DeliveryPolicy,
) {
    debug!(partition, "Response event consumer started");
    while let Some(event) = rx.recv().await {
        let Some(handler) = handler.upgrade() else {
            debug!(partition, "Orchestrator dropped, stopping consumer");
            break;
        };
        deliver(handler.as_ref(), event, policy).await;
    }
    debug!(partition, "Response event consumer stopped");
}

#[async_trait]
impl ResponseEventChannel for QueuedResponseChannel {
    async fn send(&self, event: ResponseEvent) -> Result<()> {
        let partition = self.partition_for(&event.node_execution_id);
        self.partitions[partition]
            .send(event)
            .map_err(|e| EngineError::Transport(format!("partition {} closed: {}", partition, e)))
    }

    fn name(&self) -> &'static str {
        "queued"
    }
}

/// Blocking call path: `send` returns after the orchestrator applied the event
pub struct DirectResponseChannel {
    handler: Weak<dyn ResponseEventHandler>,
    policy: DeliveryPolicy,
}

impl DirectResponseChannel {
    pub fn new(handler: Weak<dyn ResponseEventHandler>, config: &OrchestratorConfig) -> Self {
        Self {
            handler,
            policy: DeliveryPolicy::from(config),
        }
    }
}

#[async_trait]
impl ResponseEventChannel for DirectResponseChannel {
    async fn send(&self, event: ResponseEvent) -> Result<()> {
        let handler = self
            .handler
            .upgrade()
            .ok_or_else(|| EngineError::Transport("orchestrator is gone".to_string()))?;
        deliver(handler.as_ref(), event, self.policy).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
