//! Periodic deadline sweep over waiting node executions

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::execution::orchestrator::Orchestrator;

/// Fails TASK_WAITING and ASYNC_WAITING nodes whose deadline has passed
/// and prunes runs past the retention window
pub struct TimeoutSweeper {
    orchestrator: Weak<Orchestrator>,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(orchestrator: Weak<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run until the orchestrator is dropped
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(orchestrator) = self.orchestrator.upgrade() else {
                    debug!("Orchestrator dropped, stopping timeout sweeper");
                    break;
                };
                match orchestrator.expire_overdue().await {
                    Ok(0) => {}
                    Ok(expired) => info!(expired, "Expired overdue waits"),
                    Err(e) => warn!("Timeout sweep failed: {}", e),
                }
                orchestrator.prune_finished();
            }
        })
    }
}
