//! Per-node-execution lock with bounded wait

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::core::error::{EngineError, Result};

/// Serializes work per id while letting different ids proceed in parallel
#[derive(Default)]
pub struct KeyedLock {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for the lock on `id`
    pub async fn acquire(&self, id: Uuid, wait: Duration) -> Result<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(id).or_default().clone();
        tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| {
                EngineError::Transport(format!(
                    "lock on node execution {} not acquired within {:?}",
                    id, wait
                ))
            })
    }

    /// Drop the lock entry for an id nobody holds any more
    pub fn release(&self, id: &Uuid) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
