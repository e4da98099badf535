//! Per-quote serialisation.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per quote. Work on different quotes never contends.
#[derive(Debug, Default)]
pub struct QuoteLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl QuoteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `quote_id`. Released when the guard drops.
    pub async fn acquire(&self, quote_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(quote_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget locks that nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
