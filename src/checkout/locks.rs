//! Per-buyer serialization.
//!
//! One async mutex per `user_key`, created lazily and shared between the
//! checkout flow and the reminder scheduler: purchase start, settlement
//! finalize, and the fire-time validity check of a reminder all serialize on
//! the same lock, so the store and the scheduler can never disagree about
//! which order is current for a buyer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct UserLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding all session-mutating work for a buyer.
    pub fn for_user(&self, user_key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(user_key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drop lock entries nobody is holding or waiting on. Called after a
    /// session finalizes so the map stays bounded by concurrently active
    /// buyers.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub fn tracked_users(&self) -> usize {
        self.locks.lock().len()
    }
}
