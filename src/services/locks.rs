//! Keyed async locks serializing batch mutations inside one process
//!
//! Keys are always acquired in sorted order so two operations over
//! overlapping key sets cannot deadlock. Cross-process safety comes from the
//! store's conditional writes; these locks only cut down on lost races.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Batch(Uuid),
    Driver(Uuid),
    Order(Uuid),
}

type LockMap = HashMap<LockKey, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// Held keys; released on drop
pub struct LockSet {
    guards: Vec<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.guards.clear();
        // Forget locks nobody holds or waits for
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, keys: impl IntoIterator<Item = LockKey>) -> LockSet {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let lock = self.locks.lock().entry(key).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        LockSet {
            guards,
            locks: Arc::clone(&self.locks),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
