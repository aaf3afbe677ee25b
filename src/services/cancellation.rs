//! Cancellation registry for grouping sweeps
//!
//! Sweeps check their token between groups; groups already committed stay
//! committed. The registry is owned by the handler state, there is no
//! process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// RAII guard that removes the sweep from the registry when dropped.
/// Must be kept alive for the duration of the sweep.
pub struct SweepGuard {
    sweep_id: Uuid,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl SweepGuard {
    pub fn sweep_id(&self) -> Uuid {
        self.sweep_id
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.sweep_id);
    }
}

/// Registry of running sweeps and their cancellation tokens
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    sweeps: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sweep. Dropping the returned guard unregisters it.
    pub fn register(&self, sweep_id: Uuid) -> SweepGuard {
        let token = CancellationToken::new();
        self.sweeps.lock().insert(sweep_id, token.clone());
        SweepGuard {
            sweep_id,
            token,
            registry: self.clone(),
        }
    }

    /// `true` when a running sweep was found and signalled
    pub fn cancel(&self, sweep_id: &Uuid) -> bool {
        match self.sweeps.lock().get(sweep_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every running sweep, used on shutdown
    pub fn cancel_all(&self) -> usize {
        let sweeps = self.sweeps.lock();
        for token in sweeps.values() {
            token.cancel();
        }
        sweeps.len()
    }

    pub fn running(&self) -> Vec<Uuid> {
        self.sweeps.lock().keys().copied().collect()
    }

    fn remove(&self, sweep_id: &Uuid) {
        self.sweeps.lock().remove(sweep_id);
    }
}
