//! Per-key mutual exclusion.
//!
//! Turns for the same scope key must never overlap: loading, handling and
//! persisting a scope is not atomic against the store. Distinct keys never
//! contend. Waiters are served in the order they started waiting.

use palaver_core::ScopeKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

/// A set of locks, one per scope key, created on demand.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<ScopeKey, Slot>>,
}

impl KeyedLocks {
    /// Creates an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to a key.
    pub async fn lock(&self, key: ScopeKey) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let guard = Arc::clone(&slot).lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            slot,
            guard: Some(guard),
        }
    }

    /// Returns the number of keys currently locked or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true if no key is locked or waited on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &ScopeKey, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map and one held by the releasing guard.
        if Arc::strong_count(slot) == 2 {
            slots.remove(key);
        }
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyedLocks,
    key: ScopeKey,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyGuard<'_> {
    /// Returns the locked key.
    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // The owned guard holds its own reference to the slot; drop it first.
        self.guard.take();
        self.locks.release(&self.key, &self.slot);
    }
}
