//! Per-key mutual exclusion.
//!
//! # Invariants
//! - At most one guard exists per key at any time within a `KeyedLocks`.
//! - The lock for a key is created under the map lock, so two first users
//!   of the same key always share one mutex.
//! - A key's entry is removed once no guard holds or waits on it.

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the critical section for `key` is free.
    pub fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(lock.lock_arc()),
        }
    }

    /// Number of keys with a live or waiting holder.
    pub fn active_keys(&self) -> usize {
        self.locks.lock().len()
    }
}

pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        // Release while holding the map lock so no new holder can clone the
        // entry between the release and the count check.
        drop(self.guard.take());
        let unused = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if unused {
            locks.remove(&self.key);
        }
    }
}
