//! Named in-process locks with bounded waits.
//!
//! The in-process stand-in for a database advisory lock: one async mutex per
//! key, acquired with a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

/// A map of named async mutexes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a keyed lock is owned. Dropping it releases the lock.
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock named `key`, waiting at most `timeout`.
    ///
    /// Returns `None` if the wait timed out.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Option<KeyedGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on so the map stays bounded.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        tokio::time::timeout(timeout, lock.lock_owned())
            .await
            .ok()
            .map(|guard| KeyedGuard { _guard: guard })
    }
}
