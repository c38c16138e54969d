//! Per-key mutual exclusion.
//!
//! Writers to the same key serialize; writers to different keys never contend.
//! Entries are created on demand and pruned once nobody holds or awaits them.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub(crate) async fn lock(&self, key: &str) -> KeyGuard {
        // Get-or-insert happens under the shard lock, so two callers always
        // end up sharing the same mutex.
        let mutex = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let guard = mutex.lock_owned().await;

        KeyGuard {
            guard: Some(guard),
            key: key.to_string(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a live lock entry.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive access to one key, released on drop.
pub(crate) struct KeyGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map itself still references the mutex: nobody holds or waits on it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
