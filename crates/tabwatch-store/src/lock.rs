use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

struct LockEntry {
    mutex: Mutex<()>,
    /// Callers holding or waiting on this entry.
    holders: AtomicUsize,
}

/// Per-key async mutual exclusion.
///
/// Waiters on a key are served in arrival order. An entry lives only while at
/// least one caller holds or waits on it, so the map stays bounded by the
/// number of keys under contention.
pub struct KeyLockManager<K: Eq + Hash + Clone> {
    locks: DashMap<K, Arc<LockEntry>>,
}

impl<K: Eq + Hash + Clone> Default for KeyLockManager<K> {
    fn default() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }
}

/// Releases the caller's claim on the entry, removing it when it was the last.
struct Release<'a, K: Eq + Hash + Clone> {
    locks: &'a DashMap<K, Arc<LockEntry>>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for Release<'_, K> {
    fn drop(&mut self) {
        let _ = self
            .locks
            .remove_if(&self.key, |_, entry| entry.holders.fetch_sub(1, Ordering::AcqRel) == 1);
    }
}

impl<K: Eq + Hash + Clone> KeyLockManager<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to `key`. The lock is released when `f`
    /// completes, fails, or is cancelled.
    pub async fn with_lock<T, F, Fut>(&self, key: &K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = {
            let slot = self.locks.entry(key.clone()).or_insert_with(|| {
                Arc::new(LockEntry {
                    mutex: Mutex::new(()),
                    holders: AtomicUsize::new(0),
                })
            });
            slot.holders.fetch_add(1, Ordering::AcqRel);
            Arc::clone(slot.value())
        };
        let _release = Release {
            locks: &self.locks,
            key: key.clone(),
        };

        let _guard = entry.mutex.lock().await;
        f().await
    }

    /// Keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
