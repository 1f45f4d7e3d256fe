//! Process-wide named locks.
//!
//! Maps string keys to async mutexes created on first use. Entries are never
//! evicted, so the registry grows with the number of clusters ever seen.
//! Locks are not reentrant: acquiring a key already held by the same task
//! deadlocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Registry of named mutual-exclusion locks.
#[derive(Clone, Default)]
pub struct NamedLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

/// Held lock. Dropping it releases the key.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NamedLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock explicitly.
    pub fn release(self) {}
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        // The map is only touched for O(1) lookups, so a poisoned guard still
        // holds a consistent map.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until the lock for `key` is held by the caller.
    pub async fn acquire(&self, key: &str) -> NamedLockGuard {
        let guard = self.entry(key).lock_owned().await;
        NamedLockGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock for `key` only if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<NamedLockGuard> {
        let guard = self.entry(key).try_lock_owned().ok()?;
        Some(NamedLockGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
