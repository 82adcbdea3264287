//! Per-key async locks.
//!
//! [`KeyedLocks`] hands out one async mutex per string key, so unrelated
//! documents never wait on each other while two requests for the same
//! document run one after the other. Entries are pruned as soon as nobody
//! holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A set of lazily created async mutexes indexed by key.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::locks::KeyedLocks;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let locks = KeyedLocks::new();
/// {
///     let _guard = locks.lock("abc").await;
///     assert_eq!(locks.len(), 1);
/// }
/// assert!(locks.is_empty());
/// # });
/// ```
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Creates an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns `true` if no key is locked or awaited.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyedGuard<'a> {
    locks: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own handle left: nobody holds or waits on this key.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
