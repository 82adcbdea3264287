//! In-memory storage backend.
//!
//! [`InMemoryBackend`] provides a thread-safe [`StorageBackend`] implementation
//! using `DashMap<String, (Vec<u8>, u64)>`. It is a dumb KV store with no
//! domain logic and no durability; contents are lost when it is dropped.
//!
//! # Concurrency
//!
//! `DashMap` gives shard-level locking. [`put_if_version`](StorageBackend::put_if_version)
//! holds the shard entry for the whole compare-and-swap, so two writers can
//! never both succeed against the same version.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Thread-safe in-memory storage backend using [`DashMap`].
///
/// # Examples
///
/// ```
/// use doc_orchestrator::store::memory::InMemoryBackend;
/// use doc_orchestrator::store::TaskStore;
/// use std::sync::Arc;
///
/// let backend = Arc::new(InMemoryBackend::new());
/// let store = TaskStore::new(backend.clone(), "chunking_tasks");
/// assert!(backend.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, (Vec<u8>, u64)>,
}

impl InMemoryBackend {
    /// Creates an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys stored.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the backend contains no keys.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        let (data, version) = entry.value();
        Ok(VersionedRecord {
            data: data.clone(),
            version: *version,
        })
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let mut entry = self.data.entry(key.to_string()).or_insert((Vec::new(), 0));
        let new_version = entry.value().1 + 1;
        *entry.value_mut() = (data.to_vec(), new_version);
        Ok(new_version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current_version = occupied.get().1;
                if current_version != expected_version {
                    return Err(StorageError::VersionConflict {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: current_version,
                    });
                }
                let new_version = current_version + 1;
                occupied.insert((data.to_vec(), new_version));
                Ok(new_version)
            },
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(StorageError::VersionConflict {
                        key: key.to_string(),
                        expected: expected_version,
                        actual: 0,
                    });
                }
                vacant.insert((data.to_vec(), 1));
                Ok(1)
            },
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Basic KV behaviour ---

    #[tokio::test]
    async fn get_missing_key_is_not_found() {
        let backend = InMemoryBackend::new();
        let err = backend.get("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { key } if key == "nope"));
    }

    #[tokio::test]
    async fn put_increments_version() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put("k", b"a").await.unwrap(), 1);
        assert_eq!(backend.put("k", b"b").await.unwrap(), 2);
        let record = backend.get("k").await.unwrap();
        assert_eq!(record.data, b"b");
        assert_eq!(record.version, 2);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"a").await.unwrap();
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert!(backend.is_empty());
    }

    // --- Compare-and-swap ---

    #[tokio::test]
    async fn put_if_version_zero_creates_absent_key() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.put_if_version("k", b"a", 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn put_if_version_zero_conflicts_when_present() {
        let backend = InMemoryBackend::new();
        backend.put("k", b"a").await.unwrap();
        let err = backend.put_if_version("k", b"b", 0).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
        assert_eq!(backend.get("k").await.unwrap().data, b"a");
    }

    #[tokio::test]
    async fn put_if_version_conflicts_when_absent() {
        let backend = InMemoryBackend::new();
        let err = backend.put_if_version("k", b"b", 3).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::VersionConflict {
                expected: 3,
                actual: 0,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_version_loses() {
        let backend = InMemoryBackend::new();
        let v1 = backend.put("k", b"a").await.unwrap();
        let v2 = backend.put_if_version("k", b"b", v1).await.unwrap();
        assert_eq!(v2, 2);
        let err = backend.put_if_version("k", b"c", v1).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
        assert_eq!(backend.get("k").await.unwrap().data, b"b");
    }

    #[tokio::test]
    async fn concurrent_cas_has_exactly_one_winner() {
        let backend = std::sync::Arc::new(InMemoryBackend::new());
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.put_if_version("k", &[i], 0).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
