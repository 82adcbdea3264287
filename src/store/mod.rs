//! Persistent task store and its storage backends.
//!
//! # Architecture
//!
//! Storage has two layers:
//!
//! 1. **[`TaskStore`]** -- owns one [`TaskCollection`] per job kind under a
//!    fixed key. All collection logic lives here: decoding, the atomic
//!    read-modify-write loop, and status transitions.
//!
//! 2. **[`StorageBackend`]** -- dumb KV trait that backends implement. No
//!    domain logic.
//!
//! # Backends
//!
//! - [`InMemoryBackend`](crate::store::memory::InMemoryBackend) -- `DashMap`
//!   backed, not durable. Used in tests.
//! - [`FileBackend`](crate::store::file::FileBackend) -- one file per key,
//!   atomic write-then-rename. Used by the host binary.
//!
//! # Read-modify-write
//!
//! Every write path goes through [`TaskStore::mutate`]. It serializes
//! writers in this process with an async mutex and commits with
//! [`StorageBackend::put_if_version`], re-reading and re-applying the
//! closure when another writer got there first. A closure that leaves the
//! collection unchanged causes no write at all.

pub mod backend;
pub mod file;
pub mod memory;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use backend::{StorageBackend, StorageError, VersionedRecord};

use crate::constants::MAX_CAS_ATTEMPTS;
use crate::domain::{TaskCollection, TaskRecord};
use crate::error::TaskError;
use crate::types::task::TaskStatus;

/// The persisted collection for one job kind.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use doc_orchestrator::domain::{DocumentLocator, TaskRecord};
/// use doc_orchestrator::store::{memory::InMemoryBackend, TaskStore};
/// use doc_orchestrator::TaskStatus;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let store = TaskStore::new(Arc::new(InMemoryBackend::new()), "toc_tasks");
/// let record = TaskRecord::new("abc", DocumentLocator::default());
/// let id = record.task_id.clone();
/// store.insert(record).await.unwrap();
///
/// let updated = store
///     .update_status(&id, TaskStatus::Processing, None)
///     .await
///     .unwrap()
///     .unwrap();
/// assert_eq!(updated.status, TaskStatus::Processing);
///
/// // Unknown ids are ignored.
/// assert!(store.update_status("nope", TaskStatus::Failed, None).await.unwrap().is_none());
/// # });
/// ```
pub struct TaskStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Creates a store for the collection under `key`.
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// The storage key of this collection.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The backend this store writes to.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    // ---- Serialization helpers (private) ----

    fn encode(&self, tasks: &TaskCollection) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(tasks).map_err(|e| {
            TaskError::Serialization(format!("failed to encode {}: {e}", self.key))
        })
    }

    fn decode(&self, data: &[u8]) -> Result<TaskCollection, TaskError> {
        serde_json::from_slice(data).map_err(|e| {
            TaskError::Serialization(format!("failed to decode {}: {e}", self.key))
        })
    }

    /// Loads the collection with its version; a never-written key is empty at version 0.
    async fn load_versioned(&self) -> Result<(TaskCollection, u64), TaskError> {
        match self.backend.get(&self.key).await {
            Ok(versioned) => Ok((self.decode(&versioned.data)?, versioned.version)),
            Err(StorageError::NotFound { .. }) => Ok((TaskCollection::new(), 0)),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the whole collection. A key that was never written yields an
    /// empty collection.
    ///
    /// # Errors
    ///
    /// [`TaskError::Store`] on backend failures, [`TaskError::Serialization`]
    /// if the stored blob cannot be decoded.
    pub async fn load(&self) -> Result<TaskCollection, TaskError> {
        Ok(self.load_versioned().await?.0)
    }

    /// Replaces the whole collection unconditionally.
    ///
    /// # Errors
    ///
    /// [`TaskError::Store`] on backend failures.
    pub async fn save(&self, tasks: &TaskCollection) -> Result<(), TaskError> {
        let bytes = self.encode(tasks)?;
        let _guard = self.write_lock.lock().await;
        self.backend.put(&self.key, &bytes).await?;
        Ok(())
    }

    /// Atomic read-modify-write of the collection.
    ///
    /// `f` may run more than once if another writer commits between the
    /// read and the compare-and-swap, so it must be a pure function of the
    /// collection it is handed. If `f` returns an error nothing is written.
    ///
    /// # Errors
    ///
    /// - Whatever `f` returns.
    /// - [`TaskError::ConcurrentModification`] after [`MAX_CAS_ATTEMPTS`]
    ///   lost races.
    /// - [`TaskError::Store`] / [`TaskError::Serialization`] as for
    ///   [`load`](Self::load).
    pub async fn mutate<F, R>(&self, mut f: F) -> Result<R, TaskError>
    where
        F: FnMut(&mut TaskCollection) -> Result<R, TaskError>,
    {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (original, version) = self.load_versioned().await?;
            let mut tasks = original.clone();
            let result = f(&mut tasks)?;

            if tasks == original {
                return Ok(result);
            }

            let bytes = self.encode(&tasks)?;
            match self.backend.put_if_version(&self.key, &bytes, version).await {
                Ok(_) => return Ok(result),
                Err(StorageError::VersionConflict {
                    expected, actual, ..
                }) => {
                    tracing::debug!(
                        key = %self.key,
                        attempt,
                        expected,
                        actual,
                        "collection changed during read-modify-write, retrying"
                    );
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(TaskError::ConcurrentModification {
            key: self.key.clone(),
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Looks up one record by task ID.
    pub async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.load().await?.get(task_id).cloned())
    }

    /// All records, in task-ID order.
    pub async fn list(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.load().await?.iter().cloned().collect())
    }

    /// Records in a non-terminal status, oldest first.
    pub async fn active(&self) -> Result<Vec<TaskRecord>, TaskError> {
        Ok(self.load().await?.active().into_iter().cloned().collect())
    }

    /// The record for a document, if any.
    pub async fn find_by_doc_hash(&self, doc_hash: &str) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.load().await?.find_by_doc_hash(doc_hash).cloned())
    }

    /// Inserts (or replaces) a record.
    pub async fn insert(&self, record: TaskRecord) -> Result<(), TaskError> {
        self.mutate(|tasks| {
            tasks.insert(record.clone());
            Ok(())
        })
        .await
    }

    /// Removes a record, returning it if it existed.
    pub async fn remove(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        self.mutate(|tasks| Ok(tasks.remove(task_id))).await
    }

    /// Transitions one record and persists it.
    ///
    /// Returns the updated record, or `None` if no record has this ID; an
    /// unknown ID leaves the collection untouched and is not an error.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] if the state machine forbids the move.
    /// - Storage errors as for [`mutate`](Self::mutate).
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Option<TaskRecord>, TaskError> {
        let updated = self
            .mutate(|tasks| {
                let Some(record) = tasks.get_mut(task_id) else {
                    return Ok(None);
                };
                record.apply_status(status, error.clone())?;
                Ok(Some(record.clone()))
            })
            .await?;

        if updated.is_none() {
            tracing::debug!(
                key = %self.key,
                task_id,
                %status,
                "status update for unknown task ignored"
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DocumentLocator;
    use crate::store::memory::InMemoryBackend;
    use async_trait::async_trait;

    fn test_store() -> TaskStore {
        TaskStore::new(Arc::new(InMemoryBackend::new()), "chunking_tasks")
    }

    // ---- Load / save ----

    #[tokio::test]
    async fn load_of_unwritten_key_is_empty() {
        let store = test_store();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = test_store();
        let record = TaskRecord::new("abc", DocumentLocator::default());
        let tasks: TaskCollection = std::iter::once(record.clone()).collect();
        store.save(&tasks).await.unwrap();
        assert_eq!(store.load().await.unwrap(), tasks);
        assert_eq!(store.get(&record.task_id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn undecodable_blob_is_serialization_error() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put("chunking_tasks", b"not json").await.unwrap();
        let store = TaskStore::new(backend, "chunking_tasks");
        assert!(matches!(
            store.load().await,
            Err(TaskError::Serialization(_))
        ));
    }

    // ---- Mutate ----

    #[tokio::test]
    async fn unchanged_mutation_does_not_write() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = TaskStore::new(backend.clone(), "chunking_tasks");
        store.mutate(|_| Ok(())).await.unwrap();
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn failed_closure_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = TaskStore::new(backend.clone(), "chunking_tasks");
        let result: Result<(), TaskError> = store
            .mutate(|tasks| {
                tasks.insert(TaskRecord::new("abc", DocumentLocator::default()));
                Err(TaskError::InvalidRequest("nope".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn update_status_unknown_id_is_noop() {
        let store = test_store();
        store
            .insert(TaskRecord::new("abc", DocumentLocator::default()))
            .await
            .unwrap();
        let before = store.load().await.unwrap();
        let result = store
            .update_status("missing", TaskStatus::Completed, None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.load().await.unwrap(), before);
    }

    #[tokio::test]
    async fn update_status_rejects_terminal_transition() {
        let store = test_store();
        let record = TaskRecord::new("abc", DocumentLocator::default());
        let id = record.task_id.clone();
        store.insert(record).await.unwrap();
        store
            .update_status(&id, TaskStatus::Failed, Some("x".to_string()))
            .await
            .unwrap();
        let err = store
            .update_status(&id, TaskStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn remove_returns_removed_record() {
        let store = test_store();
        let record = TaskRecord::new("abc", DocumentLocator::default());
        let id = record.task_id.clone();
        store.insert(record).await.unwrap();
        assert!(store.remove(&id).await.unwrap().is_some());
        assert!(store.remove(&id).await.unwrap().is_none());
        assert!(store.find_by_doc_hash("abc").await.unwrap().is_none());
    }

    // ---- CAS conflict ----

    /// Backend wrapper whose first `conflicts` CAS writes lose to a phantom writer.
    struct FlakyCasBackend {
        inner: InMemoryBackend,
        conflicts: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl StorageBackend for FlakyCasBackend {
        async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
            self.inner.put(key, data).await
        }
        async fn put_if_version(
            &self,
            key: &str,
            data: &[u8],
            expected_version: u64,
        ) -> Result<u64, StorageError> {
            use std::sync::atomic::Ordering;
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            self.inner.put_if_version(key, data, expected_version).await
        }
        async fn delete(&self, key: &str) -> Result<bool, StorageError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn mutate_retries_after_conflict() {
        let backend = Arc::new(FlakyCasBackend {
            inner: InMemoryBackend::new(),
            conflicts: 2.into(),
        });
        let store = TaskStore::new(backend, "toc_tasks");
        let mut calls = 0;
        store
            .mutate(|tasks| {
                calls += 1;
                tasks.insert(TaskRecord::new("abc", DocumentLocator::default()));
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls, 3);
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mutate_gives_up_after_bounded_attempts() {
        let backend = Arc::new(FlakyCasBackend {
            inner: InMemoryBackend::new(),
            conflicts: u32::MAX.into(),
        });
        let store = TaskStore::new(backend, "toc_tasks");
        let err = store
            .insert(TaskRecord::new("abc", DocumentLocator::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::ConcurrentModification { attempts, .. } if attempts == MAX_CAS_ATTEMPTS
        ));
    }
}
