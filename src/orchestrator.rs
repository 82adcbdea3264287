//! The task orchestrator: dedup decisions, delegation, status transitions,
//! and the startup recovery sweep for one job kind.
//!
//! # Lifecycle
//!
//! ```text
//! create_task ──► pending ──► processing ──► completed
//!                    │            │
//!                    └────────────┴───────► failed
//! ```
//!
//! [`TaskOrchestrator::create_task`] returns as soon as the `pending`
//! record is persisted. Delegation runs as a detached task that moves the
//! record to `processing`, waits for the execution context, and records
//! the outcome. Callers observe progress through the stored status, or
//! through [`subscribe`](TaskOrchestrator::subscribe) /
//! [`wait_for_terminal`](TaskOrchestrator::wait_for_terminal).
//!
//! # Dedup
//!
//! At most one record per document exists per job kind. A second request
//! for a document returns the existing task ID while the record is active,
//! or while it is `completed` and its artifacts still verify. A `failed`
//! record, or a `completed` one whose artifacts are gone, is replaced.
//! Requests for the same document are serialized by a per-document lock, so
//! the check and the insert are atomic with respect to each other. An active
//! record that nothing in this process is delegating (its outcome write was
//! lost, or the sweep has not run yet) is delegated again on the next request.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::{broadcast, Notify};

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::delegation::DelegationChannel;
use crate::domain::{DocumentLocator, TaskRecord};
use crate::error::TaskError;
use crate::locks::KeyedLocks;
use crate::store::{StorageBackend, TaskStore};
use crate::types::kind::JobKind;
use crate::types::task::TaskStatus;

/// Tunables for a [`TaskOrchestrator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Delegation attempts allowed per record before the recovery sweep
    /// gives up on it. `None` retries forever.
    pub max_attempts: Option<u32>,
}

/// A status transition that was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    /// Job kind of the record.
    pub kind: JobKind,
    /// The record as stored after the transition.
    pub record: TaskRecord,
}

struct Inner {
    kind: JobKind,
    store: TaskStore,
    channel: Arc<DelegationChannel>,
    config: OrchestratorConfig,
    doc_locks: KeyedLocks,
    in_flight: DashSet<String>,
    idle: Notify,
    events: broadcast::Sender<TaskEvent>,
}

/// Removes a task from the in-flight set when its delegation ends, however it ends.
struct InFlightGuard {
    inner: Arc<Inner>,
    task_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.task_id);
        if self.inner.in_flight.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Orchestrates document-processing tasks of one [`JobKind`].
///
/// Cheap to clone; clones share the same store, channel, and in-flight
/// state.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use doc_orchestrator::delegation::{ContextSpec, DelegationChannel, ProcessContext};
/// use doc_orchestrator::domain::DocumentLocator;
/// use doc_orchestrator::orchestrator::{OrchestratorConfig, TaskOrchestrator};
/// use doc_orchestrator::store::memory::InMemoryBackend;
/// use doc_orchestrator::JobKind;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let channel = Arc::new(DelegationChannel::new(
///     Arc::new(ProcessContext::new("doc-worker", Vec::new())),
///     ContextSpec::default(),
///     Duration::from_secs(300),
/// ));
/// let toc = TaskOrchestrator::new(
///     JobKind::Toc,
///     Arc::new(InMemoryBackend::new()),
///     channel,
///     OrchestratorConfig::default(),
/// );
///
/// let task_id = toc
///     .create_task("abc", DocumentLocator::url("https://example.com/a.pdf"))
///     .await
///     .unwrap();
/// let record = toc.wait_for_terminal(&task_id, Duration::from_secs(300)).await.unwrap();
/// # });
/// ```
#[derive(Clone)]
pub struct TaskOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("kind", &self.inner.kind)
            .field("store", &self.inner.store)
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl TaskOrchestrator {
    /// Creates an orchestrator storing its collection in `backend` under
    /// the kind's storage key.
    pub fn new(
        kind: JobKind,
        backend: Arc<dyn StorageBackend>,
        channel: Arc<DelegationChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                kind,
                store: TaskStore::new(backend, kind.storage_key()),
                channel,
                config,
                doc_locks: KeyedLocks::new(),
                in_flight: DashSet::new(),
                idle: Notify::new(),
                events,
            }),
        }
    }

    /// The job kind this orchestrator handles.
    pub fn kind(&self) -> JobKind {
        self.inner.kind
    }

    /// The underlying task store.
    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    /// Returns the task ID that will produce (or has produced) the
    /// artifacts for `doc_hash`, starting new work only when needed.
    ///
    /// Returns immediately after the record is persisted; delegation
    /// continues in the background.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidRequest`] if `doc_hash` is blank.
    /// - Store errors from reading or writing the collection. Nothing that
    ///   happens during delegation is reported here.
    pub async fn create_task(
        &self,
        doc_hash: &str,
        locator: DocumentLocator,
    ) -> Result<String, TaskError> {
        if doc_hash.trim().is_empty() {
            return Err(TaskError::InvalidRequest(
                "docHash must not be empty".to_string(),
            ));
        }
        let kind = self.inner.kind;

        let guard = self.inner.doc_locks.lock(doc_hash).await;

        let stale = match self.inner.store.find_by_doc_hash(doc_hash).await? {
            None => None,
            Some(existing) => match existing.status {
                TaskStatus::Pending | TaskStatus::Processing => {
                    tracing::debug!(
                        %kind,
                        doc_hash,
                        task_id = %existing.task_id,
                        status = %existing.status,
                        "task already active, reusing"
                    );
                    let task_id = existing.task_id.clone();
                    // Active but nothing running it: a lost outcome write,
                    // or a record left over from before the sweep.
                    if !self.inner.in_flight.contains(&task_id)
                        && self.spawn_delegation(existing)
                    {
                        tracing::info!(
                            %kind,
                            doc_hash,
                            task_id = %task_id,
                            "re-delegating orphaned task"
                        );
                    }
                    return Ok(task_id);
                },
                TaskStatus::Completed => {
                    if self.artifacts_present(doc_hash).await {
                        tracing::debug!(
                            %kind,
                            doc_hash,
                            task_id = %existing.task_id,
                            "completed task verified, reusing"
                        );
                        return Ok(existing.task_id);
                    }
                    tracing::info!(
                        %kind,
                        doc_hash,
                        task_id = %existing.task_id,
                        "artifacts missing for completed task, recreating"
                    );
                    Some(existing.task_id)
                },
                TaskStatus::Failed => {
                    tracing::info!(
                        %kind,
                        doc_hash,
                        task_id = %existing.task_id,
                        "previous task failed, recreating"
                    );
                    Some(existing.task_id)
                },
            },
        };

        let record = TaskRecord::new(doc_hash, locator);
        self.inner
            .store
            .mutate(|tasks| {
                if let Some(stale_id) = stale.as_deref() {
                    tasks.remove(stale_id);
                }
                tasks.insert(record.clone());
                Ok(())
            })
            .await?;

        tracing::info!(%kind, doc_hash, task_id = %record.task_id, "task created");
        let task_id = record.task_id.clone();
        // Registered as in flight before the next request for this document
        // can look at it.
        self.spawn_delegation(record);
        drop(guard);
        Ok(task_id)
    }

    /// Asks the verification collaborator about `doc_hash`. An error counts
    /// as "absent" so the work is redone rather than trusted blindly.
    async fn artifacts_present(&self, doc_hash: &str) -> bool {
        match self.inner.channel.verify(self.inner.kind, doc_hash).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(
                    kind = %self.inner.kind,
                    doc_hash,
                    error = %e,
                    "artifact verification failed, treating as absent"
                );
                false
            },
        }
    }

    /// Moves a task to `status` and persists it.
    ///
    /// Returns the updated record, or `None` when no task has this ID (not
    /// an error; the collection is left as it was). Successful transitions
    /// are broadcast to [`subscribe`](Self::subscribe) receivers.
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] if the record is terminal or the
    ///   move is otherwise not allowed.
    /// - Store errors.
    pub async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<Option<TaskRecord>, TaskError> {
        let updated = self
            .inner
            .store
            .update_status(task_id, status, error)
            .await?;
        if let Some(record) = &updated {
            tracing::info!(
                kind = %self.inner.kind,
                task_id,
                doc_hash = %record.doc_hash,
                %status,
                "task status updated"
            );
            // No subscribers is fine.
            let _ = self.inner.events.send(TaskEvent {
                kind: self.inner.kind,
                record: record.clone(),
            });
        }
        Ok(updated)
    }

    /// Looks up a task by ID.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        self.inner.store.get(task_id).await
    }

    /// All tasks of this kind.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list(&self) -> Result<Vec<TaskRecord>, TaskError> {
        self.inner.store.list().await
    }

    /// Re-delegates every `pending` or `processing` task, oldest first.
    ///
    /// Meant to run once at host startup: work interrupted by a previous
    /// shutdown is picked up again without going through the dedup logic.
    /// Records that already used up [`OrchestratorConfig::max_attempts`]
    /// are failed instead. Returns the IDs that were re-delegated.
    ///
    /// # Errors
    ///
    /// Store errors while reading the collection.
    pub async fn resume_pending(&self) -> Result<Vec<String>, TaskError> {
        let kind = self.inner.kind;
        let active = self.inner.store.active().await?;
        let mut resumed = Vec::with_capacity(active.len());

        for record in active {
            if let Some(max) = self.inner.config.max_attempts {
                if record.attempts >= max {
                    tracing::warn!(
                        %kind,
                        task_id = %record.task_id,
                        attempts = record.attempts,
                        "retry budget exhausted, failing task"
                    );
                    let message = format!("retry budget exhausted after {} attempts", record.attempts);
                    if let Err(e) = self
                        .update_status(&record.task_id, TaskStatus::Failed, Some(message))
                        .await
                    {
                        tracing::warn!(%kind, task_id = %record.task_id, error = %e, "could not fail task");
                    }
                    continue;
                }
            }

            let task_id = record.task_id.clone();
            if self.spawn_delegation(record) {
                resumed.push(task_id);
            }
        }

        tracing::info!(%kind, resumed = resumed.len(), "recovery sweep finished");
        Ok(resumed)
    }

    /// Starts a detached delegation unless one is already running for this task.
    fn spawn_delegation(&self, record: TaskRecord) -> bool {
        if !self.inner.in_flight.insert(record.task_id.clone()) {
            tracing::debug!(
                kind = %self.inner.kind,
                task_id = %record.task_id,
                "delegation already in flight"
            );
            return false;
        }
        let guard = InFlightGuard {
            inner: self.inner.clone(),
            task_id: record.task_id.clone(),
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            this.delegate(record).await;
        });
        true
    }

    /// Runs one delegation to completion and records the outcome.
    async fn delegate(&self, record: TaskRecord) {
        let kind = self.inner.kind;
        let task_id = record.task_id.as_str();

        match self.update_status(task_id, TaskStatus::Processing, None).await {
            Ok(Some(_)) => {},
            Ok(None) => {
                tracing::debug!(%kind, task_id, "task vanished before delegation");
                return;
            },
            Err(e) => {
                tracing::warn!(%kind, task_id, error = %e, "could not start delegation");
                return;
            },
        }

        let (status, error) = match self.inner.channel.process(kind, &record).await {
            Ok(response) => {
                tracing::debug!(
                    %kind,
                    task_id,
                    result_fields = response.result.len(),
                    "execution context reported success"
                );
                (TaskStatus::Completed, None)
            },
            Err(e) => {
                tracing::warn!(%kind, task_id, error = %e, "delegation failed");
                (TaskStatus::Failed, Some(e.to_string()))
            },
        };

        if let Err(e) = self.update_status(task_id, status, error).await {
            tracing::warn!(%kind, task_id, %status, error = %e, "could not record delegation outcome");
        }
    }

    /// Subscribes to persisted status transitions of this kind.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until `task_id` reaches a terminal status or `timeout`
    /// elapses, then returns the latest stored record (`None` if the task
    /// does not exist).
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn wait_for_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskRecord>, TaskError> {
        let mut events = self.subscribe();
        match self.get_task(task_id).await? {
            None => return Ok(None),
            Some(record) if record.status.is_terminal() => return Ok(Some(record)),
            Some(_) => {},
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.record.task_id == task_id => {
                        if event.record.status.is_terminal() {
                            return;
                        }
                    },
                    Ok(_) => {},
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Ok(Some(record)) = self.get_task(task_id).await {
                            if record.status.is_terminal() {
                                return;
                            }
                        }
                    },
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;
        self.get_task(task_id).await
    }

    /// Number of delegations currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Waits until no delegation is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
