//! Shared fixtures: a scripted execution context and orchestrator builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use doc_orchestrator::delegation::{ContextSpec, DelegationChannel, ExecutionContext};
use doc_orchestrator::store::memory::InMemoryBackend;
use doc_orchestrator::store::{StorageBackend, StorageError, VersionedRecord};
use doc_orchestrator::types::TaggedMessage;
use doc_orchestrator::{DelegationError, JobKind, OrchestratorConfig, TaskOrchestrator, TaskRouter};

/// Execution context whose answers are scripted by the test.
///
/// `PROCESS_*` requests get `process_reply`; when gated they wait for
/// [`release`](Self::release) first. `VERIFY_*` requests get
/// `verify_reply`, or a transport error when `verify_fails` is set.
pub struct ScriptedContext {
    running: AtomicBool,
    pub creates: AtomicUsize,
    pub process_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub sent: Mutex<Vec<TaggedMessage>>,
    pub process_reply: Mutex<Value>,
    pub verify_reply: Mutex<Value>,
    pub verify_fails: AtomicBool,
    gate: Option<Semaphore>,
}

impl ScriptedContext {
    /// Answers everything immediately with success.
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            process_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            process_reply: Mutex::new(json!({"success": true})),
            verify_reply: Mutex::new(json!({"exists": true})),
            verify_fails: AtomicBool::new(false),
            gate: None,
        }
    }

    /// Holds every `PROCESS_*` request until [`release`](Self::release).
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    /// Lets `n` held `PROCESS_*` requests answer.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn set_process_reply(&self, reply: Value) {
        *self.process_reply.lock().unwrap() = reply;
    }

    pub fn set_verify_reply(&self, reply: Value) {
        *self.verify_reply.lock().unwrap() = reply;
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// Payloads of all `PROCESS_*` messages sent so far.
    pub fn process_payloads(&self) -> Vec<(String, Value)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.message_type.starts_with("PROCESS_"))
            .map(|m| (m.message_type.clone(), m.payload.clone()))
            .collect()
    }
}

#[async_trait]
impl ExecutionContext for ScriptedContext {
    async fn exists(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn create(&self, _spec: &ContextSpec) -> Result<(), DelegationError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: TaggedMessage) -> Result<Value, DelegationError> {
        let message_type = message.message_type.clone();
        self.sent.lock().unwrap().push(message);

        if message_type.starts_with("VERIFY_") {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            if self.verify_fails.load(Ordering::SeqCst) {
                return Err(DelegationError::Transport("verify unreachable".to_string()));
            }
            return Ok(self.verify_reply.lock().unwrap().clone());
        }

        self.process_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| DelegationError::ContextClosed)?
                .forget();
        }
        Ok(self.process_reply.lock().unwrap().clone())
    }
}

/// In-memory backend whose writes fail while [`failing`](Self::failing) is set.
#[derive(Default)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    pub failing: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend {
                message: "transient".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.put(key, data).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        self.check()?;
        self.inner.put_if_version(key, data, expected_version).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// Channel over `context` with the given round-trip bound.
pub fn channel(context: Arc<ScriptedContext>, timeout: Duration) -> Arc<DelegationChannel> {
    Arc::new(DelegationChannel::new(context, ContextSpec::default(), timeout))
}

/// Orchestrator of `kind` over `backend`, default config, 5s timeout.
pub fn orchestrator_on(
    kind: JobKind,
    backend: Arc<dyn StorageBackend>,
    context: Arc<ScriptedContext>,
) -> TaskOrchestrator {
    TaskOrchestrator::new(
        kind,
        backend,
        channel(context, Duration::from_secs(5)),
        OrchestratorConfig::default(),
    )
}

/// Orchestrator of `kind` on a fresh in-memory backend.
pub fn orchestrator(kind: JobKind, context: Arc<ScriptedContext>) -> TaskOrchestrator {
    orchestrator_on(kind, Arc::new(InMemoryBackend::new()), context)
}

/// Router on a fresh in-memory backend.
pub fn router(context: Arc<ScriptedContext>) -> TaskRouter {
    TaskRouter::new(
        Arc::new(InMemoryBackend::new()),
        channel(context, Duration::from_secs(5)),
        OrchestratorConfig::default(),
    )
}

/// Generous bound for waiting on background delegations.
pub const WAIT: Duration = Duration::from_secs(10);
