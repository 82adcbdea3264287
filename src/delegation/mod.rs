//! Delegation of jobs to the execution context.
//!
//! The execution context is the separate, ephemeral environment that does
//! the actual document work. The orchestrator only knows how to make sure
//! it is running and how to exchange one kind-tagged request/response pair
//! with it; both capabilities are abstracted by [`ExecutionContext`].
//!
//! [`DelegationChannel`] layers the protocol on top:
//!
//! 1. ensure the context exists, creating it if needed (creation races are
//!    tolerated),
//! 2. send `PROCESS_<KIND>_TASK` or `VERIFY_<KIND>_EXISTS`,
//! 3. await one response, all of it bounded by the request timeout.
//!
//! A panic inside the collaborator is caught and reported as a transport
//! error, so it ends up in the task's `failed` status like any other
//! delegation failure.

pub mod process;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::constants::{DEFAULT_CONTEXT_JUSTIFICATION, DEFAULT_CONTEXT_REASONS};
use crate::domain::TaskRecord;
use crate::error::DelegationError;
use crate::types::kind::JobKind;
use crate::types::messages::{
    ProcessTaskResponse, TaggedMessage, VerifyExistsRequest, VerifyExistsResponse,
};

pub use process::ProcessContext;

/// What the execution context is told when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSpec {
    /// Human-readable reason the context is needed.
    pub justification: String,
    /// Capability reasons requested for the context.
    pub reasons: Vec<String>,
}

impl Default for ContextSpec {
    fn default() -> Self {
        Self {
            justification: DEFAULT_CONTEXT_JUSTIFICATION.to_string(),
            reasons: DEFAULT_CONTEXT_REASONS
                .iter()
                .map(|r| (*r).to_string())
                .collect(),
        }
    }
}

/// The environment that performs document work.
///
/// Implementations must be `Send + Sync`; one context is shared by both
/// job kinds.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Whether the context is currently running.
    async fn exists(&self) -> bool;

    /// Starts the context.
    ///
    /// # Errors
    ///
    /// - [`DelegationError::AlreadyExists`] if another caller created it first.
    /// - [`DelegationError::ContextUnavailable`] if it cannot be started.
    async fn create(&self, spec: &ContextSpec) -> Result<(), DelegationError>;

    /// Sends one tagged message and waits for its response payload.
    ///
    /// # Errors
    ///
    /// Any [`DelegationError`] other than `AlreadyExists`.
    async fn send(&self, message: TaggedMessage) -> Result<Value, DelegationError>;
}

/// Request/response protocol with the execution context.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use doc_orchestrator::delegation::{ContextSpec, DelegationChannel, ProcessContext};
/// use doc_orchestrator::JobKind;
///
/// # async fn example() -> Result<(), doc_orchestrator::error::DelegationError> {
/// let context = Arc::new(ProcessContext::new("doc-worker", Vec::new()));
/// let channel = DelegationChannel::new(context, ContextSpec::default(), Duration::from_secs(30));
/// let present = channel.verify(JobKind::Toc, "abc").await?;
/// # Ok(())
/// # }
/// ```
pub struct DelegationChannel {
    context: Arc<dyn ExecutionContext>,
    spec: ContextSpec,
    timeout: Duration,
    ensure_lock: Mutex<()>,
}

impl std::fmt::Debug for DelegationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationChannel")
            .field("spec", &self.spec)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DelegationChannel {
    /// Creates a channel over `context`, bounding every round trip by `timeout`.
    pub fn new(context: Arc<dyn ExecutionContext>, spec: ContextSpec, timeout: Duration) -> Self {
        Self {
            context,
            spec,
            timeout,
            ensure_lock: Mutex::new(()),
        }
    }

    /// The bound applied to each round trip.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Makes sure the execution context is running.
    ///
    /// Concurrent callers in this process are serialized; a creation race
    /// with anyone else (`AlreadyExists`) is logged and ignored.
    ///
    /// # Errors
    ///
    /// [`DelegationError::ContextUnavailable`] (or whatever the context
    /// reports) when creation fails for another reason.
    pub async fn ensure_context(&self) -> Result<(), DelegationError> {
        let _guard = self.ensure_lock.lock().await;
        if self.context.exists().await {
            return Ok(());
        }
        match self.context.create(&self.spec).await {
            Ok(()) => {
                tracing::info!(reasons = ?self.spec.reasons, "execution context created");
                Ok(())
            },
            Err(DelegationError::AlreadyExists) => {
                tracing::debug!("execution context already exists, continuing");
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Ensure + send + await, all under the timeout, with panics caught.
    async fn round_trip(&self, message: TaggedMessage) -> Result<Value, DelegationError> {
        let message_type = message.message_type.clone();
        let exchange = async {
            self.ensure_context().await?;
            self.context.send(message).await
        };

        match tokio::time::timeout(self.timeout, AssertUnwindSafe(exchange).catch_unwind()).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::warn!(%message_type, %detail, "execution context panicked");
                Err(DelegationError::Transport(format!(
                    "execution context panicked: {detail}"
                )))
            },
            Err(_) => Err(DelegationError::Timeout(self.timeout)),
        }
    }

    /// Asks the execution context to process one task.
    ///
    /// Returns the response only when it reports success; `success: false`
    /// becomes [`DelegationError::Rejected`] carrying the reported message.
    ///
    /// # Errors
    ///
    /// Any [`DelegationError`]; callers turn it into a `failed` status.
    pub async fn process(
        &self,
        kind: JobKind,
        record: &TaskRecord,
    ) -> Result<ProcessTaskResponse, DelegationError> {
        let message = TaggedMessage::new(kind.process_message_type(), &record.to_process_request())
            .map_err(|e| DelegationError::InvalidResponse(e.to_string()))?;
        let raw = self.round_trip(message).await?;
        let response: ProcessTaskResponse = serde_json::from_value(raw).map_err(|e| {
            DelegationError::InvalidResponse(format!(
                "{} response: {e}",
                kind.process_message_type()
            ))
        })?;

        if response.success {
            Ok(response)
        } else {
            let message = response
                .error
                .unwrap_or_else(|| format!("{} processing failed", kind.job_label()));
            Err(DelegationError::Rejected(message))
        }
    }

    /// Asks the verification collaborator whether a document's output
    /// artifacts are still present.
    ///
    /// # Errors
    ///
    /// Any [`DelegationError`].
    pub async fn verify(&self, kind: JobKind, doc_hash: &str) -> Result<bool, DelegationError> {
        let request = VerifyExistsRequest {
            doc_hash: doc_hash.to_string(),
        };
        let message = TaggedMessage::new(kind.verify_message_type(), &request)
            .map_err(|e| DelegationError::InvalidResponse(e.to_string()))?;
        let raw = self.round_trip(message).await?;
        let response: VerifyExistsResponse = serde_json::from_value(raw).map_err(|e| {
            DelegationError::InvalidResponse(format!(
                "{} response: {e}",
                kind.verify_message_type()
            ))
        })?;
        Ok(response.exists)
    }
}
