//! Caller-facing message router.
//!
//! [`TaskRouter`] owns one [`TaskOrchestrator`] per [`JobKind`] and turns
//! kind-tagged JSON messages into orchestrator calls:
//!
//! | message | payload | response |
//! |---|---|---|
//! | `CREATE_<KIND>_TASK` | `{docHash, fileUrl?, uploadId?}` | `{success:true, taskId}` |
//! | `GET_<KIND>_TASK` | `{taskId}` | `{success:true, task}` |
//!
//! Every failure, including malformed input and unknown message types,
//! comes back as `{success:false, error}`. A `requestId` on the incoming
//! message is echoed on the response so callers can pipeline requests.

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::delegation::DelegationChannel;
use crate::domain::DocumentLocator;
use crate::error::TaskError;
use crate::orchestrator::{OrchestratorConfig, TaskOrchestrator};
use crate::store::StorageBackend;
use crate::types::kind::JobKind;
use crate::types::messages::{CreateTaskParams, GetTaskParams, TaggedMessage};

/// Routes caller messages to the orchestrator of the matching job kind.
///
/// # Construction
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use doc_orchestrator::delegation::{ContextSpec, DelegationChannel, ProcessContext};
/// use doc_orchestrator::orchestrator::OrchestratorConfig;
/// use doc_orchestrator::router::TaskRouter;
/// use doc_orchestrator::store::memory::InMemoryBackend;
/// use serde_json::json;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let channel = Arc::new(DelegationChannel::new(
///     Arc::new(ProcessContext::new("doc-worker", Vec::new())),
///     ContextSpec::default(),
///     Duration::from_secs(300),
/// ));
/// let router = TaskRouter::new(Arc::new(InMemoryBackend::new()), channel, OrchestratorConfig::default());
///
/// let reply = router
///     .handle(json!({"type": "CREATE_TOC_TASK", "payload": {"docHash": "abc"}}))
///     .await;
/// assert_eq!(reply["success"], true);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct TaskRouter {
    chunking: TaskOrchestrator,
    toc: TaskOrchestrator,
}

impl TaskRouter {
    /// Builds both orchestrators over one backend and one delegation channel.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        channel: Arc<DelegationChannel>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            chunking: TaskOrchestrator::new(
                JobKind::Chunking,
                backend.clone(),
                channel.clone(),
                config,
            ),
            toc: TaskOrchestrator::new(JobKind::Toc, backend, channel, config),
        }
    }

    /// The orchestrator for `kind`.
    pub fn orchestrator(&self, kind: JobKind) -> &TaskOrchestrator {
        match kind {
            JobKind::Chunking => &self.chunking,
            JobKind::Toc => &self.toc,
        }
    }

    /// Runs the recovery sweep for every kind and returns all resumed task IDs.
    ///
    /// A kind whose collection cannot be read is logged and skipped so the
    /// other kind still recovers.
    pub async fn resume_all(&self) -> Vec<String> {
        let mut resumed = Vec::new();
        for kind in JobKind::ALL {
            match self.orchestrator(kind).resume_pending().await {
                Ok(ids) => resumed.extend(ids),
                Err(e) => tracing::warn!(%kind, error = %e, "recovery sweep failed"),
            }
        }
        resumed
    }

    /// Delegations currently running across all kinds.
    pub fn in_flight(&self) -> usize {
        self.chunking.in_flight() + self.toc.in_flight()
    }

    /// Waits until no delegation of any kind is running.
    pub async fn wait_idle(&self) {
        self.chunking.wait_idle().await;
        self.toc.wait_idle().await;
    }

    /// Handles one caller message and produces its response. Never fails.
    pub async fn handle(&self, message: Value) -> Value {
        let request_id = message.get("requestId").cloned();
        let mut response = match self.dispatch(message).await {
            Ok(body) => body,
            Err(error) => json!({ "success": false, "error": error }),
        };
        if let (Some(id), Value::Object(map)) = (request_id, &mut response) {
            map.insert("requestId".to_string(), id);
        }
        response
    }

    async fn dispatch(&self, message: Value) -> Result<Value, String> {
        let tagged: TaggedMessage =
            serde_json::from_value(message).map_err(|e| format!("malformed message: {e}"))?;
        let message_type = tagged.message_type.as_str();

        for kind in JobKind::ALL {
            if message_type == kind.create_message_type() {
                return self.create(kind, tagged.payload).await;
            }
            if message_type == kind.get_message_type() {
                return self.get(kind, tagged.payload).await;
            }
        }

        tracing::debug!(message_type, "unknown message type");
        Err(format!("unknown message type: {message_type}"))
    }

    async fn create(&self, kind: JobKind, payload: Value) -> Result<Value, String> {
        let params: CreateTaskParams = serde_json::from_value(payload)
            .map_err(|e| format!("invalid {} payload: {e}", kind.create_message_type()))?;
        let locator = DocumentLocator {
            file_url: params.file_url,
            upload_id: params.upload_id,
        };
        let task_id = self
            .orchestrator(kind)
            .create_task(&params.doc_hash, locator)
            .await
            .map_err(|e| {
                tracing::warn!(%kind, doc_hash = %params.doc_hash, error = %e, "create task failed");
                e.to_string()
            })?;
        Ok(json!({ "success": true, "taskId": task_id }))
    }

    async fn get(&self, kind: JobKind, payload: Value) -> Result<Value, String> {
        let params: GetTaskParams = serde_json::from_value(payload)
            .map_err(|e| format!("invalid {} payload: {e}", kind.get_message_type()))?;
        let record = self
            .orchestrator(kind)
            .get_task(&params.task_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| {
                TaskError::NotFound {
                    task_id: params.task_id.clone(),
                }
                .to_string()
            })?;

        let mut body = Map::new();
        body.insert("success".to_string(), Value::Bool(true));
        body.insert(
            "task".to_string(),
            serde_json::to_value(&record).map_err(|e| e.to_string())?,
        );
        Ok(Value::Object(body))
    }
}
