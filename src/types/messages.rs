//! Wire payloads exchanged with callers and with the execution context.
//!
//! Field names are the stable contract and serialize in `camelCase`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of `PROCESS_<KIND>_TASK`.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::types::ProcessTaskRequest;
///
/// let req = ProcessTaskRequest {
///     task_id: "t1".to_string(),
///     doc_hash: "abc".to_string(),
///     file_url: Some("https://example.com/a.pdf".to_string()),
///     upload_id: None,
/// };
/// let json = serde_json::to_value(&req).unwrap();
/// assert_eq!(json["taskId"], "t1");
/// assert_eq!(json["docHash"], "abc");
/// assert!(json.get("uploadId").is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTaskRequest {
    /// Task being processed.
    pub task_id: String,
    /// Identity of the target document.
    pub doc_hash: String,
    /// Remote locator, when the document came from a URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Local locator, when the document was uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

/// Response to `PROCESS_<KIND>_TASK`.
///
/// Anything beyond `success`/`error` is kind-specific and kept verbatim in
/// [`result`](Self::result); the orchestrator does not interpret it.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::types::ProcessTaskResponse;
///
/// let resp: ProcessTaskResponse =
///     serde_json::from_str(r#"{"success":true,"chunkCount":12}"#).unwrap();
/// assert!(resp.success);
/// assert_eq!(resp.result["chunkCount"], 12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTaskResponse {
    /// Whether processing succeeded.
    pub success: bool,
    /// Failure message when `success` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind-specific result fields.
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

/// Payload of `VERIFY_<KIND>_EXISTS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyExistsRequest {
    /// Document whose output artifacts should be checked.
    pub doc_hash: String,
}

/// Response to `VERIFY_<KIND>_EXISTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyExistsResponse {
    /// `true` when the artifacts are still present.
    pub exists: bool,
}

/// Payload of `CREATE_<KIND>_TASK`, sent by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskParams {
    /// Identity of the target document.
    pub doc_hash: String,
    /// Remote locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Local upload locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

/// Payload of `GET_<KIND>_TASK`, sent by callers polling a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTaskParams {
    /// Task to look up.
    pub task_id: String,
}

/// A kind-tagged message: `{"type": ..., "payload": ...}`.
///
/// Used both for requests to the execution context and for caller
/// messages arriving at the [`TaskRouter`](crate::router::TaskRouter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedMessage {
    /// Message type, e.g. `PROCESS_TOC_TASK`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl TaggedMessage {
    /// Builds a message from a serializable payload.
    pub fn new<T: Serialize>(
        message_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: message_type.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}
