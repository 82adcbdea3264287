//! Task record -- the persisted representation of one job.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::types::messages::ProcessTaskRequest;
use crate::types::task::TaskStatus;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Where the document bytes live.
///
/// Both locators are optional and opaque to the orchestrator; they are
/// forwarded untouched to the execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLocator {
    /// Remote URL of the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Identifier of a locally uploaded blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

impl DocumentLocator {
    /// Locator for a remote document.
    pub fn url(file_url: impl Into<String>) -> Self {
        Self {
            file_url: Some(file_url.into()),
            upload_id: None,
        }
    }

    /// Locator for a locally uploaded document.
    pub fn upload(upload_id: impl Into<String>) -> Self {
        Self {
            file_url: None,
            upload_id: Some(upload_id.into()),
        }
    }
}

/// One job for one document within one job kind.
///
/// # Construction
///
/// ```
/// use doc_orchestrator::domain::{DocumentLocator, TaskRecord};
/// use doc_orchestrator::TaskStatus;
///
/// let record = TaskRecord::new("abc", DocumentLocator::url("https://example.com/a.pdf"));
/// assert_eq!(record.status, TaskStatus::Pending);
/// assert_eq!(record.doc_hash, "abc");
/// assert_eq!(record.created_at, record.updated_at);
/// assert!(record.error.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Primary key, a UUIDv4 minted at creation.
    pub task_id: String,

    /// Identity of the target document.
    pub doc_hash: String,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Remote locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    /// Local upload locator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,

    /// Last failure message; present only while `status == failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation time, milliseconds since the epoch.
    pub created_at: i64,

    /// Time of the last status transition, milliseconds since the epoch.
    pub updated_at: i64,

    /// Number of times delegation has started for this record.
    #[serde(default)]
    pub attempts: u32,
}

impl TaskRecord {
    /// Creates a `pending` record with a fresh task ID.
    pub fn new(doc_hash: impl Into<String>, locator: DocumentLocator) -> Self {
        let now = now_millis();
        Self {
            task_id: Uuid::new_v4().to_string(),
            doc_hash: doc_hash.into(),
            status: TaskStatus::Pending,
            file_url: locator.file_url,
            upload_id: locator.upload_id,
            error: None,
            created_at: now,
            updated_at: now,
            attempts: 0,
        }
    }

    /// The locator this record was created with.
    pub fn locator(&self) -> DocumentLocator {
        DocumentLocator {
            file_url: self.file_url.clone(),
            upload_id: self.upload_id.clone(),
        }
    }

    /// The essential fields handed to the execution context.
    pub fn to_process_request(&self) -> ProcessTaskRequest {
        ProcessTaskRequest {
            task_id: self.task_id.clone(),
            doc_hash: self.doc_hash.clone(),
            file_url: self.file_url.clone(),
            upload_id: self.upload_id.clone(),
        }
    }

    /// Applies a validated status transition.
    ///
    /// `error` is kept only for `failed`; any other status clears it.
    /// Entering `processing` counts as a delegation attempt. `updated_at`
    /// never moves backwards even if the wall clock does.
    pub fn apply_status(
        &mut self,
        status: TaskStatus,
        error: Option<String>,
    ) -> Result<(), TaskError> {
        self.status.validate_transition(&self.task_id, &status)?;

        self.status = status;
        self.error = match status {
            TaskStatus::Failed => error,
            _ => None,
        };
        if status == TaskStatus::Processing {
            self.attempts = self.attempts.saturating_add(1);
        }
        self.updated_at = now_millis().max(self.updated_at);
        Ok(())
    }
}
