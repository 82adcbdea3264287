//! Job kinds.
//!
//! Chunking and table-of-contents generation share one orchestration
//! design. A [`JobKind`] carries everything that differs between them:
//! the message-type names, the storage key of its collection, and the job
//! label used in logs and failure messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{CHUNKING_STORAGE_KEY, TOC_STORAGE_KEY};

/// One of the two parallel processing pipelines.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::JobKind;
///
/// assert_eq!(JobKind::Toc.process_message_type(), "PROCESS_TOC_TASK");
/// assert_eq!(JobKind::Chunking.storage_key(), "chunking_tasks");
/// assert_eq!("toc".parse::<JobKind>().unwrap(), JobKind::Toc);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Semantic chunking of a document.
    Chunking,
    /// Table-of-contents generation.
    Toc,
}

impl JobKind {
    /// Both kinds, in a stable order.
    pub const ALL: [JobKind; 2] = [JobKind::Chunking, JobKind::Toc];

    /// Upper-case fragment used inside message type names.
    pub fn message_label(&self) -> &'static str {
        match self {
            Self::Chunking => "CHUNKING",
            Self::Toc => "TOC",
        }
    }

    /// Lower-case job name used in logs, `Display`, and the generic
    /// rejection message (`"<job> processing failed"`).
    pub fn job_label(&self) -> &'static str {
        match self {
            Self::Chunking => "chunking",
            Self::Toc => "toc",
        }
    }

    /// Fixed storage key of this kind's task collection.
    pub fn storage_key(&self) -> &'static str {
        match self {
            Self::Chunking => CHUNKING_STORAGE_KEY,
            Self::Toc => TOC_STORAGE_KEY,
        }
    }

    /// `PROCESS_<KIND>_TASK`, sent to the execution context.
    pub fn process_message_type(&self) -> &'static str {
        match self {
            Self::Chunking => "PROCESS_CHUNKING_TASK",
            Self::Toc => "PROCESS_TOC_TASK",
        }
    }

    /// `VERIFY_<KIND>_EXISTS`, sent to the execution context.
    pub fn verify_message_type(&self) -> &'static str {
        match self {
            Self::Chunking => "VERIFY_CHUNKING_EXISTS",
            Self::Toc => "VERIFY_TOC_EXISTS",
        }
    }

    /// `CREATE_<KIND>_TASK`, received from callers.
    pub fn create_message_type(&self) -> &'static str {
        match self {
            Self::Chunking => "CREATE_CHUNKING_TASK",
            Self::Toc => "CREATE_TOC_TASK",
        }
    }

    /// `GET_<KIND>_TASK`, received from callers polling a task's status.
    pub fn get_message_type(&self) -> &'static str {
        match self {
            Self::Chunking => "GET_CHUNKING_TASK",
            Self::Toc => "GET_TOC_TASK",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_label())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chunking" => Ok(Self::Chunking),
            "toc" => Ok(Self::Toc),
            other => Err(format!("unknown job kind: {other} (expected chunking or toc)")),
        }
    }
}
