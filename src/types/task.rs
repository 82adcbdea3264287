//! Task status and its state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TaskError;

/// Lifecycle status of a task record.
///
/// # State Machine
///
/// ```text
/// Pending    -> Processing, Failed
/// Processing -> Processing (re-dispatch after a restart), Completed, Failed
/// Completed  -> (terminal)
/// Failed     -> (terminal)
/// ```
///
/// `Pending -> Failed` covers a delegation that cannot even start (for
/// example an exhausted retry budget). Terminal records are never
/// transitioned again; a new `create_task` call supersedes them instead.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::TaskStatus;
///
/// assert!(TaskStatus::Pending.can_transition_to(&TaskStatus::Processing));
/// assert!(TaskStatus::Processing.can_transition_to(&TaskStatus::Completed));
/// assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Processing));
/// assert!(TaskStatus::Failed.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet handed to the execution context.
    Pending,
    /// Handed to the execution context, awaiting its response.
    Processing,
    /// The execution context reported success (terminal).
    Completed,
    /// The execution context reported failure or could not be reached (terminal).
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` for `Pending` and `Processing`, the statuses that
    /// block new work for the same document and that the recovery sweep
    /// resumes.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Failed),
            Self::Processing => matches!(
                next,
                Self::Processing | Self::Completed | Self::Failed
            ),
            Self::Completed | Self::Failed => false,
        }
    }

    /// Validates a transition, returning [`TaskError::InvalidTransition`]
    /// when the state machine rejects it.
    ///
    /// # Examples
    ///
    /// ```
    /// use doc_orchestrator::{TaskError, TaskStatus};
    ///
    /// assert!(TaskStatus::Pending
    ///     .validate_transition("t1", &TaskStatus::Processing)
    ///     .is_ok());
    /// assert!(matches!(
    ///     TaskStatus::Failed.validate_transition("t1", &TaskStatus::Completed),
    ///     Err(TaskError::InvalidTransition { .. })
    /// ));
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}
