//! Error types for task orchestration.
//!
//! [`TaskError`] is what the orchestrator surfaces to callers. Only the
//! synchronous part of task creation (input validation and store access)
//! ever returns one; failures inside a detached delegation are absorbed
//! into the task's `failed` status instead.
//!
//! [`DelegationError`] covers everything that can go wrong while talking to
//! the execution context. [`ConfigError`] is produced while loading
//! [`HostConfig`](crate::config::HostConfig).

use std::time::Duration;

use crate::store::backend::StorageError;
use crate::types::task::TaskStatus;

/// Errors returned by task store and orchestrator operations.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::{TaskError, TaskStatus};
///
/// let err = TaskError::InvalidTransition {
///     task_id: "t1".to_string(),
///     from: TaskStatus::Completed,
///     to: TaskStatus::Processing,
/// };
/// assert!(err.to_string().contains("completed"));
/// assert!(err.to_string().contains("t1"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The caller supplied an unusable request (e.g. an empty `docHash`).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Task with the given ID was not found.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// Attempted a transition the status state machine does not allow.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The current status of the task.
        from: TaskStatus,
        /// The rejected target status.
        to: TaskStatus,
    },

    /// The collection kept changing underneath a read-modify-write.
    #[error("concurrent modification of {key}: gave up after {attempts} attempts")]
    ConcurrentModification {
        /// Storage key of the collection.
        key: String,
        /// Number of compare-and-swap attempts made.
        attempts: u32,
    },

    /// A stored collection could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend storage error.
    #[error("store error: {0}")]
    Store(#[from] StorageError),
}

/// Errors raised while delegating work to the execution context.
///
/// These never reach the caller of `create_task`; they are converted into
/// a `failed` status whose `error` field holds the display message.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    /// The execution context is not running and could not be started.
    #[error("execution context unavailable: {0}")]
    ContextUnavailable(String),

    /// Creation raced with another creator. Callers log and continue.
    #[error("execution context already exists")]
    AlreadyExists,

    /// The execution context went away before answering.
    #[error("execution context closed before responding")]
    ContextClosed,

    /// No response arrived within the configured bound.
    #[error("no response from execution context within {0:?}")]
    Timeout(Duration),

    /// Writing the request or reading the response failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The execution context answered with `success: false`.
    #[error("{0}")]
    Rejected(String),
}

impl From<std::io::Error> for DelegationError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors produced while loading or validating host configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for [`HostConfig`](crate::config::HostConfig).
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// A value is present but unusable.
    #[error("invalid configuration value for {key}: {message}")]
    Invalid {
        /// The offending key.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
