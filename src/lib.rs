//! Persistent, idempotent task orchestration for document processing.
//!
//! This crate manages the lifecycle of expensive document-processing jobs
//! (semantic chunking and table-of-contents generation) that run in a
//! separate, ephemeral execution context. The host that owns the tasks may
//! be terminated at any point; every decision is persisted first, and a
//! recovery sweep on the next start picks up whatever was interrupted.
//!
//! # Overview
//!
//! A task moves through a four-state lifecycle
//! (`pending` -> `processing` -> `completed`/`failed`). At most one task per
//! document is active per job kind; asking for a document twice returns the
//! same task ID. Completed work is reused only while its artifacts still
//! verify, and failed work is redone on the next request.
//!
//! # Module Organization
//!
//! - [`types`] - Job kinds, the status state machine, and wire payloads
//! - [`domain`] - Persisted task records and collections
//! - [`store`] - Storage backends and the per-kind task store
//! - [`delegation`] - The execution context abstraction and its protocol
//! - [`orchestrator`] - Dedup decisions, delegation, and recovery
//! - [`router`] - Caller-facing JSON message handling
//! - [`config`] - Host configuration
//! - [`error`] - Error types

pub mod config;
pub mod constants;
pub mod delegation;
pub mod domain;
pub mod error;
pub mod locks;
pub mod orchestrator;
pub mod router;
pub mod store;
pub mod types;

// Re-exports for ergonomic access
pub use domain::{DocumentLocator, TaskCollection, TaskRecord};
pub use error::{ConfigError, DelegationError, TaskError};
pub use orchestrator::{OrchestratorConfig, TaskEvent, TaskOrchestrator};
pub use router::TaskRouter;
pub use types::{JobKind, TaskStatus};
