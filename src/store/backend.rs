//! Low-level key-value storage backend trait and supporting types.
//!
//! The [`StorageBackend`] trait is the persistent key/value capability the
//! orchestrator consumes. It exposes four operations:
//! [`get`](StorageBackend::get), [`put`](StorageBackend::put),
//! [`put_if_version`](StorageBackend::put_if_version), and
//! [`delete`](StorageBackend::delete).
//!
//! Backends are dumb byte stores. Collection encoding, the status state
//! machine, and the dedup decision all live above this layer.
//!
//! # Versioning
//!
//! Each stored value carries a monotonic `u64` version starting at 1 and
//! incremented on every successful write. Version `0` is never stored; it
//! stands for "no value yet" in [`put_if_version`](StorageBackend::put_if_version),
//! which makes first-ever creation a compare-and-swap too.

use std::fmt;

use async_trait::async_trait;

/// A stored value paired with its version number.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::store::backend::VersionedRecord;
///
/// let record = VersionedRecord {
///     data: b"{}".to_vec(),
///     version: 1,
/// };
/// assert_eq!(record.version, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    /// The serialized bytes.
    pub data: Vec<u8>,

    /// Monotonic version number, starting at 1.
    pub version: u64,
}

/// Errors that can occur during raw storage operations.
///
/// # Examples
///
/// ```
/// use doc_orchestrator::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "toc_tasks".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// The requested key was not found in storage.
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A [`put_if_version`](StorageBackend::put_if_version) call found a
    /// different version than the caller expected.
    VersionConflict {
        /// The key where the conflict occurred.
        key: String,
        /// The version the caller expected (`0` = absent).
        expected: u64,
        /// The version actually stored (`0` = absent).
        actual: u64,
    },

    /// The backend has reached a capacity limit (e.g. a storage quota).
    CapacityExceeded {
        /// Human-readable description of the capacity issue.
        message: String,
    },

    /// An I/O or backend-specific error occurred.
    Backend {
        /// Human-readable description of the error.
        message: String,
        /// The underlying error, if available.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::CapacityExceeded { message } => {
                write!(f, "capacity exceeded: {message}")
            },
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

impl StorageError {
    /// Wraps an I/O error as a [`StorageError::Backend`], keeping it as the source.
    ///
    /// Quota errors (`StorageFull`) map to [`StorageError::CapacityExceeded`].
    pub fn io(context: impl Into<String>, err: std::io::Error) -> Self {
        let message = format!("{}: {err}", context.into());
        if err.kind() == std::io::ErrorKind::StorageFull {
            return Self::CapacityExceeded { message };
        }
        Self::Backend {
            message,
            source: Some(Box::new(err)),
        }
    }
}

/// Key-value storage backend for task collections.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one backend is shared by both
/// job kinds and by every detached delegation.
///
/// # Durability
///
/// A backend used by a host that must survive restarts has to persist a
/// successful `put` before returning. [`InMemoryBackend`](crate::store::memory::InMemoryBackend)
/// does not and is meant for tests.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value and its version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key has never been written or was deleted.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Stores a value unconditionally and returns the new version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::CapacityExceeded`] if the backend is full.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Stores a value only if the current version equals `expected_version`.
    ///
    /// An `expected_version` of `0` succeeds only when the key is absent.
    ///
    /// # Errors
    ///
    /// - [`StorageError::VersionConflict`] on mismatch (including "expected
    ///   absent, found a value" and "expected a value, found none").
    /// - [`StorageError::CapacityExceeded`] / [`StorageError::Backend`] as for `put`.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Deletes a key. Returns `true` if it existed (idempotent).
    ///
    /// # Errors
    ///
    /// - [`StorageError::Backend`] on I/O failures.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}
