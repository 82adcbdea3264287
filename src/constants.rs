//! Storage keys, message type fragments, and defaults.

/// Storage key of the chunking task collection.
pub const CHUNKING_STORAGE_KEY: &str = "chunking_tasks";

/// Storage key of the table-of-contents task collection.
pub const TOC_STORAGE_KEY: &str = "toc_tasks";

/// Default bound on a single round trip to the execution context (5 minutes).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 300_000;

/// How many times a collection read-modify-write is retried on a version
/// conflict before giving up.
pub const MAX_CAS_ATTEMPTS: u32 = 8;

/// Justification handed to the execution context when it is created.
pub const DEFAULT_CONTEXT_JUSTIFICATION: &str =
    "Parse documents and persist derived artifacts for the viewer";

/// Capability reasons handed to the execution context when it is created.
pub const DEFAULT_CONTEXT_REASONS: &[&str] = &["DOM_PARSER", "LOCAL_STORAGE"];

/// Environment variable carrying the justification to a process context.
pub const CONTEXT_JUSTIFICATION_ENV: &str = "DOC_CONTEXT_JUSTIFICATION";

/// Environment variable carrying the comma-separated reasons to a process context.
pub const CONTEXT_REASONS_ENV: &str = "DOC_CONTEXT_REASONS";

/// Capacity of the task event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
