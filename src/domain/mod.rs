//! Persisted domain types.
//!
//! [`TaskRecord`] is one job for one document; [`TaskCollection`] is the
//! per-kind mapping that is stored as a single blob.

pub mod collection;
pub mod record;

pub use collection::*;
pub use record::*;
