//! Wire types: job kinds, task status, and message payloads.
//!
//! Persisted and domain types live in [`domain`](crate::domain).

pub mod kind;
pub mod messages;
pub mod task;

pub use kind::*;
pub use messages::*;
pub use task::*;
