//! Domain types and pure state machines for the contentflow client.
//!
//! Nothing in this crate performs I/O. The async orchestration layer
//! (`contentflow-client`) drives these types from network results.

pub mod backoff;
pub mod batch;
pub mod diff;
pub mod error;
pub mod files;
pub mod job;
pub mod log_tail;
pub mod review;
pub mod sse;
pub mod types;
