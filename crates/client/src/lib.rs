//! Async orchestration of contentflow backend jobs.
//!
//! The backend is reached through the traits in [`api`]; [`http`] talks
//! to the real service and [`memory`] is an in-process stand-in. On top
//! of those:
//!
//! - [`store::JobStore`] is the shared registry of tracked jobs.
//! - [`poller::JobPoller`] runs one status loop per job.
//! - [`batch::BatchCoordinator`] and [`launcher::JobLauncher`] submit work.
//! - [`logs::LogStreamClient`] follows a job's log channel.
//! - [`review::DiffReviewController`] drives approval of AI edits.

pub mod api;
pub mod batch;
pub mod config;
pub mod error;
pub mod http;
pub mod launcher;
pub mod listing;
pub mod logs;
pub mod memory;
pub mod poller;
pub mod review;
pub mod store;

pub use config::ClientConfig;
pub use error::ClientError;
