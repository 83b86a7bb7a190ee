//! Per-job status polling.
//!
//! Each poll runs as its own task: fetch status, merge it into the
//! [`JobStore`], sleep, repeat until the job is terminal. Failed fetches
//! are absorbed and retried with exponential backoff; after
//! [`PollConfig::max_consecutive_failures`] failures in a row the poller
//! gives up.
//!
//! At most one poller runs per job id. [`JobPoller::start`] refuses a
//! second one with [`ClientError::AlreadyPolling`], so there is never
//! more than one status request in flight for a job.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use contentflow_core::backoff::PollBackoff;
use contentflow_core::job::JobStatus;
use contentflow_core::types::JobId;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::api::JobsApi;
use crate::error::ClientError;
use crate::store::JobStore;

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Cadence while status requests succeed.
    pub interval: Duration,
    /// Upper bound for the delay after repeated failures.
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: Some(30),
        }
    }
}

impl PollConfig {
    fn backoff(&self) -> PollBackoff {
        PollBackoff::new(self.interval, self.max_backoff)
    }
}

/// How a poller ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The job reached `completed` or `failed`.
    Terminal(JobStatus),
    Cancelled,
    /// The job was dismissed from the store.
    Removed,
    GaveUp { failures: u32 },
}

impl PollOutcome {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Registry = Arc<Mutex<HashSet<JobId>>>;

/// Claim on a job id in the registry, released on drop.
struct PollSlot {
    registry: Registry,
    job_id: JobId,
}

impl PollSlot {
    fn acquire(registry: &Registry, job_id: &str) -> Option<Self> {
        let mut active = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(job_id.to_string()) {
            return None;
        }
        Some(Self {
            registry: Arc::clone(registry),
            job_id: job_id.to_string(),
        })
    }
}

impl Drop for PollSlot {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

// ---------------------------------------------------------------------------
// JobPoller
// ---------------------------------------------------------------------------

/// Starts and tracks status pollers.
#[derive(Clone)]
pub struct JobPoller {
    api: Arc<dyn JobsApi>,
    store: JobStore,
    config: PollConfig,
    active: Registry,
    /// Stops every poller when cancelled.
    shutdown: CancellationToken,
}

impl JobPoller {
    pub fn new(api: Arc<dyn JobsApi>, store: JobStore, config: PollConfig) -> Self {
        Self {
            api,
            store,
            config,
            active: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `job_id` until it settles.
    pub fn start(&self, job_id: impl Into<JobId>) -> Result<PollHandle, ClientError> {
        self.spawn(job_id.into(), CancellationToken::new())
    }

    /// Like [`start`](Self::start), but also stopped when `parent` is
    /// cancelled.
    pub fn start_child(
        &self,
        job_id: impl Into<JobId>,
        parent: &CancellationToken,
    ) -> Result<PollHandle, ClientError> {
        self.spawn(job_id.into(), parent.child_token())
    }

    pub fn is_polling(&self, job_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(job_id)
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every running poller.
    pub fn shutdown(&self) {
        tracing::info!(active = self.active_count(), "Shutting down job pollers");
        self.shutdown.cancel();
    }

    fn spawn(&self, job_id: JobId, cancel: CancellationToken) -> Result<PollHandle, ClientError> {
        let slot = PollSlot::acquire(&self.active, &job_id)
            .ok_or_else(|| ClientError::AlreadyPolling(job_id.clone()))?;

        tracing::info!(job_id = %job_id, "Poller started");

        let task = tokio::spawn(poll_loop(
            Arc::clone(&self.api),
            self.store.clone(),
            self.config.clone(),
            job_id.clone(),
            Stop {
                cancel: cancel.clone(),
                shutdown: self.shutdown.clone(),
            },
            slot,
        ));

        Ok(PollHandle {
            job_id,
            cancel: cancel.clone(),
            guard: cancel.drop_guard(),
            task,
        })
    }
}

/// Handle to a running poller. Dropping it cancels the poller.
#[derive(Debug)]
pub struct PollHandle {
    job_id: JobId,
    cancel: CancellationToken,
    guard: DropGuard,
    task: JoinHandle<PollOutcome>,
}

impl PollHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the poller to end.
    pub async fn join(self) -> PollOutcome {
        let PollHandle { task, guard, .. } = self;
        let outcome = task.await.unwrap_or(PollOutcome::Cancelled);
        guard.disarm();
        outcome
    }
}

/// The two ways a poller is told to stop.
struct Stop {
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl Stop {
    async fn requested(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

async fn poll_loop(
    api: Arc<dyn JobsApi>,
    store: JobStore,
    config: PollConfig,
    job_id: JobId,
    stop: Stop,
    _slot: PollSlot,
) -> PollOutcome {
    let mut backoff = config.backoff();

    loop {
        if !store.contains(&job_id) {
            tracing::info!(job_id = %job_id, "Job no longer tracked, stopping poller");
            return PollOutcome::Removed;
        }

        let result = tokio::select! {
            _ = stop.requested() => {
                tracing::info!(job_id = %job_id, "Poller cancelled");
                return PollOutcome::Cancelled;
            }
            result = api.job_status(&job_id) => result,
        };

        match result {
            Ok(report) => {
                backoff.record_success();

                let status = report.status;
                store.update(&job_id, report.to_patch());

                if status.is_terminal() {
                    if !store.contains(&job_id) {
                        return PollOutcome::Removed;
                    }
                    tracing::info!(job_id = %job_id, status = %status, "Job finished");
                    return PollOutcome::Terminal(status);
                }

                tracing::debug!(
                    job_id = %job_id,
                    status = %status,
                    queue_position = ?report.queue_position,
                    "Job still pending",
                );
            }
            Err(e) => {
                let failures = backoff.record_failure();
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    failures,
                    "Status poll failed",
                );

                if config
                    .max_consecutive_failures
                    .is_some_and(|max| failures >= max)
                {
                    tracing::warn!(job_id = %job_id, failures, "Giving up on job status");
                    return PollOutcome::GaveUp { failures };
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = stop.requested() => {
                tracing::info!(job_id = %job_id, "Poller cancelled");
                return PollOutcome::Cancelled;
            }
            _ = tokio::time::sleep(backoff.delay()) => {}
        }
    }
}
