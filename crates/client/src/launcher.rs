//! Single-job submission.

use std::sync::Arc;

use contentflow_core::batch::SubmissionPayload;
use contentflow_core::error::CoreError;
use contentflow_core::job::Job;
use contentflow_core::types::JobId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::api::JobsApi;
use crate::error::ClientError;
use crate::listing::ListingRefresher;
use crate::poller::{JobPoller, PollOutcome};
use crate::store::JobStore;

/// Submits one job, registers it in the store and polls it to the end.
#[derive(Clone)]
pub struct JobLauncher {
    api: Arc<dyn JobsApi>,
    poller: JobPoller,
    refresher: Option<Arc<dyn ListingRefresher>>,
}

impl JobLauncher {
    pub fn new(api: Arc<dyn JobsApi>, poller: JobPoller) -> Self {
        Self {
            api,
            poller,
            refresher: None,
        }
    }

    /// Reload the output listing whenever a launched job settles.
    pub fn with_refresher(mut self, refresher: Arc<dyn ListingRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn store(&self) -> &JobStore {
        self.poller.store()
    }

    /// Validate and submit `payload`.
    ///
    /// The job enters the store as `queued` and polling starts right away.
    /// Nothing is tracked if validation or submission fails.
    pub async fn launch<P: SubmissionPayload>(
        &self,
        payload: &P,
    ) -> Result<LaunchedJob, ClientError> {
        payload
            .validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;

        let job_type = payload.job_type();
        let params = serde_json::to_value(payload)?;
        let ack = self.api.submit(job_type, &params).await?;

        let job = Job::new(ack.job_id, job_type, params);
        self.store().add(job.clone());
        tracing::info!(job_id = %job.id, job_type = %job_type, "Job submitted");

        let handle = self.poller.start(job.id.clone())?;
        let cancel = handle.cancellation_token();
        let (tx, outcome) = oneshot::channel();
        let refresher = self.refresher.clone();

        tokio::spawn(async move {
            let result = handle.join().await;
            if result.is_terminal() {
                if let Some(refresher) = refresher {
                    refresher.refresh(job_type.output_kind()).await;
                }
            }
            let _ = tx.send(result);
        });

        Ok(LaunchedJob {
            job,
            cancel,
            outcome,
        })
    }
}

/// A submitted job. Dropping this does not stop its poller.
#[derive(Debug)]
pub struct LaunchedJob {
    job: Job,
    cancel: CancellationToken,
    outcome: oneshot::Receiver<PollOutcome>,
}

impl LaunchedJob {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// The job as first registered.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Stop polling this job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until polling ends.
    pub async fn finished(self) -> PollOutcome {
        self.outcome.await.unwrap_or(PollOutcome::Cancelled)
    }
}
