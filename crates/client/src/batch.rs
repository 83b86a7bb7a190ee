//! Batch submission and completion tracking.
//!
//! A [`BatchCoordinator`] owns the editable [`BatchForm`]. Submitting a
//! confirmed batch registers every job, polls each one under a shared
//! parent token, and resets the form only once every job of the batch
//! reached a terminal status.

use std::sync::Arc;

use contentflow_core::batch::{BatchForm, BatchPayload, ConfirmedBatch, PreparedBatch};
use contentflow_core::error::CoreError;
use contentflow_core::job::{Job, JobStatus};
use contentflow_core::types::{BatchId, JobId};
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{BatchAck, JobsApi};
use crate::error::ClientError;
use crate::listing::ListingRefresher;
use crate::poller::{JobPoller, PollHandle, PollOutcome};

/// How a submitted batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every job settled. The form was reset.
    Completed { completed: usize, failed: usize },
    /// At least one job stopped being polled before it settled. The form
    /// was unlocked with its entries kept.
    Abandoned { settled: usize, unfinished: usize },
}

struct Inner<E: BatchPayload> {
    api: Arc<dyn JobsApi>,
    poller: JobPoller,
    form: watch::Sender<BatchForm<E>>,
    refresher: Option<Arc<dyn ListingRefresher>>,
}

/// Form state and submission for one batchable payload type.
pub struct BatchCoordinator<E: BatchPayload> {
    inner: Arc<Inner<E>>,
}

impl<E: BatchPayload> Clone for BatchCoordinator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: BatchPayload> BatchCoordinator<E> {
    pub fn new(api: Arc<dyn JobsApi>, poller: JobPoller) -> Self {
        Self::build(api, poller, None)
    }

    pub fn with_refresher(
        api: Arc<dyn JobsApi>,
        poller: JobPoller,
        refresher: Arc<dyn ListingRefresher>,
    ) -> Self {
        Self::build(api, poller, Some(refresher))
    }

    fn build(
        api: Arc<dyn JobsApi>,
        poller: JobPoller,
        refresher: Option<Arc<dyn ListingRefresher>>,
    ) -> Self {
        let (form, _) = watch::channel(BatchForm::default());
        Self {
            inner: Arc::new(Inner {
                api,
                poller,
                form,
                refresher,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchForm<E>> {
        self.inner.form.subscribe()
    }

    pub fn form(&self) -> BatchForm<E> {
        self.inner.form.borrow().clone()
    }

    /// Apply an edit to the form. Subscribers see the change only if the
    /// edit succeeded.
    pub fn edit_form<R>(
        &self,
        f: impl FnOnce(&mut BatchForm<E>) -> Result<R, CoreError>,
    ) -> Result<R, ClientError> {
        let mut result = None;
        self.inner.form.send_if_modified(|form| {
            let outcome = f(form);
            let modified = outcome.is_ok();
            result = Some(outcome);
            modified
        });
        match result {
            Some(outcome) => Ok(outcome?),
            None => Err(ClientError::Core(CoreError::Conflict(
                "form edit did not run".to_string(),
            ))),
        }
    }

    /// Pick the complete entries out of the current form.
    pub fn prepare(&self) -> Result<PreparedBatch<E>, ClientError> {
        Ok(self.inner.form.borrow().prepare()?)
    }

    /// Submit a confirmed batch.
    ///
    /// The form is locked until the batch settles. If the submission
    /// itself fails, the form is unlocked again with its entries intact.
    pub async fn submit(&self, batch: ConfirmedBatch<E>) -> Result<BatchRun, ClientError> {
        self.edit_form(|form| form.begin_submit())?;

        match self.dispatch(batch).await {
            Ok(run) => Ok(run),
            Err(e) => {
                tracing::warn!(
                    job_type = %E::BATCH_JOB_TYPE,
                    error = %e,
                    "Batch submission failed",
                );
                self.inner.form.send_modify(|form| form.end_submit());
                Err(e)
            }
        }
    }

    async fn dispatch(&self, batch: ConfirmedBatch<E>) -> Result<BatchRun, ClientError> {
        let params = batch
            .entries()
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let ack = self
            .inner
            .api
            .submit_batch(E::BATCH_JOB_TYPE, E::BATCH_FIELD, params.clone())
            .await?;

        if ack.job_ids.len() != params.len() {
            return Err(ClientError::BatchMismatch {
                submitted: params.len(),
                received: ack.job_ids.len(),
            });
        }

        tracing::info!(
            batch_id = %ack.batch_id,
            total_jobs = ack.total_jobs,
            job_type = %E::BATCH_JOB_TYPE,
            "Batch submitted",
        );

        let jobs = self.initial_jobs(&ack, params).await;
        let store = self.inner.poller.store();
        for job in jobs {
            store.add(job);
        }
        if let Some(first) = ack.job_ids.first() {
            store.select(Some(first.as_str()));
        }

        let cancel = CancellationToken::new();
        let handles = ack
            .job_ids
            .iter()
            .map(|id| self.inner.poller.start_child(id.clone(), &cancel))
            .collect::<Result<Vec<_>, _>>()?;

        let monitor = tokio::spawn(monitor(
            Arc::clone(&self.inner),
            ack.batch_id.clone(),
            handles,
        ));

        Ok(BatchRun {
            ack,
            cancel,
            monitor,
        })
    }

    /// Fetch every member's status concurrently. Members whose status
    /// cannot be read yet are registered as queued in submission order.
    async fn initial_jobs(&self, ack: &BatchAck, params: Vec<serde_json::Value>) -> Vec<Job> {
        let api = &self.inner.api;
        let reports = join_all(ack.job_ids.iter().map(|id| api.job_status(id))).await;

        ack.job_ids
            .iter()
            .zip(params)
            .zip(reports)
            .enumerate()
            .map(|(index, ((id, params), report))| match report {
                Ok(report) => {
                    let mut job = report.into_job();
                    job.batch_id.get_or_insert_with(|| ack.batch_id.clone());
                    job
                }
                Err(e) => {
                    tracing::debug!(job_id = %id, error = %e, "Initial status unavailable");
                    Job::new(id.clone(), E::BATCH_JOB_TYPE, params)
                        .with_batch(ack.batch_id.clone(), Some(index as u32 + 1))
                }
            })
            .collect()
    }
}

async fn monitor<E: BatchPayload>(
    inner: Arc<Inner<E>>,
    batch_id: BatchId,
    handles: Vec<PollHandle>,
) -> BatchOutcome {
    let mut pending: FuturesUnordered<_> = handles.into_iter().map(PollHandle::join).collect();
    let (mut completed, mut failed, mut unfinished) = (0, 0, 0);

    while let Some(outcome) = pending.next().await {
        match outcome {
            PollOutcome::Terminal(JobStatus::Completed) => completed += 1,
            PollOutcome::Terminal(_) => failed += 1,
            other => {
                if unfinished == 0 {
                    tracing::warn!(batch_id = %batch_id, outcome = ?other, "Batch abandoned");
                    inner.form.send_modify(|form| form.end_submit());
                }
                unfinished += 1;
            }
        }
    }

    let settled = completed + failed;
    if settled > 0 {
        if let Some(refresher) = &inner.refresher {
            refresher.refresh(E::BATCH_JOB_TYPE.output_kind()).await;
        }
    }

    if unfinished > 0 {
        return BatchOutcome::Abandoned {
            settled,
            unfinished,
        };
    }

    tracing::info!(batch_id = %batch_id, completed, failed, "Batch finished");
    inner.form.send_modify(|form| form.reset());
    BatchOutcome::Completed { completed, failed }
}

/// A submitted batch. Dropping this does not stop its pollers.
#[derive(Debug)]
pub struct BatchRun {
    ack: BatchAck,
    cancel: CancellationToken,
    monitor: JoinHandle<BatchOutcome>,
}

impl BatchRun {
    pub fn ack(&self) -> &BatchAck {
        &self.ack
    }

    pub fn batch_id(&self) -> &BatchId {
        &self.ack.batch_id
    }

    pub fn job_ids(&self) -> &[JobId] {
        &self.ack.job_ids
    }

    pub fn total_jobs(&self) -> usize {
        self.ack.total_jobs
    }

    /// Stop polling every job of the batch.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.monitor.is_finished()
    }

    pub async fn finished(self) -> BatchOutcome {
        let unfinished = self.ack.job_ids.len();
        self.monitor.await.unwrap_or(BatchOutcome::Abandoned {
            settled: 0,
            unfinished,
        })
    }
}
