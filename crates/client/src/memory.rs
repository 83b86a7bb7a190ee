//! In-process backend for tests and offline use.
//!
//! Mirrors the HTTP backend's behaviour closely enough to run the whole
//! client against it: jobs are created on submission and only change
//! when the owner scripts them ([`InMemoryBackend::set_job_status`],
//! [`InMemoryBackend::complete_edit_job`]); log channels are fed
//! through a [`LogFeed`].

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use contentflow_core::batch::MAX_BATCH_SIZE;
use contentflow_core::diff::{Diff, FileType};
use contentflow_core::files::{FileInfo, FileKind};
use contentflow_core::job::{JobStatus, JobType};
use contentflow_core::sse::{SseFrame, EVENT_COMPLETE, EVENT_ERROR, EVENT_LOG};
use contentflow_core::types::{DiffId, JobId};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::{
    batch_path, BatchAck, DiffApi, FilesApi, FrameStream, JobAck, JobStatusReport, JobsApi,
    LogTransport,
};
use crate::error::ClientError;

type FrameResult = Result<SseFrame, ClientError>;

#[derive(Debug, Clone)]
struct StoredFile {
    content: String,
    created_at: f64,
}

impl StoredFile {
    fn info(&self, kind: FileKind, name: &str) -> FileInfo {
        let (size, preview) = match kind {
            FileKind::BrandData => (Some(self.content.len() as u64), None),
            FileKind::Brief => (
                Some(word_count(&self.content)),
                self.content
                    .lines()
                    .find_map(|l| l.strip_prefix("# "))
                    .map(|t| t.trim().to_string()),
            ),
            FileKind::Draft => (Some(word_count(&self.content)), None),
        };
        FileInfo {
            name: name.to_string(),
            created_at: self.created_at,
            size,
            preview,
        }
    }
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobStatusReport>,
    diffs: HashMap<DiffId, Diff>,
    files: HashMap<FileKind, BTreeMap<String, StoredFile>>,
    /// Log channels prepared with [`InMemoryBackend::log_feed`], not yet opened.
    pending_feeds: HashMap<JobId, mpsc::UnboundedReceiver<FrameResult>>,
    failing_status_requests: u32,
}

/// Backend that keeps jobs, diffs and files in memory.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    status_requests: Arc<AtomicUsize>,
    opened_streams: Arc<AtomicUsize>,
    closed_streams: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- scripting ----

    /// Track a job under a known id.
    pub async fn insert_job(&self, report: JobStatusReport) {
        self.state
            .lock()
            .await
            .jobs
            .insert(report.id.clone(), report);
    }

    pub async fn job(&self, job_id: &str) -> Option<JobStatusReport> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Move a job to `status`; queue positions are dropped once it leaves `queued`.
    pub async fn set_job_status(&self, job_id: &str, status: JobStatus) -> bool {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(job_id) else {
            return false;
        };
        job.status = status;
        if status != JobStatus::Queued {
            job.queue_position = None;
        }
        true
    }

    pub async fn set_output_files(&self, job_id: &str, files: Vec<String>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(job_id) {
            job.output_files = files;
        }
    }

    /// Finish an edit job by proposing `edited_content` for its file.
    ///
    /// The diff snapshots the file's current content as the original.
    pub async fn complete_edit_job(
        &self,
        job_id: &str,
        edited_content: &str,
    ) -> Result<DiffId, ClientError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClientError::not_found("Job not found"))?;

        let file_type = match job.job_type {
            JobType::BriefEdit => FileType::Brief,
            JobType::DraftEdit => FileType::Draft,
            other => {
                return Err(ClientError::Unsupported(format!(
                    "{other} jobs do not produce diffs"
                )))
            }
        };
        let filename = job
            .params
            .get("filename")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let original_content = state
            .files
            .get(&FileKind::from(file_type))
            .and_then(|files| files.get(&filename))
            .map(|f| f.content.clone())
            .unwrap_or_default();

        let diff_id = uuid::Uuid::new_v4().to_string();
        state.diffs.insert(
            diff_id.clone(),
            Diff {
                diff_id: diff_id.clone(),
                filename,
                file_type,
                original_content,
                edited_content: edited_content.to_string(),
            },
        );
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.status = JobStatus::Completed;
            job.queue_position = None;
            job.diff_id = Some(diff_id.clone());
        }
        Ok(diff_id)
    }

    /// Store a diff; an empty `diff_id` gets a fresh one.
    pub async fn insert_diff(&self, mut diff: Diff) -> DiffId {
        if diff.diff_id.is_empty() {
            diff.diff_id = uuid::Uuid::new_v4().to_string();
        }
        let id = diff.diff_id.clone();
        self.state.lock().await.diffs.insert(id.clone(), diff);
        id
    }

    pub async fn has_diff(&self, diff_id: &str) -> bool {
        self.state.lock().await.diffs.contains_key(diff_id)
    }

    pub async fn put_file(&self, kind: FileKind, name: &str, content: &str) {
        self.put_file_at(kind, name, content, now_epoch()).await;
    }

    pub async fn put_file_at(&self, kind: FileKind, name: &str, content: &str, created_at: f64) {
        self.state.lock().await.files.entry(kind).or_default().insert(
            name.to_string(),
            StoredFile {
                content: content.to_string(),
                created_at,
            },
        );
    }

    pub async fn file_content(&self, kind: FileKind, name: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .files
            .get(&kind)
            .and_then(|files| files.get(name))
            .map(|f| f.content.clone())
    }

    /// Make the next `count` status requests fail with a 503.
    pub async fn fail_status_requests(&self, count: u32) {
        self.state.lock().await.failing_status_requests = count;
    }

    pub fn status_request_count(&self) -> usize {
        self.status_requests.load(Ordering::SeqCst)
    }

    /// Prepare the log channel of `job_id`; the next
    /// [`open_log_stream`](LogTransport::open_log_stream) for it reads
    /// what the returned feed sends. Dropping every clone of the feed
    /// ends the stream.
    pub async fn log_feed(&self, job_id: &str) -> LogFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .await
            .pending_feeds
            .insert(job_id.to_string(), rx);
        LogFeed { tx }
    }

    pub fn opened_log_streams(&self) -> usize {
        self.opened_streams.load(Ordering::SeqCst)
    }

    /// Log channels that were opened and have since been dropped.
    pub fn closed_log_streams(&self) -> usize {
        self.closed_streams.load(Ordering::SeqCst)
    }

    fn new_job(job_type: JobType, params: serde_json::Value) -> JobStatusReport {
        JobStatusReport {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Queued,
            params,
            batch_id: None,
            queue_position: None,
            output_files: Vec::new(),
            diff_id: None,
        }
    }
}

fn bad_request(body: impl Into<String>) -> ClientError {
    ClientError::Api {
        status: 400,
        body: body.into(),
    }
}

#[async_trait]
impl JobsApi for InMemoryBackend {
    async fn submit(
        &self,
        job_type: JobType,
        params: &serde_json::Value,
    ) -> Result<JobAck, ClientError> {
        let job = Self::new_job(job_type, params.clone());
        let job_id = job.id.clone();
        self.state.lock().await.jobs.insert(job_id.clone(), job);
        Ok(JobAck { job_id })
    }

    async fn submit_batch(
        &self,
        job_type: JobType,
        _field: &str,
        entries: Vec<serde_json::Value>,
    ) -> Result<BatchAck, ClientError> {
        batch_path(job_type)?;
        if entries.is_empty() {
            return Err(bad_request("At least one entry is required"));
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(bad_request(format!(
                "Maximum {MAX_BATCH_SIZE} entries per batch"
            )));
        }

        let batch_id: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let mut state = self.state.lock().await;
        let mut job_ids = Vec::with_capacity(entries.len());
        for (position, params) in entries.into_iter().enumerate() {
            let mut job = Self::new_job(job_type, params);
            job.batch_id = Some(batch_id.clone());
            job.queue_position = Some(position as u32 + 1);
            job_ids.push(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }

        Ok(BatchAck {
            batch_id,
            total_jobs: job_ids.len(),
            message: format!(
                "Batch of {} {}(s) submitted successfully",
                job_ids.len(),
                job_type
            ),
            job_ids,
        })
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, ClientError> {
        self.status_requests.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.failing_status_requests > 0 {
            state.failing_status_requests -= 1;
            return Err(ClientError::Api {
                status: 503,
                body: "Service unavailable".into(),
            });
        }
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ClientError::not_found("Job not found"))
    }
}

#[async_trait]
impl DiffApi for InMemoryBackend {
    async fn get_diff(&self, diff_id: &str) -> Result<Diff, ClientError> {
        self.state
            .lock()
            .await
            .diffs
            .get(diff_id)
            .cloned()
            .ok_or_else(|| ClientError::not_found("Diff not found"))
    }

    async fn approve_diff(&self, diff_id: &str, content: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        let diff = state
            .diffs
            .remove(diff_id)
            .ok_or_else(|| ClientError::not_found("Diff not found"))?;

        let files = state.files.entry(diff.file_type.into()).or_default();
        let created_at = files
            .get(&diff.filename)
            .map(|f| f.created_at)
            .unwrap_or_else(now_epoch);
        files.insert(
            diff.filename,
            StoredFile {
                content: content.to_string(),
                created_at,
            },
        );
        Ok(())
    }

    async fn reject_diff(&self, diff_id: &str) -> Result<(), ClientError> {
        self.state
            .lock()
            .await
            .diffs
            .remove(diff_id)
            .map(|_| ())
            .ok_or_else(|| ClientError::not_found("Diff not found"))
    }
}

#[async_trait]
impl FilesApi for InMemoryBackend {
    async fn list_files(&self, kind: FileKind) -> Result<Vec<FileInfo>, ClientError> {
        let state = self.state.lock().await;
        Ok(state
            .files
            .get(&kind)
            .map(|files| {
                files
                    .iter()
                    .map(|(name, file)| file.info(kind, name))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_file(&self, kind: FileKind, filename: &str) -> Result<String, ClientError> {
        self.file_content(kind, filename)
            .await
            .ok_or_else(|| ClientError::not_found("File not found"))
    }

    async fn save_file(
        &self,
        kind: FileKind,
        filename: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        match kind {
            FileKind::BrandData => {
                if !filename.ends_with(".json") {
                    return Err(bad_request("Filename must end with .json"));
                }
                serde_json::from_str::<serde_json::Value>(content)
                    .map_err(|_| bad_request("Invalid JSON content"))?;
            }
            FileKind::Brief | FileKind::Draft => {
                if !filename.ends_with(".md") {
                    return Err(bad_request("Filename must end with .md"));
                }
            }
        }
        self.put_file(kind, filename, content).await;
        Ok(())
    }
}

#[async_trait]
impl LogTransport for InMemoryBackend {
    async fn open_log_stream(&self, job_id: &str) -> Result<FrameStream, ClientError> {
        let rx = self
            .state
            .lock()
            .await
            .pending_feeds
            .remove(job_id)
            .ok_or_else(|| ClientError::not_found("Log file not found"))?;

        self.opened_streams.fetch_add(1, Ordering::SeqCst);
        Ok(TrackedFrames {
            inner: UnboundedReceiverStream::new(rx),
            closed: Arc::clone(&self.closed_streams),
        }
        .boxed())
    }
}

/// Frame stream that counts its own teardown.
struct TrackedFrames {
    inner: UnboundedReceiverStream<FrameResult>,
    closed: Arc<AtomicUsize>,
}

impl Stream for TrackedFrames {
    type Item = FrameResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for TrackedFrames {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sending side of an in-memory log channel.
#[derive(Clone)]
pub struct LogFeed {
    tx: mpsc::UnboundedSender<FrameResult>,
}

impl LogFeed {
    /// Emit a `log` event. Returns `false` once the channel is closed.
    pub fn log(&self, message: &str) -> bool {
        let data = serde_json::json!({ "message": message }).to_string();
        self.frame(SseFrame::new(EVENT_LOG, data))
    }

    pub fn complete(&self, payload: serde_json::Value) -> bool {
        self.frame(SseFrame::new(EVENT_COMPLETE, payload.to_string()))
    }

    pub fn server_error(&self, message: &str) -> bool {
        let data = serde_json::json!({ "message": message }).to_string();
        self.frame(SseFrame::new(EVENT_ERROR, data))
    }

    pub fn frame(&self, frame: SseFrame) -> bool {
        self.tx.send(Ok(frame)).is_ok()
    }

    /// Fail the transport, as a dropped connection would.
    pub fn transport_error(&self, message: &str) -> bool {
        self.tx
            .send(Err(ClientError::Api {
                status: 502,
                body: message.to_string(),
            }))
            .is_ok()
    }

    /// The reading side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
