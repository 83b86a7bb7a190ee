//! Backend seams and wire types.
//!
//! Each concern gets its own trait so components only depend on what
//! they call. [`HttpBackend`](crate::http::HttpBackend) and
//! [`InMemoryBackend`](crate::memory::InMemoryBackend) implement all of
//! them.

use async_trait::async_trait;
use contentflow_core::diff::Diff;
use contentflow_core::files::{FileInfo, FileKind};
use contentflow_core::job::{Job, JobPatch, JobStatus, JobType};
use contentflow_core::sse::SseFrame;
use contentflow_core::types::{BatchId, DiffId, JobId};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Decoded frames of one job's log channel. Dropping it closes the channel.
pub type FrameStream = BoxStream<'static, Result<SseFrame, ClientError>>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Response to a single-job submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAck {
    pub job_id: JobId,
}

/// Response to a batch submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchAck {
    pub batch_id: BatchId,
    /// One id per submitted entry, in submission order.
    pub job_ids: Vec<JobId>,
    pub total_jobs: usize,
    #[serde(default)]
    pub message: String,
}

/// `GET /jobs/{id}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub diff_id: Option<DiffId>,
}

impl JobStatusReport {
    /// Fields a poll result is allowed to change on a tracked job.
    pub fn to_patch(&self) -> JobPatch {
        JobPatch {
            status: Some(self.status),
            queue_position: self.queue_position,
            output_files: Some(self.output_files.clone()),
            diff_id: self.diff_id.clone(),
        }
    }

    pub fn into_job(self) -> Job {
        let mut job = Job::new(self.id, self.job_type, self.params).with_status(self.status);
        if self.status == JobStatus::Queued {
            job.queue_position = self.queue_position;
        }
        job.batch_id = self.batch_id;
        job.output_files = self.output_files;
        job.diff_id = self.diff_id;
        job
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<FileInfo>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

/// Route for submitting a single job, relative to the API base.
pub fn submit_path(job_type: JobType) -> &'static str {
    match job_type {
        JobType::BrandData => "brand-data/generate",
        JobType::Brief => "briefs/generate",
        JobType::Draft => "drafts/generate",
        JobType::BriefEdit => "briefs/edit",
        JobType::DraftEdit => "drafts/edit",
    }
}

/// Route for batch submission; only briefs and drafts are batchable.
pub fn batch_path(job_type: JobType) -> Result<&'static str, ClientError> {
    match job_type {
        JobType::Brief => Ok("briefs/generate/batch"),
        JobType::Draft => Ok("drafts/generate/batch"),
        other => Err(ClientError::Unsupported(format!(
            "batch submission of {other} jobs"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobsApi: Send + Sync {
    async fn submit(
        &self,
        job_type: JobType,
        params: &serde_json::Value,
    ) -> Result<JobAck, ClientError>;

    /// Submit `entries` as `{"<field>": [...]}` in one request.
    async fn submit_batch(
        &self,
        job_type: JobType,
        field: &str,
        entries: Vec<serde_json::Value>,
    ) -> Result<BatchAck, ClientError>;

    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, ClientError>;
}

#[async_trait]
pub trait DiffApi: Send + Sync {
    async fn get_diff(&self, diff_id: &str) -> Result<Diff, ClientError>;

    /// Overwrite the diff's file with `content` and invalidate the diff.
    async fn approve_diff(&self, diff_id: &str, content: &str) -> Result<(), ClientError>;

    /// Invalidate the diff without touching the file.
    async fn reject_diff(&self, diff_id: &str) -> Result<(), ClientError>;
}

#[async_trait]
pub trait FilesApi: Send + Sync {
    async fn list_files(&self, kind: FileKind) -> Result<Vec<FileInfo>, ClientError>;

    async fn read_file(&self, kind: FileKind, filename: &str) -> Result<String, ClientError>;

    /// Manual-edit path: replace the file content outright.
    async fn save_file(
        &self,
        kind: FileKind,
        filename: &str,
        content: &str,
    ) -> Result<(), ClientError>;
}

#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn open_log_stream(&self, job_id: &str) -> Result<FrameStream, ClientError>;
}
