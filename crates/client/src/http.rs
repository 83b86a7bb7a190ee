//! HTTP backend built on [`reqwest`].
//!
//! Ordinary requests carry the configured timeout. The log stream
//! request does not, since a healthy channel stays open for as long as
//! the job runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use contentflow_core::diff::Diff;
use contentflow_core::files::{FileInfo, FileKind};
use contentflow_core::job::JobType;
use contentflow_core::sse::{SseDecoder, SseFrame};
use futures::{Stream, StreamExt};
use serde::Deserialize;

use crate::api::{
    batch_path, submit_path, BatchAck, DiffApi, FileListResponse, FilesApi, FrameStream, JobAck,
    JobStatusReport, JobsApi, LogTransport,
};
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Client for one backend instance.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    api_url: String,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ContentResponse {
    content: String,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(
            client,
            config.api_url.clone(),
            config.request_timeout,
        ))
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(
        client: reqwest::Client,
        api_url: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).timeout(self.request_timeout)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).timeout(self.request_timeout)
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.put(self.url(path)).timeout(self.request_timeout)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ClientError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    ///
    /// The body is read as bytes first so that a malformed payload is
    /// reported as [`ClientError::Decode`] rather than a transport error.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ClientError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl JobsApi for HttpBackend {
    async fn submit(
        &self,
        job_type: JobType,
        params: &serde_json::Value,
    ) -> Result<JobAck, ClientError> {
        let response = self.post(submit_path(job_type)).json(params).send().await?;
        Self::parse_response(response).await
    }

    async fn submit_batch(
        &self,
        job_type: JobType,
        field: &str,
        entries: Vec<serde_json::Value>,
    ) -> Result<BatchAck, ClientError> {
        let path = batch_path(job_type)?;
        let mut body = serde_json::Map::new();
        body.insert(field.to_string(), serde_json::Value::Array(entries));

        let response = self.post(path).json(&body).send().await?;
        Self::parse_response(response).await
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, ClientError> {
        let response = self.get(&format!("jobs/{job_id}")).send().await?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl DiffApi for HttpBackend {
    async fn get_diff(&self, diff_id: &str) -> Result<Diff, ClientError> {
        let response = self.get(&format!("diffs/{diff_id}")).send().await?;
        let mut diff: Diff = Self::parse_response(response).await?;
        if diff.diff_id.is_empty() {
            diff.diff_id = diff_id.to_string();
        }
        Ok(diff)
    }

    async fn approve_diff(&self, diff_id: &str, content: &str) -> Result<(), ClientError> {
        let response = self
            .post(&format!("diffs/{diff_id}/approve"))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn reject_diff(&self, diff_id: &str) -> Result<(), ClientError> {
        let response = self.post(&format!("diffs/{diff_id}/reject")).send().await?;
        Self::check_status(response).await
    }
}

#[async_trait]
impl FilesApi for HttpBackend {
    async fn list_files(&self, kind: FileKind) -> Result<Vec<FileInfo>, ClientError> {
        let response = self.get(kind.path_segment()).send().await?;
        let listing: FileListResponse = Self::parse_response(response).await?;
        Ok(listing.files)
    }

    async fn read_file(&self, kind: FileKind, filename: &str) -> Result<String, ClientError> {
        let response = self
            .get(&format!("{}/{filename}", kind.path_segment()))
            .send()
            .await?;
        match kind {
            // Brand data is served as the JSON document itself.
            FileKind::BrandData => {
                let value: serde_json::Value = Self::parse_response(response).await?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
            FileKind::Brief | FileKind::Draft => {
                let body: ContentResponse = Self::parse_response(response).await?;
                Ok(body.content)
            }
        }
    }

    async fn save_file(
        &self,
        kind: FileKind,
        filename: &str,
        content: &str,
    ) -> Result<(), ClientError> {
        let content = match kind {
            FileKind::BrandData => serde_json::from_str::<serde_json::Value>(content)?,
            FileKind::Brief | FileKind::Draft => serde_json::Value::String(content.to_string()),
        };
        let response = self
            .put(&format!("{}/save", kind.path_segment()))
            .json(&serde_json::json!({ "filename": filename, "content": content }))
            .send()
            .await?;
        Self::check_status(response).await
    }
}

#[async_trait]
impl LogTransport for HttpBackend {
    async fn open_log_stream(&self, job_id: &str) -> Result<FrameStream, ClientError> {
        let response = self
            .client
            .get(self.url(&format!("jobs/{job_id}/logs")))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(sse_frames(response.bytes_stream().boxed()))
    }
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

struct FrameDecodeState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<SseFrame>,
    done: bool,
}

/// Turn a byte stream of `text/event-stream` into decoded frames.
///
/// A transport error is yielded once and ends the stream.
pub fn sse_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<ClientError> + Send,
{
    let state = FrameDecodeState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.decoder.push(chunk.as_ref());
                    state.pending.extend(frames);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    let trailing = state.decoder.finish();
                    state.pending.extend(trailing);
                }
            }
        }
    })
    .boxed()
}
