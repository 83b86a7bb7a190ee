use contentflow_core::error::CoreError;
use contentflow_core::types::JobId;

/// Errors from talking to the backend or from orchestration rules.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("Backend API error ({status}): {body}")]
    Api {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    #[error("Malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Job {0} is already being polled")]
    AlreadyPolling(JobId),

    #[error("Batch acknowledgment carried {received} job ids for {submitted} entries")]
    BatchMismatch { submitted: usize, received: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn not_found(body: impl Into<String>) -> Self {
        Self::Api {
            status: 404,
            body: body.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Api { status: 404, .. } | Self::Core(CoreError::NotFound { .. })
        )
    }
}
