use std::str::FromStr;
use std::time::Duration;

use crate::error::ClientError;
use crate::logs::{LogStreamConfig, PauseMode};
use crate::poller::PollConfig;

/// Default backend base URL, including the `/api` prefix.
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Backend base URL without a trailing slash.
    pub api_url: String,
    /// Timeout for ordinary requests. Log streams are exempt.
    pub request_timeout: Duration,
    pub poll: PollConfig,
    pub log_stream: LogStreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            poll: PollConfig::default(),
            log_stream: LogStreamConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                     |
    /// |------------------------------------|-----------------------------|
    /// | `CONTENTFLOW_API_URL`              | `http://localhost:8000/api` |
    /// | `CONTENTFLOW_REQUEST_TIMEOUT_SECS` | `30`                        |
    /// | `CONTENTFLOW_POLL_INTERVAL_MS`     | `2000`                      |
    /// | `CONTENTFLOW_POLL_MAX_BACKOFF_SECS`| `30`                        |
    /// | `CONTENTFLOW_POLL_MAX_FAILURES`    | `30` (`0` = never give up)  |
    /// | `CONTENTFLOW_LOG_PAUSE_MODE`       | `buffer` (`buffer`/`drop`)  |
    /// | `CONTENTFLOW_LOG_IDLE_TIMEOUT_SECS`| unset (no idle timeout)     |
    pub fn from_env() -> Result<Self, ClientError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClientError> {
        let api_url = lookup("CONTENTFLOW_API_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let request_timeout_secs: u64 = parse_var(&lookup, "CONTENTFLOW_REQUEST_TIMEOUT_SECS", 30)?;
        let poll_interval_ms: u64 = parse_var(&lookup, "CONTENTFLOW_POLL_INTERVAL_MS", 2000)?;
        let max_backoff_secs: u64 = parse_var(&lookup, "CONTENTFLOW_POLL_MAX_BACKOFF_SECS", 30)?;
        let max_failures: u32 = parse_var(&lookup, "CONTENTFLOW_POLL_MAX_FAILURES", 30)?;
        let pause_mode: PauseMode =
            parse_var(&lookup, "CONTENTFLOW_LOG_PAUSE_MODE", PauseMode::default())?;
        let idle_timeout = lookup("CONTENTFLOW_LOG_IDLE_TIMEOUT_SECS")
            .map(|raw| parse_value::<u64>("CONTENTFLOW_LOG_IDLE_TIMEOUT_SECS", &raw))
            .transpose()?
            .map(Duration::from_secs);

        if poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "CONTENTFLOW_POLL_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            api_url,
            request_timeout: Duration::from_secs(request_timeout_secs),
            poll: PollConfig {
                interval: Duration::from_millis(poll_interval_ms),
                max_backoff: Duration::from_secs(max_backoff_secs),
                max_consecutive_failures: (max_failures > 0).then_some(max_failures),
            },
            log_stream: LogStreamConfig {
                pause_mode,
                idle_timeout,
            },
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ClientError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ClientError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ClientError::Config(format!("{key}={raw:?}: {e}")))
}
