//! Live log channels for running jobs.
//!
//! [`LogStreamClient::subscribe`] opens a job's channel and returns a
//! [`LogSubscription`], a stream of [`LogEvent`]s that ends right after
//! the first terminal event (`Complete` or `Error`). There is no
//! automatic reconnect.
//!
//! A reader task sits between the transport and the subscriber so that
//! pausing, closing and the idle timeout can act while the subscriber
//! is not polling. The transport is dropped before the terminal event
//! is delivered, so by the time a subscriber sees `Complete` the channel
//! is already closed.

use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use contentflow_core::sse::{parse_log_message, SseFrame, EVENT_COMPLETE, EVENT_ERROR, EVENT_LOG};
use contentflow_core::types::JobId;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::{FrameStream, LogTransport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens to log lines that arrive while a subscription is paused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseMode {
    /// Hold them and deliver in order on resume.
    #[default]
    Buffer,
    /// Discard them; resuming only shows lines emitted afterwards.
    Drop,
}

impl FromStr for PauseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buffer" => Ok(Self::Buffer),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown pause mode '{other}' (expected buffer or drop)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogStreamConfig {
    pub pause_mode: PauseMode,
    /// Fail the channel after this long without any frame.
    pub idle_timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Terminal failure of a log channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogStreamError {
    #[error("log channel transport failed: {0}")]
    Transport(String),

    /// The backend sent an `error` event.
    #[error("log channel reported an error: {0}")]
    Server(String),

    #[error("log channel ended without a completion event")]
    Disconnected,

    #[error("no log activity for {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Line(String),
    /// Completion payload, e.g. `{"job_id", "status", "output_files"}`.
    Complete(serde_json::Value),
    Error(LogStreamError),
}

impl LogEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Line(_))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LogStreamClient {
    transport: Arc<dyn LogTransport>,
    config: LogStreamConfig,
}

impl LogStreamClient {
    pub fn new(transport: Arc<dyn LogTransport>, config: LogStreamConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &LogStreamConfig {
        &self.config
    }

    /// Open the log channel of `job_id`.
    pub fn subscribe(&self, job_id: impl Into<JobId>) -> LogSubscription {
        let job_id = job_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (paused_tx, paused_rx) = watch::channel(false);
        let control = LogControl {
            job_id: job_id.clone(),
            cancel: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
            detached: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(paused_tx),
        };

        let reader = Reader {
            job_id,
            config: self.config.clone(),
            control: control.clone(),
            paused: paused_rx,
            events: tx,
            buffer: Vec::new(),
            dropped: 0,
        };
        tokio::spawn(reader.run(Arc::clone(&self.transport)));

        LogSubscription {
            events: rx,
            control,
        }
    }

    /// Callback flavour of [`subscribe`](Self::subscribe).
    ///
    /// `on_log` fires once per line in emission order. Exactly one of
    /// `on_complete` or `on_error` fires, unless the handle is closed
    /// first, in which case neither does.
    pub fn open<L, C, E>(
        &self,
        job_id: impl Into<JobId>,
        mut on_log: L,
        on_complete: C,
        on_error: E,
    ) -> LogStreamHandle
    where
        L: FnMut(String) + Send + 'static,
        C: FnOnce(serde_json::Value) + Send + 'static,
        E: FnOnce(LogStreamError) + Send + 'static,
    {
        let mut subscription = self.subscribe(job_id);
        let control = subscription.control();

        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if subscription.control.is_detached() {
                    break;
                }
                match event {
                    LogEvent::Line(line) => on_log(line),
                    LogEvent::Complete(payload) => {
                        on_complete(payload);
                        break;
                    }
                    LogEvent::Error(e) => {
                        on_error(e);
                        break;
                    }
                }
            }
        });

        LogStreamHandle { control }
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Pause and close controls shared between a subscription and its reader.
#[derive(Clone)]
pub struct LogControl {
    job_id: JobId,
    cancel: CancellationToken,
    /// Set exactly once, by whoever tears the channel down.
    closed: Arc<AtomicBool>,
    /// Set by the subscriber's `close`; nothing is delivered afterwards.
    detached: Arc<AtomicBool>,
    paused: Arc<watch::Sender<bool>>,
}

impl LogControl {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Close the channel. No event is delivered after this returns, even
    /// one the reader had already queued.
    ///
    /// Returns `true` only for the call that actually closed it; later
    /// calls, and calls after a terminal event, return `false`.
    pub fn close(&self) -> bool {
        self.detached.store(true, Ordering::SeqCst);
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        tracing::info!(job_id = %self.job_id, "Log stream closed by subscriber");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Called by the reader when the channel ends on its own.
    fn mark_finished(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

/// Stream of one job's log events. Dropping it closes the channel.
pub struct LogSubscription {
    events: mpsc::UnboundedReceiver<LogEvent>,
    control: LogControl,
}

impl LogSubscription {
    pub fn control(&self) -> LogControl {
        self.control.clone()
    }

    pub fn job_id(&self) -> &str {
        self.control.job_id()
    }

    pub fn close(&self) -> bool {
        self.control.close()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }
}

impl Stream for LogSubscription {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.control.is_detached() {
            self.events.close();
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.control.close();
    }
}

/// Handle returned by [`LogStreamClient::open`]. Dropping it closes the
/// channel.
pub struct LogStreamHandle {
    control: LogControl,
}

impl LogStreamHandle {
    pub fn close(&self) -> bool {
        self.control.close()
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl Drop for LogStreamHandle {
    fn drop(&mut self) {
        self.control.close();
    }
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

struct Reader {
    job_id: JobId,
    config: LogStreamConfig,
    control: LogControl,
    paused: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<LogEvent>,
    /// Lines held back while paused in buffer mode.
    buffer: Vec<String>,
    /// Lines discarded while paused in drop mode.
    dropped: usize,
}

enum Step {
    Frame(Option<Result<SseFrame, crate::error::ClientError>>),
    PauseChanged,
    Idle,
    Closed,
}

impl Reader {
    async fn run(mut self, transport: Arc<dyn LogTransport>) {
        let opened = tokio::select! {
            _ = self.control.cancel.cancelled() => return,
            opened = transport.open_log_stream(&self.job_id) => opened,
        };

        let frames = match opened {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to open log stream");
                self.finish(None, LogEvent::Error(LogStreamError::Transport(e.to_string())));
                return;
            }
        };
        tracing::info!(job_id = %self.job_id, "Log stream opened");

        self.pump(frames).await;
    }

    async fn pump(&mut self, mut frames: FrameStream) {
        let mut last_activity = Instant::now();

        loop {
            let idle = self.config.idle_timeout;
            let step = tokio::select! {
                biased;
                _ = self.control.cancel.cancelled() => Step::Closed,
                changed = self.paused.changed() => match changed {
                    Ok(()) => Step::PauseChanged,
                    Err(_) => Step::Closed,
                },
                frame = frames.next() => Step::Frame(frame),
                _ = idle_deadline(last_activity, idle) => Step::Idle,
            };

            match step {
                Step::Closed => return,
                Step::PauseChanged => self.on_pause_changed(),
                Step::Idle => {
                    let timeout = idle.unwrap_or_default();
                    tracing::warn!(job_id = %self.job_id, ?timeout, "Log stream idle, closing");
                    self.finish(
                        Some(frames),
                        LogEvent::Error(LogStreamError::IdleTimeout(timeout)),
                    );
                    return;
                }
                Step::Frame(None) => {
                    tracing::warn!(job_id = %self.job_id, "Log stream ended without completion");
                    self.finish(Some(frames), LogEvent::Error(LogStreamError::Disconnected));
                    return;
                }
                Step::Frame(Some(Err(e))) => {
                    tracing::warn!(
                        job_id = %self.job_id,
                        error = %e,
                        "Log stream transport failed",
                    );
                    self.finish(
                        Some(frames),
                        LogEvent::Error(LogStreamError::Transport(e.to_string())),
                    );
                    return;
                }
                Step::Frame(Some(Ok(frame))) => {
                    last_activity = Instant::now();
                    if let Some(terminal) = self.on_frame(frame) {
                        self.finish(Some(frames), terminal);
                        return;
                    }
                }
            }
        }
    }

    /// Handle one frame; returns the terminal event if the frame ends the
    /// channel.
    fn on_frame(&mut self, frame: SseFrame) -> Option<LogEvent> {
        match frame.event.as_str() {
            EVENT_LOG => {
                match parse_log_message(&frame.data) {
                    Ok(line) => self.deliver_line(line),
                    Err(e) => {
                        tracing::warn!(
                            job_id = %self.job_id,
                            error = %e,
                            "Skipping malformed log event",
                        );
                    }
                }
                None
            }
            EVENT_COMPLETE => {
                let payload = serde_json::from_str(&frame.data)
                    .unwrap_or(serde_json::Value::String(frame.data));
                Some(LogEvent::Complete(payload))
            }
            EVENT_ERROR => {
                let message = parse_log_message(&frame.data).unwrap_or(frame.data);
                Some(LogEvent::Error(LogStreamError::Server(message)))
            }
            other => {
                tracing::trace!(job_id = %self.job_id, event = other, "Ignoring log stream frame");
                None
            }
        }
    }

    fn deliver_line(&mut self, line: String) {
        if !*self.paused.borrow() {
            let _ = self.events.send(LogEvent::Line(line));
            return;
        }
        match self.config.pause_mode {
            PauseMode::Buffer => self.buffer.push(line),
            PauseMode::Drop => self.dropped += 1,
        }
    }

    fn on_pause_changed(&mut self) {
        if *self.paused.borrow_and_update() {
            return;
        }
        if self.dropped > 0 {
            tracing::debug!(
                job_id = %self.job_id,
                dropped = self.dropped,
                "Discarded log lines while paused",
            );
            self.dropped = 0;
        }
        self.flush();
    }

    fn flush(&mut self) {
        for line in self.buffer.drain(..) {
            let _ = self.events.send(LogEvent::Line(line));
        }
    }

    /// Tear down the transport, then deliver buffered lines and the
    /// terminal event.
    fn finish(&mut self, frames: Option<FrameStream>, terminal: LogEvent) {
        drop(frames);
        if !self.control.mark_finished() {
            // Closed by the subscriber in the meantime.
            return;
        }
        tracing::info!(job_id = %self.job_id, terminal = ?terminal, "Log stream finished");
        self.flush();
        let _ = self.events.send(terminal);
    }
}

async fn idle_deadline(last_activity: Instant, idle: Option<Duration>) {
    match idle {
        Some(timeout) => tokio::time::sleep_until(last_activity + timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use tokio::sync::oneshot;

    use super::*;
    use crate::memory::InMemoryBackend;

    fn client(backend: &InMemoryBackend, config: LogStreamConfig) -> LogStreamClient {
        LogStreamClient::new(Arc::new(backend.clone()), config)
    }

    /// Let the reader task run until it has nothing left to do.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn lines_then_completion_then_end() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("42").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("42");

        feed.log("step1");
        feed.log("step2");
        feed.complete(serde_json::json!({"status": "completed"}));
        feed.log("late");

        assert_eq!(sub.next().await, Some(LogEvent::Line("step1".into())));
        assert_eq!(sub.next().await, Some(LogEvent::Line("step2".into())));
        assert_matches!(
            sub.next().await,
            Some(LogEvent::Complete(p)) if p["status"] == "completed"
        );
        assert_eq!(sub.next().await, None);

        assert_eq!(backend.closed_log_streams(), 1);
        assert!(!sub.close(), "already closed by completion");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("7").await;
        let sub = client(&backend, LogStreamConfig::default()).subscribe("7");
        settle().await;

        assert!(sub.close());
        assert!(!sub.close());
        feed.closed().await;
        assert_eq!(backend.closed_log_streams(), 1);
    }

    #[tokio::test]
    async fn close_drops_lines_already_queued() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("7").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("7");

        feed.log("a");
        feed.log("b");
        settle().await;

        assert!(sub.close());
        assert_eq!(sub.next().await, None);
        feed.closed().await;
    }

    #[tokio::test]
    async fn paused_lines_are_buffered_in_order() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("1");

        feed.log("a");
        assert_eq!(sub.next().await, Some(LogEvent::Line("a".into())));

        sub.pause();
        settle().await;
        feed.log("b");
        feed.log("c");
        settle().await;

        sub.resume();
        feed.log("d");
        assert_eq!(sub.next().await, Some(LogEvent::Line("b".into())));
        assert_eq!(sub.next().await, Some(LogEvent::Line("c".into())));
        assert_eq!(sub.next().await, Some(LogEvent::Line("d".into())));
    }

    #[tokio::test]
    async fn drop_mode_discards_paused_lines() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let config = LogStreamConfig {
            pause_mode: PauseMode::Drop,
            ..Default::default()
        };
        let mut sub = client(&backend, config).subscribe("1");

        sub.pause();
        settle().await;
        feed.log("missed");
        settle().await;
        sub.resume();
        settle().await;
        feed.log("seen");

        assert_eq!(sub.next().await, Some(LogEvent::Line("seen".into())));
    }

    #[tokio::test]
    async fn terminal_while_paused_flushes_buffer_first() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("1");

        sub.pause();
        settle().await;
        feed.log("held");
        feed.complete(serde_json::json!({}));

        assert_eq!(sub.next().await, Some(LogEvent::Line("held".into())));
        assert_matches!(sub.next().await, Some(LogEvent::Complete(_)));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn stream_end_without_completion_is_disconnected() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("1");

        feed.log("partial");
        drop(feed);

        assert_eq!(sub.next().await, Some(LogEvent::Line("partial".into())));
        assert_eq!(
            sub.next().await,
            Some(LogEvent::Error(LogStreamError::Disconnected))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn server_error_event_and_malformed_lines() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("1");

        feed.frame(SseFrame::new(EVENT_LOG, "not json"));
        feed.frame(SseFrame::new("ping", "{}"));
        feed.server_error("Log file not found");

        assert_eq!(
            sub.next().await,
            Some(LogEvent::Error(LogStreamError::Server(
                "Log file not found".into()
            )))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn unknown_job_fails_to_open() {
        let backend = InMemoryBackend::new();
        let mut sub = client(&backend, LogStreamConfig::default()).subscribe("missing");
        assert_matches!(
            sub.next().await,
            Some(LogEvent::Error(LogStreamError::Transport(_)))
        );
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes_silent_channel() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("1").await;
        let config = LogStreamConfig {
            idle_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let mut sub = client(&backend, config).subscribe("1");

        feed.log("one");
        assert_eq!(sub.next().await, Some(LogEvent::Line("one".into())));
        assert_eq!(
            sub.next().await,
            Some(LogEvent::Error(LogStreamError::IdleTimeout(
                Duration::from_secs(60)
            )))
        );
        assert!(feed.is_closed());
    }

    #[tokio::test]
    async fn callbacks_fire_in_order() {
        let backend = InMemoryBackend::new();
        let feed = backend.log_feed("42").await;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        let sink = Arc::clone(&lines);
        let handle = client(&backend, LogStreamConfig::default()).open(
            "42",
            move |line| sink.lock().unwrap().push(line),
            move |payload| {
                let _ = done_tx.send(payload);
            },
            |e| panic!("unexpected error: {e}"),
        );

        feed.log("step1");
        feed.log("step2");
        feed.complete(serde_json::json!({"status": "completed"}));

        let payload = done_rx.await.unwrap();
        assert_eq!(payload["status"], "completed");
        assert_eq!(*lines.lock().unwrap(), vec!["step1", "step2"]);
        assert!(handle.is_closed());
        assert!(!handle.close());
    }
}
