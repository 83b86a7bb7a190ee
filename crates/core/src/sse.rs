//! Incremental Server-Sent Events decoder for job log channels.
//!
//! The backend emits named events over `text/event-stream`:
//!
//! ```text
//! event: log
//! data: {"message": "step1"}
//!
//! event: complete
//! data: {"job_id": "42", "status": "completed", "output_files": []}
//! ```
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::push`] buffers partial
//! lines and returns every frame completed by the chunk.

use serde::Deserialize;

/// Named event carrying one log line.
pub const EVENT_LOG: &str = "log";

/// Named event marking successful end of the stream.
pub const EVENT_COMPLETE: &str = "complete";

/// Named event reporting a server-side stream failure.
pub const EVENT_ERROR: &str = "error";

/// Event name used when a frame has no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Payload of a `log` event.
#[derive(Debug, Clone, Deserialize)]
pub struct LogPayload {
    pub message: String,
}

/// Extract the log line from a `log` event's data.
pub fn parse_log_message(data: &str) -> Result<String, serde_json::Error> {
    serde_json::from_str::<LogPayload>(data).map(|p| p.message)
}

/// Line-oriented SSE parser state.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect the frames it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.line_buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(newline) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.line_buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush at end of stream.
    ///
    /// A trailing event that was never terminated by a blank line is
    /// still dispatched.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.line_buffer.is_empty() {
            let rest = std::mem::take(&mut self.line_buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.process_line(line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // `retry:` only matters for auto-reconnect, which log channels never do.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseFrame {
            event: self
                .event
                .take()
                .unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}
