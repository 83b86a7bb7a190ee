//! Scrollback buffer for a job's log view.

use crate::types::JobId;

/// Log lines of one job plus the scroll position of the view.
///
/// While following, the window is pinned to the newest lines. Pausing
/// freezes the window where it is; resuming jumps back to the bottom.
#[derive(Debug, Clone)]
pub struct LogTail {
    lines: Vec<String>,
    following: bool,
    /// Number of lines visible when the view was paused.
    anchor: usize,
}

impl Default for LogTail {
    fn default() -> Self {
        Self::new()
    }
}

impl LogTail {
    pub fn new() -> Self {
        Self {
            lines: Vec::new(),
            following: true,
            anchor: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines.extend(lines.into_iter().map(Into::into));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    pub fn pause(&mut self) {
        if self.following {
            self.following = false;
            self.anchor = self.lines.len();
        }
    }

    pub fn resume(&mut self) {
        self.following = true;
    }

    /// Lines arrived since the view was paused.
    pub fn unseen(&self) -> usize {
        if self.following {
            0
        } else {
            self.lines.len() - self.anchor
        }
    }

    /// The last `height` lines up to the current scroll position.
    pub fn visible(&self, height: usize) -> &[String] {
        let end = if self.following {
            self.lines.len()
        } else {
            self.anchor
        };
        let start = end.saturating_sub(height);
        &self.lines[start..end]
    }

    /// Full log, one line per row, newline-terminated.
    pub fn export_text(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn download_name(job_id: &JobId) -> String {
        format!("job-{job_id}-logs.txt")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.anchor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_newest_lines() {
        let mut tail = LogTail::new();
        tail.extend(["a", "b", "c"]);
        assert_eq!(tail.visible(2), &["b".to_string(), "c".to_string()]);
        assert_eq!(tail.visible(10).len(), 3);
    }

    #[test]
    fn paused_window_stays_put() {
        let mut tail = LogTail::new();
        tail.extend(["a", "b"]);
        tail.pause();
        tail.extend(["c", "d"]);

        assert_eq!(tail.visible(2), &["a".to_string(), "b".to_string()]);
        assert_eq!(tail.unseen(), 2);

        tail.resume();
        assert_eq!(tail.visible(2), &["c".to_string(), "d".to_string()]);
        assert_eq!(tail.unseen(), 0);
    }

    #[test]
    fn export_and_filename() {
        let mut tail = LogTail::new();
        tail.extend(["step1", "step2"]);
        assert_eq!(tail.export_text(), "step1\nstep2\n");
        assert_eq!(LogTail::download_name(&"42".to_string()), "job-42-logs.txt");
    }
}
