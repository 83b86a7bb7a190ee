//! Diff review state machine.
//!
//! ```text
//! Loading ──ok──> Ready(Viewing) <──> Ready(Editing)
//!    │                 │
//!    └─err─> LoadFailed├── begin_approve ──> Approving ──ok──> Closed(Approved)
//!                      └── begin_reject  ──> Rejecting ──ok──> Closed(Rejected)
//! ```
//!
//! A failed approve or reject returns to `Ready(Viewing)` with
//! [`ReviewSession::last_error`] set. Only the proposed side is ever
//! mutated; the original content is kept exactly as loaded.

use serde::Serialize;

use crate::diff::{Diff, FileType};
use crate::error::CoreError;
use crate::types::DiffId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    Viewing,
    Editing,
}

/// Final verdict on a diff, carrying the file it applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved { filename: String, file_type: FileType },
    Rejected { filename: String, file_type: FileType },
}

impl ReviewDecision {
    pub fn filename(&self) -> &str {
        match self {
            Self::Approved { filename, .. } | Self::Rejected { filename, .. } => filename,
        }
    }

    pub fn file_type(&self) -> FileType {
        match self {
            Self::Approved { file_type, .. } | Self::Rejected { file_type, .. } => *file_type,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReviewPhase {
    Loading,
    LoadFailed { message: String },
    Ready { mode: ReviewMode },
    Approving,
    Rejecting,
    Closed { decision: ReviewDecision },
}

impl ReviewPhase {
    fn name(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::LoadFailed { .. } => "load_failed",
            Self::Ready {
                mode: ReviewMode::Viewing,
            } => "viewing",
            Self::Ready {
                mode: ReviewMode::Editing,
            } => "editing",
            Self::Approving => "approving",
            Self::Rejecting => "rejecting",
            Self::Closed { .. } => "closed",
        }
    }
}

/// Review of one diff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewSession {
    diff_id: DiffId,
    phase: ReviewPhase,
    diff: Option<Diff>,
    proposed: String,
    /// Proposed text when editing started, restored by `cancel_editing`.
    #[serde(skip)]
    edit_snapshot: Option<String>,
    last_error: Option<String>,
}

impl ReviewSession {
    /// A session that is about to load `diff_id`.
    pub fn new(diff_id: impl Into<DiffId>) -> Self {
        Self {
            diff_id: diff_id.into(),
            phase: ReviewPhase::Loading,
            diff: None,
            proposed: String::new(),
            edit_snapshot: None,
            last_error: None,
        }
    }

    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn phase(&self) -> &ReviewPhase {
        &self.phase
    }

    pub fn diff(&self) -> Option<&Diff> {
        self.diff.as_ref()
    }

    /// Original content as loaded. Read-only.
    pub fn original(&self) -> Option<&str> {
        self.diff.as_ref().map(|d| d.original_content.as_str())
    }

    /// Current proposed text, including local edits.
    pub fn proposed(&self) -> &str {
        &self.proposed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn mode(&self) -> Option<ReviewMode> {
        match self.phase {
            ReviewPhase::Ready { mode } => Some(mode),
            _ => None,
        }
    }

    /// Approve or reject is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, ReviewPhase::Approving | ReviewPhase::Rejecting)
    }

    /// Approve and reject are enabled.
    pub fn can_decide(&self) -> bool {
        matches!(self.phase, ReviewPhase::Ready { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, ReviewPhase::Closed { .. })
    }

    pub fn decision(&self) -> Option<&ReviewDecision> {
        match &self.phase {
            ReviewPhase::Closed { decision } => Some(decision),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Enter `Loading`. Valid initially and for retrying after a failure.
    pub fn begin_load(&mut self) -> Result<(), CoreError> {
        match self.phase {
            ReviewPhase::Loading | ReviewPhase::LoadFailed { .. } => {
                self.phase = ReviewPhase::Loading;
                self.last_error = None;
                Ok(())
            }
            _ => Err(self.refuse("load")),
        }
    }

    pub fn load_succeeded(&mut self, mut diff: Diff) -> Result<(), CoreError> {
        if self.phase != ReviewPhase::Loading {
            return Err(self.refuse("finish loading"));
        }
        if diff.diff_id.is_empty() {
            diff.diff_id = self.diff_id.clone();
        }
        self.proposed = diff.edited_content.clone();
        self.diff = Some(diff);
        self.phase = ReviewPhase::Ready {
            mode: ReviewMode::Viewing,
        };
        Ok(())
    }

    pub fn load_failed(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        if self.phase != ReviewPhase::Loading {
            return Err(self.refuse("fail loading"));
        }
        let message = message.into();
        self.last_error = Some(message.clone());
        self.phase = ReviewPhase::LoadFailed { message };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local editing
    // -----------------------------------------------------------------------

    pub fn start_editing(&mut self) -> Result<(), CoreError> {
        if self.mode() != Some(ReviewMode::Viewing) {
            return Err(self.refuse("start editing"));
        }
        self.edit_snapshot = Some(self.proposed.clone());
        self.phase = ReviewPhase::Ready {
            mode: ReviewMode::Editing,
        };
        Ok(())
    }

    /// Replace the proposed text. Only valid while editing.
    pub fn edit_proposed(&mut self, text: impl Into<String>) -> Result<(), CoreError> {
        if self.mode() != Some(ReviewMode::Editing) {
            return Err(self.refuse("edit"));
        }
        self.proposed = text.into();
        Ok(())
    }

    /// Leave editing and keep the changes.
    pub fn finish_editing(&mut self) -> Result<(), CoreError> {
        if self.mode() != Some(ReviewMode::Editing) {
            return Err(self.refuse("finish editing"));
        }
        self.edit_snapshot = None;
        self.phase = ReviewPhase::Ready {
            mode: ReviewMode::Viewing,
        };
        Ok(())
    }

    /// Leave editing and restore the text from before editing started.
    pub fn cancel_editing(&mut self) -> Result<(), CoreError> {
        if self.mode() != Some(ReviewMode::Editing) {
            return Err(self.refuse("cancel editing"));
        }
        if let Some(snapshot) = self.edit_snapshot.take() {
            self.proposed = snapshot;
        }
        self.phase = ReviewPhase::Ready {
            mode: ReviewMode::Viewing,
        };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// Enter `Approving` with `final_text` as the content to persist.
    ///
    /// Returns the filename the text must be written to.
    pub fn begin_approve(&mut self, final_text: impl Into<String>) -> Result<String, CoreError> {
        if !self.can_decide() {
            return Err(self.refuse("approve"));
        }
        let filename = self.loaded_filename()?;
        self.proposed = final_text.into();
        self.edit_snapshot = None;
        self.last_error = None;
        self.phase = ReviewPhase::Approving;
        Ok(filename)
    }

    pub fn begin_reject(&mut self) -> Result<String, CoreError> {
        if !self.can_decide() {
            return Err(self.refuse("reject"));
        }
        let filename = self.loaded_filename()?;
        self.edit_snapshot = None;
        self.last_error = None;
        self.phase = ReviewPhase::Rejecting;
        Ok(filename)
    }

    pub fn approve_succeeded(&mut self) -> Result<ReviewDecision, CoreError> {
        if self.phase != ReviewPhase::Approving {
            return Err(self.refuse("complete approval"));
        }
        let (filename, file_type) = self.loaded_file()?;
        let decision = ReviewDecision::Approved {
            filename,
            file_type,
        };
        self.phase = ReviewPhase::Closed {
            decision: decision.clone(),
        };
        Ok(decision)
    }

    pub fn reject_succeeded(&mut self) -> Result<ReviewDecision, CoreError> {
        if self.phase != ReviewPhase::Rejecting {
            return Err(self.refuse("complete rejection"));
        }
        let (filename, file_type) = self.loaded_file()?;
        let decision = ReviewDecision::Rejected {
            filename,
            file_type,
        };
        self.phase = ReviewPhase::Closed {
            decision: decision.clone(),
        };
        Ok(decision)
    }

    /// An approve or reject request failed; back to viewing for a retry.
    pub fn action_failed(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        if !self.is_busy() {
            return Err(self.refuse("fail an action"));
        }
        self.last_error = Some(message.into());
        self.phase = ReviewPhase::Ready {
            mode: ReviewMode::Viewing,
        };
        Ok(())
    }

    fn loaded_file(&self) -> Result<(String, FileType), CoreError> {
        self.diff
            .as_ref()
            .map(|d| (d.filename.clone(), d.file_type))
            .ok_or_else(|| CoreError::NotFound {
                entity: "diff",
                id: self.diff_id.clone(),
            })
    }

    fn loaded_filename(&self) -> Result<String, CoreError> {
        self.loaded_file().map(|(filename, _)| filename)
    }

    fn refuse(&self, action: &str) -> CoreError {
        CoreError::Conflict(format!(
            "cannot {action} diff {} while {}",
            self.diff_id,
            self.phase.name()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn loaded() -> ReviewSession {
        let mut session = ReviewSession::new("d1");
        session
            .load_succeeded(Diff {
                diff_id: String::new(),
                filename: "post.md".into(),
                file_type: FileType::Draft,
                original_content: "A".into(),
                edited_content: "B".into(),
            })
            .unwrap();
        session
    }

    #[test]
    fn load_fills_missing_diff_id() {
        let session = loaded();
        assert_eq!(session.diff().unwrap().diff_id, "d1");
        assert_eq!(session.mode(), Some(ReviewMode::Viewing));
        assert_eq!(session.proposed(), "B");
        assert_eq!(session.original(), Some("A"));
    }

    #[test]
    fn edit_requires_editing_mode() {
        let mut session = loaded();
        assert_matches!(session.edit_proposed("X"), Err(CoreError::Conflict(_)));

        session.start_editing().unwrap();
        session.edit_proposed("B2").unwrap();
        session.finish_editing().unwrap();
        assert_eq!(session.proposed(), "B2");
        assert_eq!(session.original(), Some("A"));
    }

    #[test]
    fn cancel_editing_reverts() {
        let mut session = loaded();
        session.start_editing().unwrap();
        session.edit_proposed("scratch").unwrap();
        session.cancel_editing().unwrap();
        assert_eq!(session.proposed(), "B");
        assert_eq!(session.mode(), Some(ReviewMode::Viewing));
    }

    #[test]
    fn approve_and_reject_are_exclusive() {
        let mut session = loaded();
        assert_eq!(session.begin_approve("B2").unwrap(), "post.md");
        assert!(session.is_busy());
        assert_matches!(session.begin_reject(), Err(CoreError::Conflict(_)));
        assert_matches!(session.begin_approve("B3"), Err(CoreError::Conflict(_)));
        assert_matches!(session.start_editing(), Err(CoreError::Conflict(_)));

        let decision = session.approve_succeeded().unwrap();
        assert!(decision.is_approved());
        assert_eq!(decision.filename(), "post.md");
        assert!(session.is_closed());
        assert_eq!(session.proposed(), "B2");
    }

    #[test]
    fn approve_while_editing_uses_final_text() {
        let mut session = loaded();
        session.start_editing().unwrap();
        session.edit_proposed("B2").unwrap();
        session.begin_approve("B2").unwrap();
        assert_eq!(session.proposed(), "B2");
    }

    #[test]
    fn failed_action_is_retryable() {
        let mut session = loaded();
        session.begin_reject().unwrap();
        session.action_failed("boom").unwrap();

        assert_eq!(session.mode(), Some(ReviewMode::Viewing));
        assert_eq!(session.last_error(), Some("boom"));

        session.begin_reject().unwrap();
        assert_eq!(session.last_error(), None);
        let decision = session.reject_succeeded().unwrap();
        assert_matches!(decision, ReviewDecision::Rejected { .. });
    }

    #[test]
    fn load_failure_allows_retry() {
        let mut session = ReviewSession::new("d9");
        session.load_failed("404").unwrap();
        assert_matches!(session.phase(), ReviewPhase::LoadFailed { message } if message == "404");
        assert_matches!(session.begin_approve("x"), Err(CoreError::Conflict(_)));

        session.begin_load().unwrap();
        assert_eq!(session.phase(), &ReviewPhase::Loading);
    }

    #[test]
    fn closed_session_refuses_everything() {
        let mut session = loaded();
        session.begin_reject().unwrap();
        session.reject_succeeded().unwrap();

        assert_matches!(session.begin_load(), Err(CoreError::Conflict(_)));
        assert_matches!(session.start_editing(), Err(CoreError::Conflict(_)));
        assert_matches!(session.action_failed("late"), Err(CoreError::Conflict(_)));
    }
}
