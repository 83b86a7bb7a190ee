//! Job model, status lattice, and partial updates.
//!
//! A job's status only ever moves forward: `queued -> running ->
//! {completed | failed}`. Skipping `running` is allowed (a job can be
//! observed for the first time after it already finished), but a
//! terminal status is never left once reached.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::files::FileKind;
use crate::types::{BatchId, DiffId, JobId};

// ---------------------------------------------------------------------------
// Job type
// ---------------------------------------------------------------------------

/// Kind of backend task a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BrandData,
    Brief,
    Draft,
    BriefEdit,
    DraftEdit,
}

impl JobType {
    /// Wire representation, identical to the serde form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrandData => "brand_data",
            Self::Brief => "brief",
            Self::Draft => "draft",
            Self::BriefEdit => "brief_edit",
            Self::DraftEdit => "draft_edit",
        }
    }

    /// Human-readable label for job cards.
    pub fn label(self) -> &'static str {
        match self {
            Self::BrandData => "Brand Data",
            Self::Brief => "Brief",
            Self::Draft => "Draft",
            Self::BriefEdit => "Brief Edit",
            Self::DraftEdit => "Draft Edit",
        }
    }

    /// Edit jobs finish with a diff awaiting human review.
    pub fn produces_diff(self) -> bool {
        matches!(self, Self::BriefEdit | Self::DraftEdit)
    }

    /// Listing that changes when a job of this type finishes.
    pub fn output_kind(self) -> FileKind {
        match self {
            Self::BrandData => FileKind::BrandData,
            Self::Brief | Self::BriefEdit => FileKind::Brief,
            Self::Draft | Self::DraftEdit => FileKind::Draft,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `completed` and `failed` are sticky; nothing follows them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` respects the monotonic chain.
    ///
    /// Re-observing the same status is always allowed so that duplicate
    /// poll results are harmless.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked backend job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    /// Echo of the submitted payload.
    pub params: serde_json::Value,
    pub batch_id: Option<BatchId>,
    /// Position in the backend queue; only meaningful while `queued`.
    pub queue_position: Option<u32>,
    /// Files produced by the job, as reported by the backend.
    #[serde(default)]
    pub output_files: Vec<String>,
    /// Diff awaiting review, set on completed edit jobs.
    #[serde(default)]
    pub diff_id: Option<DiffId>,
}

impl Job {
    pub fn new(id: impl Into<JobId>, job_type: JobType, params: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            job_type,
            status: JobStatus::Queued,
            params,
            batch_id: None,
            queue_position: None,
            output_files: Vec::new(),
            diff_id: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        if status != JobStatus::Queued {
            self.queue_position = None;
        }
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<BatchId>, queue_position: Option<u32>) -> Self {
        self.batch_id = Some(batch_id.into());
        if self.status == JobStatus::Queued {
            self.queue_position = queue_position;
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge a partial update into this job.
    ///
    /// Returns `Ok(true)` if anything changed. A patch whose status would
    /// move backwards is rejected as a whole and leaves the job untouched.
    pub fn apply(&mut self, patch: &JobPatch) -> Result<bool, CoreError> {
        let next_status = patch.status.unwrap_or(self.status);
        if !self.status.can_transition_to(next_status) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: next_status,
            });
        }

        let next_position = if next_status == JobStatus::Queued {
            patch.queue_position.or(self.queue_position)
        } else {
            None
        };

        let mut changed = false;
        if self.status != next_status {
            self.status = next_status;
            changed = true;
        }
        if self.queue_position != next_position {
            self.queue_position = next_position;
            changed = true;
        }
        if let Some(files) = &patch.output_files {
            if &self.output_files != files {
                self.output_files = files.clone();
                changed = true;
            }
        }
        if let Some(diff_id) = &patch.diff_id {
            if self.diff_id.as_ref() != Some(diff_id) {
                self.diff_id = Some(diff_id.clone());
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Partial update for a [`Job`]; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub queue_position: Option<u32>,
    pub output_files: Option<Vec<String>>,
    pub diff_id: Option<DiffId>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn job() -> Job {
        Job::new("j1", JobType::Draft, serde_json::json!({"brief_filename": "b.md"}))
    }

    #[test]
    fn forward_transitions_are_allowed() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Completed.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn running_cannot_go_back_to_queued() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn apply_rejects_regression_without_side_effects() {
        let mut j = job().with_status(JobStatus::Completed);
        let patch = JobPatch {
            status: Some(JobStatus::Running),
            output_files: Some(vec!["x.md".into()]),
            ..Default::default()
        };
        assert_matches!(
            j.apply(&patch),
            Err(CoreError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Running
            })
        );
        assert!(j.output_files.is_empty());
    }

    #[test]
    fn queue_position_cleared_once_running() {
        let mut j = job().with_batch("b1", Some(3));
        assert_eq!(j.queue_position, Some(3));

        let changed = j
            .apply(&JobPatch {
                status: Some(JobStatus::Queued),
                queue_position: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert!(changed);
        assert_eq!(j.queue_position, Some(1));

        j.apply(&JobPatch::status(JobStatus::Running)).unwrap();
        assert_eq!(j.queue_position, None);
    }

    #[test]
    fn duplicate_patch_reports_no_change() {
        let mut j = job().with_status(JobStatus::Running);
        assert!(!j.apply(&JobPatch::status(JobStatus::Running)).unwrap());
    }

    #[test]
    fn job_serializes_type_field() {
        let json = serde_json::to_value(job()).unwrap();
        assert_eq!(json["type"], "draft");
        assert_eq!(json["status"], "queued");
    }

    #[test]
    fn edit_types_produce_diffs() {
        assert!(JobType::BriefEdit.produces_diff());
        assert!(JobType::DraftEdit.produces_diff());
        assert!(!JobType::Draft.produces_diff());
        assert_eq!(JobType::BriefEdit.output_kind(), FileKind::Brief);
    }
}
