//! Submission payloads, the batch form, and batch preparation.
//!
//! Preparation is a two-step typestate: [`BatchForm::prepare`] drops
//! incomplete entries and yields a [`PreparedBatch`]; only a
//! [`ConfirmedBatch`] can be submitted. When entries were dropped the
//! caller has to call [`PreparedBatch::confirm`] explicitly.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::diff::FileType;
use crate::error::CoreError;
use crate::job::JobType;

/// Maximum number of entries in one batch submission.
pub const MAX_BATCH_SIZE: usize = 50;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A payload that can be submitted as a single backend job.
pub trait SubmissionPayload:
    Serialize + Clone + Default + Validate + std::fmt::Debug + Send + Sync + 'static
{
    fn job_type(&self) -> JobType;

    /// All required fields are filled in.
    fn is_complete(&self) -> bool {
        self.validate().is_ok()
    }
}

/// A payload the backend accepts in batch form.
pub trait BatchPayload: SubmissionPayload {
    /// Job type shared by every entry of the batch.
    const BATCH_JOB_TYPE: JobType;
    /// Name of the array field in the batch request body.
    const BATCH_FIELD: &'static str;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BrandDataRequest {
    #[validate(custom(function = "not_blank"))]
    pub brand_name: String,
    #[validate(custom(function = "has_url"))]
    pub urls: Vec<String>,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// At least one URL, and no blank ones.
fn has_url(urls: &[String]) -> Result<(), ValidationError> {
    if urls.is_empty() || urls.iter().any(|u| u.trim().is_empty()) {
        return Err(ValidationError::new("blank_url"));
    }
    Ok(())
}

impl SubmissionPayload for BrandDataRequest {
    fn job_type(&self) -> JobType {
        JobType::BrandData
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BriefRequest {
    #[validate(length(min = 1))]
    pub title: String,
    #[validate(length(min = 1))]
    pub primary_keyword: String,
    pub secondary_keywords: String,
    /// Brand data filename the brief is built from.
    #[validate(length(min = 1))]
    pub brand_data: String,
}

impl SubmissionPayload for BriefRequest {
    fn job_type(&self) -> JobType {
        JobType::Brief
    }
}

impl BatchPayload for BriefRequest {
    const BATCH_JOB_TYPE: JobType = JobType::Brief;
    const BATCH_FIELD: &'static str = "briefs";
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DraftRequest {
    #[validate(length(min = 1))]
    pub brief_filename: String,
    #[validate(length(min = 1))]
    pub brand_data_filename: String,
}

impl SubmissionPayload for DraftRequest {
    fn job_type(&self) -> JobType {
        JobType::Draft
    }
}

impl BatchPayload for DraftRequest {
    const BATCH_JOB_TYPE: JobType = JobType::Draft;
    const BATCH_FIELD: &'static str = "drafts";
}

/// AI edit of an existing brief or draft; completes with a diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct EditRequest {
    #[serde(skip)]
    pub file_type: FileType,
    #[validate(length(min = 1))]
    pub filename: String,
    #[validate(length(min = 1))]
    pub instructions: String,
}

impl SubmissionPayload for EditRequest {
    fn job_type(&self) -> JobType {
        match self.file_type {
            FileType::Brief => JobType::BriefEdit,
            FileType::Draft => JobType::DraftEdit,
        }
    }
}

// ---------------------------------------------------------------------------
// Preparation typestate
// ---------------------------------------------------------------------------

/// Complete entries picked out of a form, pending confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch<E> {
    entries: Vec<E>,
    skipped: usize,
}

impl<E: BatchPayload> PreparedBatch<E> {
    /// Filter out incomplete entries and enforce the batch size limits.
    pub fn from_entries(all: Vec<E>) -> Result<Self, CoreError> {
        let total = all.len();
        let entries: Vec<E> = all.into_iter().filter(|e| e.is_complete()).collect();

        if entries.is_empty() {
            return Err(CoreError::Validation(
                "Please fill in at least one complete entry".to_string(),
            ));
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(CoreError::Validation(format!(
                "Maximum {MAX_BATCH_SIZE} entries per batch, got {}",
                entries.len()
            )));
        }

        Ok(Self {
            skipped: total - entries.len(),
            entries,
        })
    }

    /// Number of incomplete entries that will not be submitted.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn needs_confirmation(&self) -> bool {
        self.skipped > 0
    }

    /// The user accepted that skipped entries are discarded.
    pub fn confirm(self) -> ConfirmedBatch<E> {
        ConfirmedBatch {
            entries: self.entries,
        }
    }

    /// Convert without user interaction; fails if anything was skipped.
    pub fn into_confirmed(self) -> Result<ConfirmedBatch<E>, CoreError> {
        if self.needs_confirmation() {
            return Err(CoreError::Validation(format!(
                "{} entr{} have missing fields and need confirmation to be skipped",
                self.skipped,
                if self.skipped == 1 { "y" } else { "ies" }
            )));
        }
        Ok(self.confirm())
    }
}

/// A batch ready for submission. Entries are complete and in form order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedBatch<E> {
    entries: Vec<E>,
}

impl<E> ConfirmedBatch<E> {
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<E> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Batch form
// ---------------------------------------------------------------------------

/// Editable list of batch entries plus the in-flight flag.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchForm<E> {
    entries: Vec<E>,
    submitting: bool,
}

impl<E: BatchPayload> Default for BatchForm<E> {
    fn default() -> Self {
        Self {
            entries: vec![E::default()],
            submitting: false,
        }
    }
}

impl<E: BatchPayload> BatchForm<E> {
    pub fn entries(&self) -> &[E] {
        &self.entries
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    /// Entries that would be submitted right now.
    pub fn complete_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_complete()).count()
    }

    /// Append a blank entry; returns its index.
    pub fn add_entry(&mut self) -> Result<usize, CoreError> {
        self.ensure_editable()?;
        if self.entries.len() >= MAX_BATCH_SIZE {
            return Err(CoreError::Validation(format!(
                "A batch holds at most {MAX_BATCH_SIZE} entries"
            )));
        }
        self.entries.push(E::default());
        Ok(self.entries.len() - 1)
    }

    pub fn remove_entry(&mut self, index: usize) -> Result<E, CoreError> {
        self.ensure_editable()?;
        if self.entries.len() == 1 {
            return Err(CoreError::Validation(
                "A batch must keep at least one entry".to_string(),
            ));
        }
        self.check_index(index)?;
        Ok(self.entries.remove(index))
    }

    pub fn update_entry(&mut self, index: usize, entry: E) -> Result<(), CoreError> {
        self.edit_entry(index, |e| *e = entry)
    }

    pub fn edit_entry(&mut self, index: usize, edit: impl FnOnce(&mut E)) -> Result<(), CoreError> {
        self.ensure_editable()?;
        self.check_index(index)?;
        edit(&mut self.entries[index]);
        Ok(())
    }

    pub fn prepare(&self) -> Result<PreparedBatch<E>, CoreError> {
        PreparedBatch::from_entries(self.entries.clone())
    }

    /// Mark the form as in flight. Editing is refused until
    /// [`end_submit`](Self::end_submit) or [`reset`](Self::reset).
    pub fn begin_submit(&mut self) -> Result<(), CoreError> {
        if self.submitting {
            return Err(CoreError::Conflict(
                "A batch submission is already in flight".to_string(),
            ));
        }
        self.submitting = true;
        Ok(())
    }

    /// Leave the in-flight state but keep the entries (failure or abandon).
    pub fn end_submit(&mut self) {
        self.submitting = false;
    }

    /// Back to a single blank entry, not submitting.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn ensure_editable(&self) -> Result<(), CoreError> {
        if self.submitting {
            return Err(CoreError::Conflict(
                "The form cannot be edited while a batch is submitting".to_string(),
            ));
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), CoreError> {
        if index >= self.entries.len() {
            return Err(CoreError::NotFound {
                entity: "batch entry",
                id: index.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn draft(brief: &str, brand: &str) -> DraftRequest {
        DraftRequest {
            brief_filename: brief.into(),
            brand_data_filename: brand.into(),
        }
    }

    #[test]
    fn completeness_follows_required_fields() {
        assert!(draft("b.md", "brand.json").is_complete());
        assert!(!draft("", "brand.json").is_complete());
        assert!(!BriefRequest::default().is_complete());

        let brief = BriefRequest {
            title: "Title".into(),
            primary_keyword: "kw".into(),
            secondary_keywords: String::new(),
            brand_data: "brand.json".into(),
        };
        assert!(brief.is_complete(), "secondary keywords are optional");

        let brand = BrandDataRequest {
            brand_name: "Acme".into(),
            urls: vec![],
        };
        assert!(!brand.is_complete());
    }

    #[test]
    fn whitespace_only_brand_data_is_incomplete() {
        let brand = |name: &str, urls: &[&str]| BrandDataRequest {
            brand_name: name.into(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
        };
        assert!(brand("Acme", &["https://acme.test"]).is_complete());
        assert!(!brand("   ", &["https://acme.test"]).is_complete());
        assert!(!brand("Acme", &[" \t"]).is_complete());
        assert!(!brand("Acme", &["https://acme.test", ""]).is_complete());
    }

    #[test]
    fn prepare_filters_incomplete_entries() {
        let entries = vec![
            draft("a.md", "x.json"),
            draft("", "x.json"),
            draft("b.md", "x.json"),
            draft("c.md", ""),
            draft("c.md", "x.json"),
        ];
        let prepared = PreparedBatch::from_entries(entries).unwrap();
        assert_eq!(prepared.len(), 3);
        assert_eq!(prepared.skipped(), 2);
        assert!(prepared.needs_confirmation());
    }

    #[test]
    fn unconfirmed_skip_is_rejected() {
        let prepared =
            PreparedBatch::from_entries(vec![draft("a.md", "x.json"), DraftRequest::default()])
                .unwrap();
        assert_matches!(prepared.clone().into_confirmed(), Err(CoreError::Validation(_)));

        let confirmed = prepared.confirm();
        assert_eq!(confirmed.entries(), &[draft("a.md", "x.json")]);
    }

    #[test]
    fn fully_complete_batch_needs_no_confirmation() {
        let prepared = PreparedBatch::from_entries(vec![draft("a.md", "x.json")]).unwrap();
        assert_eq!(prepared.into_confirmed().unwrap().len(), 1);
    }

    #[test]
    fn empty_batch_is_invalid() {
        let err = PreparedBatch::<DraftRequest>::from_entries(vec![DraftRequest::default()])
            .unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
    }

    #[test]
    fn batch_over_limit_is_invalid() {
        let entries = vec![draft("a.md", "x.json"); MAX_BATCH_SIZE + 1];
        assert_matches!(
            PreparedBatch::from_entries(entries),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn form_caps_entries_and_keeps_one() {
        let mut form = BatchForm::<DraftRequest>::default();
        assert_matches!(form.remove_entry(0), Err(CoreError::Validation(_)));

        for _ in 1..MAX_BATCH_SIZE {
            form.add_entry().unwrap();
        }
        assert_eq!(form.entries().len(), MAX_BATCH_SIZE);
        assert_matches!(form.add_entry(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn form_is_locked_while_submitting() {
        let mut form = BatchForm::<DraftRequest>::default();
        form.update_entry(0, draft("a.md", "x.json")).unwrap();
        form.begin_submit().unwrap();

        assert_matches!(form.add_entry(), Err(CoreError::Conflict(_)));
        assert_matches!(form.begin_submit(), Err(CoreError::Conflict(_)));

        form.end_submit();
        assert_eq!(form.complete_count(), 1, "entries survive end_submit");
        form.add_entry().unwrap();
    }

    #[test]
    fn reset_restores_single_blank_entry() {
        let mut form = BatchForm::<BriefRequest>::default();
        form.add_entry().unwrap();
        form.edit_entry(1, |e| e.title = "T".into()).unwrap();
        form.begin_submit().unwrap();

        form.reset();
        assert_eq!(form, BatchForm::default());
        assert_eq!(form.entries().len(), 1);
        assert!(!form.is_submitting());
    }

    #[test]
    fn edit_request_type_follows_file_type() {
        let brief = EditRequest {
            file_type: FileType::Brief,
            ..Default::default()
        };
        assert_eq!(brief.job_type(), JobType::BriefEdit);
        assert_eq!(EditRequest::default().job_type(), JobType::DraftEdit);
    }
}
