//! Async driver for [`ReviewSession`].
//!
//! The session is published through a `watch` channel. Every transition
//! goes through `send_if_modified`, so two concurrent approve/reject
//! calls cannot both get past the `Ready` check.
//!
//! Approval writes to the file by name, not by diff id. Two diffs open
//! against the same file both target the same live content and the last
//! approval wins.
//!
//! Approve and reject are cancel-safe: if the caller drops the future
//! while the request is in flight, the session goes back to viewing with
//! a "cancelled" error and the diff can be decided again.

use std::sync::Arc;

use contentflow_core::error::CoreError;
use contentflow_core::review::{ReviewDecision, ReviewSession};
use contentflow_core::types::DiffId;
use tokio::sync::watch;

use crate::api::DiffApi;
use crate::error::ClientError;
use crate::listing::ListingRefresher;

pub struct DiffReviewController {
    api: Arc<dyn DiffApi>,
    session: watch::Sender<ReviewSession>,
    refresher: Option<Arc<dyn ListingRefresher>>,
}

impl DiffReviewController {
    pub fn new(api: Arc<dyn DiffApi>, diff_id: impl Into<DiffId>) -> Self {
        let (session, _) = watch::channel(ReviewSession::new(diff_id));
        Self {
            api,
            session,
            refresher: None,
        }
    }

    /// Refresh this listing after an approval or rejection.
    pub fn with_refresher(mut self, refresher: Arc<dyn ListingRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<ReviewSession> {
        self.session.subscribe()
    }

    pub fn session(&self) -> ReviewSession {
        self.session.borrow().clone()
    }

    pub fn diff_id(&self) -> DiffId {
        self.session.borrow().diff_id().to_string()
    }

    /// Fetch the diff. On failure the session is left in `LoadFailed`
    /// and `load` can be called again.
    pub async fn load(&self) -> Result<(), ClientError> {
        self.transition(|s| s.begin_load())?;
        let diff_id = self.diff_id();

        match self.api.get_diff(&diff_id).await {
            Ok(diff) => {
                tracing::debug!(diff_id = %diff_id, filename = %diff.filename, "Diff loaded");
                self.transition(|s| s.load_succeeded(diff))
            }
            Err(e) => {
                tracing::warn!(diff_id = %diff_id, error = %e, "Failed to load diff");
                self.transition(|s| s.load_failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    pub fn start_editing(&self) -> Result<(), ClientError> {
        self.transition(|s| s.start_editing())
    }

    pub fn edit_proposed(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.transition(|s| s.edit_proposed(text))
    }

    pub fn finish_editing(&self) -> Result<(), ClientError> {
        self.transition(|s| s.finish_editing())
    }

    pub fn cancel_editing(&self) -> Result<(), ClientError> {
        self.transition(|s| s.cancel_editing())
    }

    /// Persist `final_text` as the file's new content.
    pub async fn approve(
        &self,
        final_text: impl Into<String>,
    ) -> Result<ReviewDecision, ClientError> {
        let text = final_text.into();
        let filename = self.transition(|s| s.begin_approve(text.clone()))?;
        let diff_id = self.diff_id();

        let pending = PendingAction::new(&self.session);
        let result = self.api.approve_diff(&diff_id, &text).await;
        pending.disarm();

        match result {
            Ok(()) => {
                let decision = self.transition(|s| s.approve_succeeded())?;
                tracing::info!(diff_id = %diff_id, filename = %filename, "Diff approved");
                self.refresh(&decision).await;
                Ok(decision)
            }
            Err(e) => {
                tracing::warn!(diff_id = %diff_id, error = %e, "Diff approval failed");
                self.transition(|s| s.action_failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Approve whatever the proposed side currently holds.
    pub async fn approve_current(&self) -> Result<ReviewDecision, ClientError> {
        let text = self.session.borrow().proposed().to_string();
        self.approve(text).await
    }

    /// Discard the proposal. The file is not touched.
    pub async fn reject(&self) -> Result<ReviewDecision, ClientError> {
        let filename = self.transition(|s| s.begin_reject())?;
        let diff_id = self.diff_id();

        let pending = PendingAction::new(&self.session);
        let result = self.api.reject_diff(&diff_id).await;
        pending.disarm();

        match result {
            Ok(()) => {
                let decision = self.transition(|s| s.reject_succeeded())?;
                tracing::info!(diff_id = %diff_id, filename = %filename, "Diff rejected");
                self.refresh(&decision).await;
                Ok(decision)
            }
            Err(e) => {
                tracing::warn!(diff_id = %diff_id, error = %e, "Diff rejection failed");
                self.transition(|s| s.action_failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    async fn refresh(&self, decision: &ReviewDecision) {
        if let Some(refresher) = &self.refresher {
            refresher.refresh(decision.file_type().into()).await;
        }
    }

    /// Apply `f` under the channel lock; subscribers are notified only if
    /// it succeeded.
    fn transition<R>(
        &self,
        f: impl FnOnce(&mut ReviewSession) -> Result<R, CoreError>,
    ) -> Result<R, ClientError> {
        let mut result = None;
        self.session.send_if_modified(|session| {
            let outcome = f(session);
            let modified = outcome.is_ok();
            result = Some(outcome);
            modified
        });
        match result {
            Some(outcome) => Ok(outcome?),
            None => Err(ClientError::Core(CoreError::Conflict(
                "review transition did not run".to_string(),
            ))),
        }
    }
}

/// Armed while an approve or reject request is in flight. Dropping it
/// armed means the caller abandoned the request.
struct PendingAction<'a> {
    session: &'a watch::Sender<ReviewSession>,
    armed: bool,
}

impl<'a> PendingAction<'a> {
    fn new(session: &'a watch::Sender<ReviewSession>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingAction<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.session.send_if_modified(|session| {
            if !session.is_busy() {
                return false;
            }
            tracing::warn!(diff_id = %session.diff_id(), "Review action abandoned");
            session.action_failed("cancelled").is_ok()
        });
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use contentflow_core::diff::{Diff, FileType};
    use contentflow_core::files::FileKind;
    use contentflow_core::review::{ReviewMode, ReviewPhase};

    use super::*;
    use crate::api::FilesApi;
    use crate::memory::InMemoryBackend;

    async fn backend_with_diff() -> (Arc<InMemoryBackend>, DiffId) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put_file(FileKind::Draft, "post.md", "A").await;
        let id = backend
            .insert_diff(Diff {
                diff_id: "d1".into(),
                filename: "post.md".into(),
                file_type: FileType::Draft,
                original_content: "A".into(),
                edited_content: "B".into(),
            })
            .await;
        (backend, id)
    }

    #[tokio::test]
    async fn edit_then_approve_current() {
        let (backend, id) = backend_with_diff().await;
        let review = DiffReviewController::new(backend.clone(), id);
        review.load().await.unwrap();

        review.start_editing().unwrap();
        review.edit_proposed("B2").unwrap();
        review.finish_editing().unwrap();

        let decision = review.approve_current().await.unwrap();
        assert!(decision.is_approved());
        assert_eq!(
            backend.read_file(FileKind::Draft, "post.md").await.unwrap(),
            "B2"
        );
        assert!(!backend.has_diff("d1").await);
    }

    #[tokio::test]
    async fn failed_load_is_retryable() {
        let backend = Arc::new(InMemoryBackend::new());
        let review = DiffReviewController::new(backend.clone(), "later");

        assert!(review.load().await.unwrap_err().is_not_found());
        assert_matches!(review.session().phase(), ReviewPhase::LoadFailed { .. });

        backend
            .insert_diff(Diff {
                diff_id: "later".into(),
                filename: "x.md".into(),
                file_type: FileType::Brief,
                original_content: "A".into(),
                edited_content: "B".into(),
            })
            .await;
        review.load().await.unwrap();
        assert_eq!(review.session().mode(), Some(ReviewMode::Viewing));
    }

    #[tokio::test]
    async fn failed_approval_returns_to_viewing() {
        let (backend, id) = backend_with_diff().await;
        let review = DiffReviewController::new(backend.clone(), id.clone());
        review.load().await.unwrap();

        // Someone else resolved the diff in the meantime.
        crate::api::DiffApi::reject_diff(backend.as_ref(), &id)
            .await
            .unwrap();

        assert!(review.approve("B").await.is_err());
        let session = review.session();
        assert_eq!(session.mode(), Some(ReviewMode::Viewing));
        assert!(session.last_error().is_some());
        assert_eq!(
            backend.read_file(FileKind::Draft, "post.md").await.unwrap(),
            "A"
        );
    }

    /// Serves diffs from memory but never answers an approval.
    struct StalledApprovals(Arc<InMemoryBackend>);

    #[async_trait::async_trait]
    impl DiffApi for StalledApprovals {
        async fn get_diff(&self, diff_id: &str) -> Result<Diff, ClientError> {
            self.0.get_diff(diff_id).await
        }

        async fn approve_diff(&self, _diff_id: &str, _content: &str) -> Result<(), ClientError> {
            std::future::pending().await
        }

        async fn reject_diff(&self, diff_id: &str) -> Result<(), ClientError> {
            self.0.reject_diff(diff_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_approval_can_be_retried() {
        let (backend, id) = backend_with_diff().await;
        let review = DiffReviewController::new(Arc::new(StalledApprovals(backend.clone())), id);
        review.load().await.unwrap();

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_secs(5), review.approve("B2")).await;
        assert!(timed_out.is_err());

        let session = review.session();
        assert_eq!(session.mode(), Some(ReviewMode::Viewing));
        assert_eq!(session.last_error(), Some("cancelled"));

        let decision = review.reject().await.unwrap();
        assert!(!decision.is_approved());
        assert_eq!(
            backend.read_file(FileKind::Draft, "post.md").await.unwrap(),
            "A"
        );
    }

    #[tokio::test]
    async fn actions_refused_before_load() {
        let (backend, id) = backend_with_diff().await;
        let review = DiffReviewController::new(backend, id);
        assert_matches!(
            review.reject().await,
            Err(ClientError::Core(CoreError::Conflict(_)))
        );
        assert_matches!(
            review.edit_proposed("x"),
            Err(ClientError::Core(CoreError::Conflict(_)))
        );
    }
}
