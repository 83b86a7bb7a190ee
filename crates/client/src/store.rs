//! Shared registry of tracked jobs.
//!
//! [`JobStore`] publishes two views of the same state:
//!
//! - a full [`JobSnapshot`] through a [`tokio::sync::watch`] channel, for
//!   views that render the current list;
//! - discrete [`StoreEvent`]s through a [`tokio::sync::broadcast`]
//!   channel, for consumers that react to individual changes.
//!
//! Every mutation runs inside `watch::Sender::send_if_modified`, which
//! holds the channel lock for the duration of the closure. Mutations are
//! therefore serialized and events are broadcast in the same order the
//! snapshot changed.

use std::collections::HashSet;
use std::sync::Arc;

use contentflow_core::job::{Job, JobPatch, JobStatus};
use contentflow_core::types::JobId;
use tokio::sync::{broadcast, watch};

/// Broadcast channel capacity for store events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time view of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSnapshot {
    /// Tracked jobs in registration order.
    pub jobs: Vec<Job>,
    /// Job the user is currently looking at.
    pub active_job: Option<JobId>,
    /// Ids dismissed by the user; they are never tracked again. Only ids
    /// that were tracked get an entry, so this is bounded by the number of
    /// jobs seen in the session.
    removed: HashSet<JobId>,
}

impl JobSnapshot {
    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.removed.contains(id)
    }

    /// Jobs still queued or running.
    pub fn active_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| !j.is_terminal())
    }

    pub fn finished_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count()
    }

    /// Every listed id is tracked and terminal. Unknown ids count as not
    /// terminal.
    pub fn all_terminal<S: AsRef<str>>(&self, ids: &[S]) -> bool {
        ids.iter()
            .all(|id| self.get(id.as_ref()).is_some_and(Job::is_terminal))
    }

    pub fn batch_members(&self, batch_id: &str) -> impl Iterator<Item = &Job> {
        let batch_id = batch_id.to_string();
        self.jobs
            .iter()
            .filter(move |j| j.batch_id.as_deref() == Some(batch_id.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added(JobId),
    Updated { id: JobId, status: JobStatus },
    Removed(JobId),
    SelectionChanged(Option<JobId>),
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

/// Cloneable handle to the job registry.
#[derive(Clone)]
pub struct JobStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: watch::Sender<JobSnapshot>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("jobs", &self.inner.state.borrow().jobs.len())
            .finish()
    }
}

impl JobStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(JobSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(StoreInner { state, events }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.state.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.borrow().contains(id)
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.inner.state.borrow().active_job.clone()
    }

    /// Register a job and make it the active selection.
    ///
    /// Returns `false` if the id was dismissed earlier or is already
    /// tracked. A duplicate only moves the selection.
    pub fn add(&self, job: Job) -> bool {
        let events = &self.inner.events;
        let mut added = false;

        self.inner.state.send_if_modified(|snap| {
            if snap.removed.contains(&job.id) {
                tracing::debug!(job_id = %job.id, "Ignoring add of dismissed job");
                return false;
            }

            let id = job.id.clone();
            if !snap.contains(&id) {
                snap.jobs.push(job);
                added = true;
                let _ = events.send(StoreEvent::Added(id.clone()));
            }

            let selection_changed = snap.active_job.as_ref() != Some(&id);
            if selection_changed {
                snap.active_job = Some(id.clone());
                let _ = events.send(StoreEvent::SelectionChanged(Some(id)));
            }
            added || selection_changed
        });

        added
    }

    /// Merge a partial update into a tracked job.
    ///
    /// Unknown or dismissed ids are ignored, as are patches that would
    /// move the status backwards. Returns whether anything changed.
    pub fn update(&self, id: &str, patch: JobPatch) -> bool {
        let events = &self.inner.events;

        self.inner.state.send_if_modified(|snap| {
            let Some(job) = snap.jobs.iter_mut().find(|j| j.id == id) else {
                tracing::debug!(job_id = %id, "Ignoring update for untracked job");
                return false;
            };

            match job.apply(&patch) {
                Ok(true) => {
                    let _ = events.send(StoreEvent::Updated {
                        id: job.id.clone(),
                        status: job.status,
                    });
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    tracing::debug!(job_id = %id, error = %e, "Ignoring stale job update");
                    false
                }
            }
        })
    }

    /// Dismiss a job. Later `add`/`update` calls for the id are ignored.
    ///
    /// Clears the active selection if it pointed at the job.
    pub fn remove(&self, id: &str) -> Option<Job> {
        let events = &self.inner.events;
        let mut removed = None;

        self.inner.state.send_if_modified(|snap| {
            let Some(index) = snap.jobs.iter().position(|j| j.id == id) else {
                return false;
            };
            snap.removed.insert(id.to_string());
            removed = Some(snap.jobs.remove(index));
            let _ = events.send(StoreEvent::Removed(id.to_string()));

            if snap.active_job.as_deref() == Some(id) {
                snap.active_job = None;
                let _ = events.send(StoreEvent::SelectionChanged(None));
            }
            true
        });

        removed
    }

    /// Change the active selection to a tracked job or to nothing.
    pub fn select(&self, id: Option<&str>) -> bool {
        let events = &self.inner.events;

        self.inner.state.send_if_modified(|snap| {
            if let Some(id) = id {
                if !snap.contains(id) {
                    return false;
                }
            }
            if snap.active_job.as_deref() == id {
                return false;
            }
            snap.active_job = id.map(str::to_string);
            let _ = events.send(StoreEvent::SelectionChanged(snap.active_job.clone()));
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use contentflow_core::job::JobType;

    use super::*;

    fn job(id: &str) -> Job {
        Job::new(id, JobType::Draft, serde_json::Value::Null)
    }

    #[test]
    fn add_selects_and_publishes() {
        let store = JobStore::new();
        let rx = store.subscribe();
        let mut events = store.events();

        assert!(store.add(job("a")));
        assert!(rx.has_changed().unwrap());
        assert_eq!(store.active_job().as_deref(), Some("a"));
        assert_eq!(events.try_recv().unwrap(), StoreEvent::Added("a".into()));
        assert_eq!(
            events.try_recv().unwrap(),
            StoreEvent::SelectionChanged(Some("a".into()))
        );
    }

    #[test]
    fn duplicate_add_keeps_original() {
        let store = JobStore::new();
        store.add(job("a").with_status(JobStatus::Running));
        store.add(job("b"));

        assert!(!store.add(job("a")));
        assert_eq!(store.get("a").unwrap().status, JobStatus::Running);
        assert_eq!(store.active_job().as_deref(), Some("a"));
        assert_eq!(store.snapshot().jobs.len(), 2);
    }

    #[test]
    fn update_unknown_id_is_noop() {
        let store = JobStore::new();
        let rx = store.subscribe();
        assert!(!store.update("ghost", JobPatch::status(JobStatus::Running)));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn update_never_regresses_status() {
        let store = JobStore::new();
        store.add(job("a"));
        assert!(store.update("a", JobPatch::status(JobStatus::Completed)));
        assert!(!store.update("a", JobPatch::status(JobStatus::Running)));
        assert!(!store.update("a", JobPatch::status(JobStatus::Failed)));
        assert_eq!(store.get("a").unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn removed_job_cannot_come_back() {
        let store = JobStore::new();
        store.add(job("a"));
        let removed = store.remove("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(store.active_job(), None);

        assert!(!store.update("a", JobPatch::status(JobStatus::Running)));
        assert!(!store.add(job("a")));
        assert!(!store.contains("a"));
        assert!(store.snapshot().is_removed("a"));
    }

    #[test]
    fn removing_unknown_id_leaves_no_tombstone() {
        let store = JobStore::new();
        assert!(store.remove("ghost").is_none());
        assert!(!store.snapshot().is_removed("ghost"));
        assert!(store.add(job("ghost")));
    }

    #[test]
    fn remove_keeps_unrelated_selection() {
        let store = JobStore::new();
        store.add(job("a"));
        store.add(job("b"));
        store.remove("a");
        assert_eq!(store.active_job().as_deref(), Some("b"));
    }

    #[test]
    fn select_only_known_ids() {
        let store = JobStore::new();
        store.add(job("a"));
        store.add(job("b"));

        assert!(store.select(Some("a")));
        assert!(!store.select(Some("zzz")));
        assert!(!store.select(Some("a")));
        assert!(store.select(None));
        assert_eq!(store.active_job(), None);
    }

    #[test]
    fn snapshot_helpers() {
        let store = JobStore::new();
        store.add(job("a").with_status(JobStatus::Running));
        store.add(job("b").with_status(JobStatus::Failed));
        store.add(job("c"));

        let snap = store.snapshot();
        assert_eq!(snap.running_count(), 1);
        assert_eq!(snap.active_jobs().count(), 2);
        assert_eq!(snap.finished_jobs().count(), 1);
        assert!(snap.all_terminal(&["b"]));
        assert!(!snap.all_terminal(&["a", "b"]));
        assert!(!snap.all_terminal(&["missing"]));
    }
}
