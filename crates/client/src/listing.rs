//! Cached backend file listings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use contentflow_core::files::{FileInfo, FileKind};
use tokio::sync::watch;

use crate::api::FilesApi;
use crate::error::ClientError;

/// Something that re-reads a listing after jobs or reviews change files.
#[async_trait]
pub trait ListingRefresher: Send + Sync {
    async fn refresh(&self, kind: FileKind);
}

pub type Listings = HashMap<FileKind, Vec<FileInfo>>;

/// Latest listing per file kind, newest files first.
pub struct FileListing {
    api: Arc<dyn FilesApi>,
    listings: watch::Sender<Listings>,
}

impl FileListing {
    pub fn new(api: Arc<dyn FilesApi>) -> Self {
        let (listings, _) = watch::channel(Listings::new());
        Self { api, listings }
    }

    pub fn subscribe(&self) -> watch::Receiver<Listings> {
        self.listings.subscribe()
    }

    pub fn get(&self, kind: FileKind) -> Vec<FileInfo> {
        self.listings
            .borrow()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Fetch `kind` from the backend and publish it.
    pub async fn reload(&self, kind: FileKind) -> Result<Vec<FileInfo>, ClientError> {
        let mut files = self.api.list_files(kind).await?;
        files.sort_by(|a, b| b.created_at.total_cmp(&a.created_at));

        tracing::debug!(kind = kind.path_segment(), count = files.len(), "Listing refreshed");
        self.listings.send_modify(|all| {
            all.insert(kind, files.clone());
        });
        Ok(files)
    }
}

#[async_trait]
impl ListingRefresher for FileListing {
    async fn refresh(&self, kind: FileKind) {
        if let Err(e) = self.reload(kind).await {
            tracing::warn!(kind = kind.path_segment(), error = %e, "Failed to refresh listing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    #[tokio::test]
    async fn reload_sorts_newest_first() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put_file_at(FileKind::Draft, "old.md", "one two", 100.0).await;
        backend.put_file_at(FileKind::Draft, "new.md", "three", 200.0).await;

        let listing = FileListing::new(backend);
        let mut rx = listing.subscribe();

        let files = listing.reload(FileKind::Draft).await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["new.md", "old.md"]);
        assert_eq!(files[1].size, Some(2));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()[&FileKind::Draft].len(), 2);
        assert!(listing.get(FileKind::Brief).is_empty());
    }
}
