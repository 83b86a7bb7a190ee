//! Proposed-vs-original content pairs awaiting review.

use serde::{Deserialize, Serialize};

use crate::files::FileKind;
use crate::types::DiffId;

/// Documents that can be edited by an AI job and reviewed as a diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Brief,
    #[default]
    Draft,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Brief => "brief",
            Self::Draft => "draft",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Brief => "Brief",
            Self::Draft => "Draft",
        }
    }
}

impl From<FileType> for FileKind {
    fn from(value: FileType) -> Self {
        match value {
            FileType::Brief => FileKind::Brief,
            FileType::Draft => FileKind::Draft,
        }
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A diff as returned by the backend.
///
/// `original_content` is a snapshot of the live file at the time the
/// edit job ran. It is never written back anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    #[serde(default)]
    pub diff_id: DiffId,
    pub filename: String,
    pub file_type: FileType,
    pub original_content: String,
    /// AI-proposed replacement for the file content.
    pub edited_content: String,
}

impl Diff {
    /// Whether the proposal differs from the original at all.
    pub fn has_changes(&self) -> bool {
        self.original_content != self.edited_content
    }
}
