//! Domain model types used throughout Checkpoint.
//!
//! These types bridge the history service, the workspace state on disk and
//! the sync/submit engines.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tree::StateTree;

/// Changelist numbers are monotonic per repository; 0 is "repo creation".
pub type ChangelistNumber = i64;

/// Stable, path-independent file identity scoped to one repository.
pub type FileId = String;

// ---------------------------------------------------------------------------
// History records
// ---------------------------------------------------------------------------

/// An immutable, numbered snapshot of repository state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changelist {
    pub repo_id: String,
    pub number: ChangelistNumber,
    pub message: String,
    /// The changelist this one was based on (`None` only for changelist 0).
    pub parent_number: Option<ChangelistNumber>,
    /// Handle into the content store for the full snapshot.
    pub version_index: String,
    pub state_tree: StateTree,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// A named, mutable pointer to the latest changelist on a line of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub repo_id: String,
    pub name: String,
    pub head_number: ChangelistNumber,
    pub is_default: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// The path-bearing record behind a [`FileId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub repo_id: String,
    pub path: String,
}

/// What a submitted modification did to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileChangeType {
    Add,
    Modify,
    Delete,
}

impl std::fmt::Display for FileChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

impl FileChangeType {
    /// Parse the stored representation.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "ADD" => Some(Self::Add),
            "MODIFY" => Some(Self::Modify),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One recorded change inside a changelist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub file_id: FileId,
    pub changelist: ChangelistNumber,
    pub change_type: FileChangeType,
    pub path: String,
    pub old_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Submit input
// ---------------------------------------------------------------------------

/// A single requested change to submit. `old_path` present implies a rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub delete: bool,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

impl Modification {
    pub fn upsert(path: impl Into<String>) -> Self {
        Self {
            delete: false,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            delete: true,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn rename(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            delete: false,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }

    /// The path under which the file is currently known to the history.
    pub fn lookup_path(&self) -> &str {
        self.old_path.as_deref().unwrap_or(&self.path)
    }
}

// ---------------------------------------------------------------------------
// File status
// ---------------------------------------------------------------------------

/// Classification of a workspace-relative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Not tracked individually, or tracked but anomalously missing.
    Unknown,
    /// Matches an ignore pattern.
    Ignored,
    /// Matches a cloak pattern; changes are hidden from the user.
    HiddenChanges,
    /// Tracked and writable on disk.
    WritableControlled,
    /// Tracked and read-only on disk.
    ReadOnlyControlled,
    /// Untracked file present on disk.
    Local,
    /// Staged add.
    Added,
    /// Staged delete.
    Deleted,
    /// Modified and staged.
    Modified,
    /// Staged rename.
    Renamed,
    /// Left with conflict markers by a merge.
    Conflicted,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Ignored => "ignored",
            Self::HiddenChanges => "hidden_changes",
            Self::WritableControlled => "writable_controlled",
            Self::ReadOnlyControlled => "read_only_controlled",
            Self::Local => "local",
            Self::Added => "added",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
            Self::Renamed => "renamed",
            Self::Conflicted => "conflicted",
        };
        write!(f, "{s}")
    }
}

/// A file-system watch result not yet submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub status: FileStatus,
    pub file_id: Option<FileId>,
    pub changelist: Option<ChangelistNumber>,
}

/// Pending changes of one workspace keyed by workspace-relative path.
pub type PendingChangeSet = HashMap<String, PendingChange>;

/// The resolved status of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub path: String,
    pub status: FileStatus,
    pub file_id: Option<FileId>,
    pub changelist: Option<ChangelistNumber>,
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// A file present on both sides with differing changelist numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutdatedFile {
    pub file_id: FileId,
    pub path: String,
    pub local_changelist: ChangelistNumber,
    pub remote_changelist: ChangelistNumber,
}

/// A file tracked locally that no longer exists at the remote head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedFile {
    pub file_id: FileId,
    pub path: String,
    pub local_changelist: ChangelistNumber,
}

/// A file that exists at the remote head but not locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFile {
    pub file_id: FileId,
    pub path: String,
    pub remote_changelist: ChangelistNumber,
}

/// Advisory comparison of a workspace against its branch head, valid as of
/// `checked_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub up_to_date: bool,
    pub local_changelist: ChangelistNumber,
    pub remote_head: ChangelistNumber,
    pub outdated_files: Vec<OutdatedFile>,
    pub deleted_on_remote: Vec<DeletedFile>,
    pub new_on_remote: Vec<NewFile>,
    pub checked_at: DateTime<Utc>,
}

impl SyncStatus {
    pub fn up_to_date(changelist: ChangelistNumber) -> Self {
        Self {
            up_to_date: true,
            local_changelist: changelist,
            remote_head: changelist,
            outdated_files: Vec::new(),
            deleted_on_remote: Vec::new(),
            new_on_remote: Vec::new(),
            checked_at: Utc::now(),
        }
    }

    /// Remote changelist for `path` as of this check; `None` if not affected.
    pub fn remote_changelist_for(&self, path: &str) -> Option<Option<ChangelistNumber>> {
        if let Some(o) = self.outdated_files.iter().find(|o| o.path == path) {
            return Some(Some(o.remote_changelist));
        }
        if self.deleted_on_remote.iter().any(|d| d.path == path) {
            return Some(None);
        }
        None
    }
}

/// Why a path is a hard conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Binary file modified locally and remotely.
    Binary,
    /// File modified locally but deleted on the remote.
    DeletedOnRemote,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::DeletedOnRemote => write!(f, "deleted on remote"),
        }
    }
}

/// A detected hard conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub path: String,
    pub kind: ConflictKind,
    pub local_changelist: ChangelistNumber,
    pub remote_changelist: Option<ChangelistNumber>,
}

/// Result of [`crate::conflict::SyncChecker::check_conflicts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCheckResult {
    pub has_conflicts: bool,
    pub conflicts: Vec<FileConflict>,
    /// Text files modified on both sides that pull will auto-merge.
    pub mergeable: Vec<String>,
    pub status: SyncStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modification_lookup_path() {
        assert_eq!(Modification::upsert("a.txt").lookup_path(), "a.txt");
        assert_eq!(Modification::rename("old.txt", "new.txt").lookup_path(), "old.txt");
    }

    #[test]
    fn test_change_type_roundtrip_strings() {
        for t in [FileChangeType::Add, FileChangeType::Modify, FileChangeType::Delete] {
            assert_eq!(FileChangeType::from_str_val(&t.to_string()), Some(t));
        }
        assert_eq!(FileChangeType::from_str_val("RENAME"), None);
    }

    #[test]
    fn test_remote_changelist_for() {
        let mut status = SyncStatus::up_to_date(3);
        status.outdated_files.push(OutdatedFile {
            file_id: "f1".into(),
            path: "a.txt".into(),
            local_changelist: 2,
            remote_changelist: 5,
        });
        status.deleted_on_remote.push(DeletedFile {
            file_id: "f2".into(),
            path: "b.txt".into(),
            local_changelist: 1,
        });
        assert_eq!(status.remote_changelist_for("a.txt"), Some(Some(5)));
        assert_eq!(status.remote_changelist_for("b.txt"), Some(None));
        assert_eq!(status.remote_changelist_for("c.txt"), None);
    }
}
