//! Sync-status and conflict detection.
//!
//! [`SyncChecker`] compares a workspace's recorded state with the head of
//! its branch. Only binary files modified on both sides and local edits to
//! files deleted on the remote are hard conflicts; text files modified on
//! both sides are left to the pull's three-way merge.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::errors::{ConflictEntry, SyncError};
use crate::history::HistoryStore;
use crate::models::{
    ConflictCheckResult, ConflictKind, DeletedFile, FileConflict, NewFile, OutdatedFile,
    SyncStatus,
};
use crate::status::is_binary;
use crate::tree::diff;
use crate::workspace::WorkspaceState;

pub struct SyncChecker {
    history: Arc<dyn HistoryStore>,
    repo_id: String,
    branch: String,
}

impl SyncChecker {
    pub fn new(history: Arc<dyn HistoryStore>, repo_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            history,
            repo_id: repo_id.into(),
            branch: branch.into(),
        }
    }

    /// Compare `state` against the current branch head. Read-only.
    pub async fn check_sync_status(&self, state: &WorkspaceState) -> Result<SyncStatus, SyncError> {
        let branch = self.history.get_branch(&self.repo_id, &self.branch).await?;
        let remote_head = branch.head_number;
        if state.changelist_number == remote_head {
            debug!(changelist = remote_head, "workspace is up to date");
            return Ok(SyncStatus::up_to_date(remote_head));
        }

        let head = self.history.get_changelist(&self.repo_id, remote_head).await?;
        let local_tree = state.local_tree();
        let remote_tree = &head.state_tree;
        let delta = diff(&local_tree, remote_tree);
        let paths_by_id = state.paths_by_id();

        let mut outdated_files = Vec::new();
        let mut new_ids = Vec::new();
        if !delta.changelists_to_pull.is_empty() {
            for (file_id, remote_cl) in remote_tree.iter() {
                match local_tree.get(file_id) {
                    Some(local_cl) if local_cl != remote_cl => outdated_files.push(OutdatedFile {
                        file_id: file_id.clone(),
                        path: paths_by_id.get(file_id.as_str()).map(|p| p.to_string()).unwrap_or_default(),
                        local_changelist: local_cl,
                        remote_changelist: remote_cl,
                    }),
                    Some(_) => {}
                    None => new_ids.push(file_id.clone()),
                }
            }
        }

        let deleted_on_remote: Vec<DeletedFile> = delta
            .deletions
            .iter()
            .map(|file_id| DeletedFile {
                file_id: file_id.clone(),
                path: paths_by_id.get(file_id.as_str()).map(|p| p.to_string()).unwrap_or_default(),
                local_changelist: local_tree.get(file_id).unwrap_or_default(),
            })
            .collect();

        // Only ids unknown to the workspace need a lookup.
        let mut new_on_remote = Vec::new();
        if !new_ids.is_empty() {
            let records = self.history.get_files(&self.repo_id, &new_ids).await?;
            let remote_paths: HashMap<&str, &str> =
                records.iter().map(|r| (r.id.as_str(), r.path.as_str())).collect();
            for file_id in new_ids {
                let path = match remote_paths.get(file_id.as_str()) {
                    Some(p) => p.to_string(),
                    None => {
                        warn!(file_id = %file_id, "no file record for remote file");
                        file_id.clone()
                    }
                };
                let remote_changelist = remote_tree.get(&file_id).unwrap_or_default();
                new_on_remote.push(NewFile {
                    file_id,
                    path,
                    remote_changelist,
                });
            }
        }

        outdated_files.sort_by(|a, b| a.path.cmp(&b.path));
        new_on_remote.sort_by(|a, b| a.path.cmp(&b.path));
        let mut deleted_on_remote = deleted_on_remote;
        deleted_on_remote.sort_by(|a, b| a.path.cmp(&b.path));

        info!(
            local = state.changelist_number,
            remote_head,
            outdated = outdated_files.len(),
            deleted = deleted_on_remote.len(),
            new = new_on_remote.len(),
            "checked sync status"
        );

        Ok(SyncStatus {
            up_to_date: false,
            local_changelist: state.changelist_number,
            remote_head,
            outdated_files,
            deleted_on_remote,
            new_on_remote,
            checked_at: Utc::now(),
        })
    }

    /// Check whether pulling would hit a hard conflict for any of
    /// `locally_modified` (workspace-relative paths under `root`).
    pub async fn check_conflicts(
        &self,
        root: &Path,
        state: &WorkspaceState,
        locally_modified: &[String],
    ) -> Result<ConflictCheckResult, SyncError> {
        let status = self.check_sync_status(state).await?;
        Ok(classify_conflicts(root, status, locally_modified))
    }
}

/// Split the locally modified files affected by `status` into hard
/// conflicts and auto-mergeable files.
pub fn classify_conflicts(
    root: &Path,
    status: SyncStatus,
    locally_modified: &[String],
) -> ConflictCheckResult {
    if status.up_to_date {
        return ConflictCheckResult {
            has_conflicts: false,
            conflicts: Vec::new(),
            mergeable: Vec::new(),
            status,
        };
    }

    let modified: HashSet<&str> = locally_modified.iter().map(String::as_str).collect();
    let mut conflicts = Vec::new();
    let mut mergeable = Vec::new();

    for file in &status.outdated_files {
        if !modified.contains(file.path.as_str()) {
            continue;
        }
        if is_binary(&root.join(&file.path)) {
            debug!(path = %file.path, "binary file changed on both sides");
            conflicts.push(FileConflict {
                path: file.path.clone(),
                kind: ConflictKind::Binary,
                local_changelist: file.local_changelist,
                remote_changelist: Some(file.remote_changelist),
            });
        } else {
            mergeable.push(file.path.clone());
        }
    }

    for file in &status.deleted_on_remote {
        if !modified.contains(file.path.as_str()) {
            continue;
        }
        // Deleted locally as well: both sides agree.
        if !root.join(&file.path).exists() {
            debug!(path = %file.path, "deleted on both sides");
            continue;
        }
        conflicts.push(FileConflict {
            path: file.path.clone(),
            kind: ConflictKind::DeletedOnRemote,
            local_changelist: file.local_changelist,
            remote_changelist: None,
        });
    }

    ConflictCheckResult {
        has_conflicts: !conflicts.is_empty(),
        conflicts,
        mergeable,
        status,
    }
}

/// The hard conflicts of `result` as an error, or `None` if there are none.
pub fn conflict_error(result: &ConflictCheckResult) -> Option<SyncError> {
    if !result.has_conflicts {
        return None;
    }
    Some(SyncError::Conflicts(
        result
            .conflicts
            .iter()
            .map(|c| ConflictEntry {
                path: c.path.clone(),
                local_changelist: Some(c.local_changelist),
                remote_changelist: c.remote_changelist,
                reason: c.kind.to_string(),
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn status(outdated: &[(&str, i64, i64)], deleted: &[(&str, i64)]) -> SyncStatus {
        let mut s = SyncStatus::up_to_date(9);
        s.up_to_date = false;
        s.local_changelist = 5;
        s.outdated_files = outdated
            .iter()
            .map(|(p, l, r)| OutdatedFile {
                file_id: format!("id-{p}"),
                path: p.to_string(),
                local_changelist: *l,
                remote_changelist: *r,
            })
            .collect();
        s.deleted_on_remote = deleted
            .iter()
            .map(|(p, l)| DeletedFile {
                file_id: format!("id-{p}"),
                path: p.to_string(),
                local_changelist: *l,
            })
            .collect();
        s
    }

    #[test]
    fn test_text_file_modified_on_both_sides_is_mergeable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "edited\n").unwrap();
        let result = classify_conflicts(
            dir.path(),
            status(&[("a.txt", 5, 6)], &[]),
            &["a.txt".to_string()],
        );
        assert!(!result.has_conflicts);
        assert_eq!(result.mergeable, vec!["a.txt".to_string()]);
        assert!(conflict_error(&result).is_none());
    }

    #[test]
    fn test_binary_file_modified_on_both_sides_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();
        let result = classify_conflicts(
            dir.path(),
            status(&[("logo.png", 5, 8)], &[]),
            &["logo.png".to_string()],
        );
        assert!(result.has_conflicts);
        assert_eq!(result.conflicts[0].kind, ConflictKind::Binary);
        assert_eq!(result.conflicts[0].remote_changelist, Some(8));

        let msg = conflict_error(&result).unwrap().to_string();
        assert!(msg.contains("logo.png"));
    }

    #[test]
    fn test_remote_delete_of_local_edit_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("old.rs"), "edited").unwrap();
        let result = classify_conflicts(
            dir.path(),
            status(&[], &[("old.rs", 3)]),
            &["old.rs".to_string()],
        );
        assert!(result.has_conflicts);
        assert_eq!(result.conflicts[0].kind, ConflictKind::DeletedOnRemote);
        assert_eq!(result.conflicts[0].remote_changelist, None);
    }

    #[test]
    fn test_deleted_on_both_sides_is_not_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let result = classify_conflicts(
            dir.path(),
            status(&[], &[("gone.rs", 3)]),
            &["gone.rs".to_string()],
        );
        assert!(!result.has_conflicts);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_unmodified_files_never_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("logo.png"), [0u8]).unwrap();
        fs::write(dir.path().join("old.rs"), "x").unwrap();
        let result = classify_conflicts(
            dir.path(),
            status(&[("logo.png", 1, 2)], &[("old.rs", 1)]),
            &[],
        );
        assert!(!result.has_conflicts);
        assert!(result.mergeable.is_empty());
    }

    #[test]
    fn test_up_to_date_has_no_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let result = classify_conflicts(dir.path(), SyncStatus::up_to_date(4), &["a".into()]);
        assert!(!result.has_conflicts);
    }
}
