//! In-process registry of open workspaces keyed by session id.
//!
//! Each entry carries the workspace's pending change set: statuses that
//! override the on-disk classification until the next submit (conflicted
//! merges, staged adds and removes). [`crate::status::StatusResolver`]
//! consumes a snapshot of it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::models::{FileStatus, PendingChange, PendingChangeSet};
use crate::pull::{MergeOutcome, PullOutcome};
use crate::workspace::Workspace;

struct Entry {
    workspace: Workspace,
    pending: PendingChangeSet,
}

#[derive(Default)]
pub struct WorkspaceRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("workspace registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Register `workspace` under `session_id`. Returns `true` if an earlier
    /// registration was replaced (its pending set is discarded).
    pub fn register(&self, session_id: &str, workspace: Workspace) -> bool {
        info!(session_id, root = %workspace.root().display(), "registered workspace");
        self.lock()
            .insert(
                session_id.to_string(),
                Entry {
                    workspace,
                    pending: PendingChangeSet::new(),
                },
            )
            .is_some()
    }

    pub fn unregister(&self, session_id: &str) -> Option<Workspace> {
        let removed = self.lock().remove(session_id).map(|e| e.workspace);
        if removed.is_some() {
            debug!(session_id, "unregistered workspace");
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<Workspace> {
        self.lock().get(session_id).map(|e| e.workspace.clone())
    }

    /// Registered session ids, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Record a pending status for `path`. Returns `false` for an unknown
    /// session.
    pub fn record_pending(&self, session_id: &str, path: &str, change: PendingChange) -> bool {
        match self.lock().get_mut(session_id) {
            Some(entry) => {
                entry.pending.insert(path.to_string(), change);
                true
            }
            None => false,
        }
    }

    /// Drop pending statuses for `paths`, or all of them when `paths` is
    /// `None`.
    pub fn clear_pending(&self, session_id: &str, paths: Option<&[String]>) {
        if let Some(entry) = self.lock().get_mut(session_id) {
            match paths {
                Some(paths) => {
                    for p in paths {
                        entry.pending.remove(p);
                    }
                }
                None => entry.pending.clear(),
            }
        }
    }

    /// Copy of the pending set; empty for an unknown session.
    pub fn pending_snapshot(&self, session_id: &str) -> PendingChangeSet {
        self.lock()
            .get(session_id)
            .map(|e| e.pending.clone())
            .unwrap_or_default()
    }

    /// Mark paths a pull left with conflict markers as `Conflicted` and
    /// clear stale entries for paths that merged cleanly.
    pub fn record_pull(&self, session_id: &str, outcome: &PullOutcome) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        for path in &outcome.deleted_paths {
            entry.pending.remove(path);
        }
        for merge in &outcome.merges {
            match merge.outcome {
                MergeOutcome::Conflicted { .. } => {
                    entry.pending.insert(
                        merge.path.clone(),
                        PendingChange {
                            status: FileStatus::Conflicted,
                            file_id: Some(merge.file_id.clone()),
                            changelist: Some(merge.remote_changelist),
                        },
                    );
                }
                MergeOutcome::Clean => {
                    entry.pending.insert(
                        merge.path.clone(),
                        PendingChange {
                            status: FileStatus::Modified,
                            file_id: Some(merge.file_id.clone()),
                            changelist: Some(merge.remote_changelist),
                        },
                    );
                }
                MergeOutcome::Failed { .. } => {
                    entry.pending.remove(&merge.path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictMarker;
    use crate::pull::FileMerge;

    fn registry_with(session: &str) -> (WorkspaceRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();
        let registry = WorkspaceRegistry::new();
        assert!(!registry.register(session, ws));
        (registry, dir)
    }

    #[test]
    fn test_register_and_unregister() {
        let (registry, dir) = registry_with("s1");
        assert_eq!(registry.get("s1").unwrap().root(), dir.path());
        assert_eq!(registry.sessions(), vec!["s1".to_string()]);
        assert!(registry.unregister("s1").is_some());
        assert!(registry.get("s1").is_none());
        assert!(registry.unregister("s1").is_none());
    }

    #[test]
    fn test_pending_changes_are_per_session() {
        let (registry, dir) = registry_with("s1");
        registry.register("s2", Workspace::open(dir.path()).unwrap());

        let change = PendingChange {
            status: FileStatus::Added,
            file_id: None,
            changelist: None,
        };
        assert!(registry.record_pending("s1", "a.txt", change.clone()));
        assert!(!registry.record_pending("missing", "a.txt", change));

        assert_eq!(registry.pending_snapshot("s1").len(), 1);
        assert!(registry.pending_snapshot("s2").is_empty());

        registry.clear_pending("s1", Some(&["a.txt".to_string()]));
        assert!(registry.pending_snapshot("s1").is_empty());
    }

    #[test]
    fn test_record_pull_marks_conflicts() {
        let (registry, _dir) = registry_with("s1");
        let outcome = PullOutcome {
            from_changelist: 5,
            to_changelist: 7,
            fetched_changelists: vec![6, 7],
            deleted_paths: vec![],
            merges: vec![
                FileMerge {
                    path: "a.txt".into(),
                    file_id: "f1".into(),
                    base_changelist: 5,
                    remote_changelist: 6,
                    outcome: MergeOutcome::Conflicted {
                        markers: vec![ConflictMarker {
                            start_line: 1,
                            end_line: 5,
                        }],
                    },
                },
                FileMerge {
                    path: "b.txt".into(),
                    file_id: "f2".into(),
                    base_changelist: 5,
                    remote_changelist: 7,
                    outcome: MergeOutcome::Clean,
                },
            ],
        };
        registry.record_pull("s1", &outcome);

        let pending = registry.pending_snapshot("s1");
        assert_eq!(pending["a.txt"].status, FileStatus::Conflicted);
        assert_eq!(pending["a.txt"].changelist, Some(6));
        assert_eq!(pending["b.txt"].status, FileStatus::Modified);
    }
}
