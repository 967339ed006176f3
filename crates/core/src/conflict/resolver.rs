//! Conflict resolution actions.
//!
//! [`ConflictResolver`] settles paths reported by a sync-status check by
//! keeping one side. The cached [`SyncStatus`] is only trusted after the
//! branch head has been re-read: if the head moved and any path being
//! resolved now has a different remote changelist, resolution is refused.

use std::fs;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{SyncError, WorkspaceError};
use crate::history::HistoryStore;
use crate::models::{ChangelistNumber, SyncStatus};
use crate::transport::ContentTransport;
use crate::workspace::{write_atomic, Workspace, WorkspaceStateFile};

/// Named resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the on-disk content and submit it over the remote change.
    AcceptLocal,
    /// Replace the local file with the remote version.
    AcceptRemote,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AcceptLocal => write!(f, "accept_local"),
            Self::AcceptRemote => write!(f, "accept_remote"),
        }
    }
}

impl Resolution {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "accept_local" | "local" | "mine" => Some(Self::AcceptLocal),
            "accept_remote" | "remote" | "theirs" => Some(Self::AcceptRemote),
            _ => None,
        }
    }
}

/// What happened to one resolved path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPath {
    pub path: String,
    pub resolution: Resolution,
    /// Remote changelist the path now records; `None` when the remote
    /// deleted it.
    pub remote_changelist: Option<ChangelistNumber>,
}

pub struct ConflictResolver {
    history: Arc<dyn HistoryStore>,
    transport: Arc<dyn ContentTransport>,
    repo_id: String,
    branch: String,
}

impl ConflictResolver {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn ContentTransport>,
        repo_id: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            history,
            transport,
            repo_id: repo_id.into(),
            branch: branch.into(),
        }
    }

    /// Resolve `paths` using `status` as the view of the remote. Paths the
    /// status does not mention are skipped.
    pub async fn resolve(
        &self,
        ws: &Workspace,
        status: &SyncStatus,
        paths: &[String],
        resolution: Resolution,
    ) -> Result<Vec<ResolvedPath>, SyncError> {
        let _lock = ws.lock()?;
        let root = ws.root();
        let mut state = ws.load_state();
        let mut staged = ws.load_staged();

        for path in paths {
            if state.get(path).is_none() {
                return Err(SyncError::NotTracked(path.clone()));
            }
        }

        self.revalidate(status, &state, paths).await?;

        let mut resolved = Vec::new();
        for path in paths {
            let Some(remote) = status.remote_changelist_for(path) else {
                debug!(path = %path, "not affected by remote changes, skipping");
                continue;
            };
            let Some(entry) = state.files.get(path).cloned() else {
                continue;
            };
            let abs = root.join(path);

            match (resolution, remote) {
                (Resolution::AcceptLocal, Some(remote_cl)) => {
                    if let Some(e) = state.files.get_mut(path) {
                        e.changelist = remote_cl;
                    }
                    if staged.get(path).is_none() {
                        staged.stage_add(path);
                    }
                }
                (Resolution::AcceptLocal, None) => {
                    // The remote identity is gone; the file comes back as a
                    // new add on the next submit.
                    state.files.remove(path);
                    staged.stage_add(path);
                }
                (Resolution::AcceptRemote, Some(remote_cl)) => {
                    let changelist = self.history.get_changelist(&self.repo_id, remote_cl).await?;
                    let remote_path = self
                        .history
                        .get_files(&self.repo_id, std::slice::from_ref(&entry.file_id))
                        .await?
                        .into_iter()
                        .next()
                        .map(|r| r.path)
                        .unwrap_or_else(|| path.clone());
                    let content = self
                        .transport
                        .fetch_file(&self.repo_id, &changelist.version_index, &remote_path)
                        .await?;

                    let target = root.join(&remote_path);
                    write_atomic(&target, &content)?;
                    if remote_path != *path {
                        remove_if_present(&abs)?;
                        state.files.remove(path);
                    }
                    let observed = WorkspaceStateFile::observe(&target, entry.file_id.clone(), remote_cl)
                        .map_err(WorkspaceError::from)?;
                    state.files.insert(remote_path, observed);
                    staged.unstage(path);
                }
                (Resolution::AcceptRemote, None) => {
                    remove_if_present(&abs)?;
                    state.files.remove(path);
                    staged.unstage(path);
                }
            }

            debug!(path = %path, resolution = %resolution, "resolved");
            resolved.push(ResolvedPath {
                path: path.clone(),
                resolution,
                remote_changelist: remote,
            });
        }

        ws.save_state(&state)?;
        ws.save_staged(&staged)?;
        info!(count = resolved.len(), resolution = %resolution, "conflicts resolved");
        Ok(resolved)
    }

    /// Fail with [`SyncError::StaleStatus`] if the head moved in a way that
    /// changes the remote side of any path in `paths`.
    async fn revalidate(
        &self,
        status: &SyncStatus,
        state: &crate::workspace::WorkspaceState,
        paths: &[String],
    ) -> Result<(), SyncError> {
        let branch = self.history.get_branch(&self.repo_id, &self.branch).await?;
        if branch.head_number == status.remote_head {
            return Ok(());
        }

        let head = self.history.get_changelist(&self.repo_id, branch.head_number).await?;
        let mut stale = Vec::new();
        for path in paths {
            let Some(entry) = state.get(path) else {
                continue;
            };
            let cached = status
                .remote_changelist_for(path)
                .unwrap_or(Some(entry.changelist));
            let current = head.state_tree.get(&entry.file_id);
            if cached != current {
                stale.push(path.clone());
            }
        }

        if stale.is_empty() {
            debug!(
                cached = status.remote_head,
                current = branch.head_number,
                "head moved but resolved paths are unaffected"
            );
            return Ok(());
        }
        warn!(
            cached = status.remote_head,
            current = branch.head_number,
            paths = ?stale,
            "sync status is stale"
        );
        Err(SyncError::StaleStatus {
            cached: status.remote_head,
            current: branch.head_number,
            paths: stale,
        })
    }
}

fn remove_if_present(path: &std::path::Path) -> Result<(), WorkspaceError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
