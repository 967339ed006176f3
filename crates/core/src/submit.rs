//! Submit/commit allocator.
//!
//! Submitting is optimistic: every attempt re-reads the branch head, the
//! head's state tree and the repository's highest changelist number, plans
//! the new changelist, uploads its content and then commits everything in
//! one history transaction guarded by a compare-and-set on the branch head.
//! Losing a race to another submitter discards the attempt and starts
//! over, up to a bounded number of attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{HistoryError, SubmitError};
use crate::history::{CommitPlan, HistoryStore, PlannedChange};
use crate::models::{Changelist, FileChangeType, FileRecord, Modification};
use crate::transport::{ContentTransport, Credentials, StoreRequest};
use crate::tree::TreeEdit;
use crate::workspace::{Workspace, WorkspaceStateFile};

/// Default number of optimistic attempts.
pub const DEFAULT_SUBMIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub branch: String,
    pub message: String,
    pub modifications: Vec<Modification>,
    pub keep_checked_out: bool,
}

#[derive(Debug, Clone)]
pub struct SubmitResult {
    pub changelist: Changelist,
    pub changes: Vec<PlannedChange>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Outcome of a failed attempt.
enum AttemptError {
    /// Lost a race; start over with fresh reads.
    Retryable(String),
    Fatal(SubmitError),
}

impl From<HistoryError> for AttemptError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::WriteConflict(reason) => Self::Retryable(reason),
            other => Self::Fatal(SubmitError::History(other)),
        }
    }
}

impl From<SubmitError> for AttemptError {
    fn from(err: SubmitError) -> Self {
        Self::Fatal(err)
    }
}

pub struct SubmitAllocator {
    history: Arc<dyn HistoryStore>,
    transport: Arc<dyn ContentTransport>,
    repo_id: String,
    workspace_id: String,
    user_id: String,
    credentials: Credentials,
    max_attempts: u32,
}

impl SubmitAllocator {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn ContentTransport>,
        repo_id: impl Into<String>,
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            history,
            transport,
            repo_id: repo_id.into(),
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
            credentials,
            max_attempts: DEFAULT_SUBMIT_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Create a changelist from the content of the files under `local_root`
    /// named by `request`.
    pub async fn submit(
        &self,
        local_root: &std::path::Path,
        request: &SubmitRequest,
    ) -> Result<SubmitResult, SubmitError> {
        validate_modifications(&request.modifications)?;

        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            match self.attempt(local_root, request).await {
                Ok((changelist, changes)) => {
                    info!(
                        repo_id = %self.repo_id,
                        branch = %request.branch,
                        number = changelist.number,
                        attempt,
                        files = changes.len(),
                        "submitted changelist"
                    );
                    return Ok(SubmitResult {
                        changelist,
                        changes,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Retryable(reason)) => {
                    warn!(attempt, max = self.max_attempts, reason = %reason, "submit lost a race, retrying");
                    last_reason = reason;
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
            }
        }

        Err(SubmitError::RetriesExhausted {
            attempts: self.max_attempts,
            last_reason,
        })
    }

    async fn attempt(
        &self,
        local_root: &std::path::Path,
        request: &SubmitRequest,
    ) -> Result<(Changelist, Vec<PlannedChange>), AttemptError> {
        // Fresh reads every attempt.
        let branch = self.history.get_branch(&self.repo_id, &request.branch).await?;
        if branch.archived_at.is_some() {
            return Err(SubmitError::Validation(format!("branch '{}' is archived", branch.name)).into());
        }
        let head = self.history.get_changelist(&self.repo_id, branch.head_number).await?;
        let number = self.history.max_changelist_number(&self.repo_id).await? + 1;
        debug!(head = head.number, number, "planning submit");

        let mut lookup: Vec<String> = Vec::new();
        for m in &request.modifications {
            lookup.push(m.lookup_path().to_string());
            if m.old_path.is_some() {
                lookup.push(m.path.clone());
            }
        }
        let records: HashMap<String, FileRecord> = self
            .history
            .find_files_by_path(&self.repo_id, &lookup)
            .await?
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let changes = plan_changes(&request.modifications, &records)?;

        let mut upload = Vec::new();
        let mut remove = Vec::new();
        for change in &changes {
            if change.change_type == FileChangeType::Delete {
                remove.push(change.path.clone());
            } else {
                upload.push(change.path.clone());
            }
            if let Some(old) = &change.old_path {
                remove.push(old.clone());
            }
        }
        let version_index = self
            .transport
            .store_version(StoreRequest {
                remote_base: self.repo_id.clone(),
                base_version: head.version_index.clone(),
                local_root: local_root.to_path_buf(),
                upload,
                remove,
                credentials: self.credentials.clone(),
            })
            .await
            .map_err(SubmitError::Transport)?;

        let edits = changes.iter().map(|c| {
            let edit = match c.change_type {
                FileChangeType::Delete => TreeEdit::Delete,
                FileChangeType::Add | FileChangeType::Modify => TreeEdit::Upsert,
            };
            (c.file_id.clone(), edit)
        });
        let state_tree = head.state_tree.apply(edits, number);

        let plan = CommitPlan {
            repo_id: self.repo_id.clone(),
            branch: request.branch.clone(),
            workspace_id: self.workspace_id.clone(),
            user_id: self.user_id.clone(),
            message: request.message.clone(),
            version_index,
            number,
            parent_number: head.number,
            state_tree,
            changes: changes.clone(),
            keep_checked_out: request.keep_checked_out,
        };
        let changelist = self.history.commit_changelist(plan).await?;
        Ok((changelist, changes))
    }

    /// Submit everything pending in `ws`: staged modifications plus tracked
    /// files whose content changed. On success the submitted files are
    /// recorded at the new changelist and the staged record is cleared.
    pub async fn submit_workspace(
        &self,
        ws: &Workspace,
        branch: &str,
        message: &str,
        keep_checked_out: bool,
    ) -> Result<SubmitResult, SubmitError> {
        let _lock = ws.lock()?;
        let root = ws.root();
        let mut state = ws.load_state();
        let mut staged = ws.load_staged();

        let mut modifications = staged.modifications.clone();
        let covered: HashSet<String> = modifications
            .iter()
            .flat_map(|m| std::iter::once(m.path.clone()).chain(m.old_path.clone()))
            .collect();
        for path in state.modified_paths(root) {
            if covered.contains(&path) {
                continue;
            }
            if !root.join(&path).is_file() {
                debug!(path = %path, "tracked file missing on disk, not submitting");
                continue;
            }
            modifications.push(Modification::upsert(path));
        }
        if modifications.is_empty() {
            return Err(SubmitError::Validation("nothing to submit".into()));
        }

        let request = SubmitRequest {
            branch: branch.to_string(),
            message: message.to_string(),
            modifications,
            keep_checked_out,
        };
        let result = self.submit(root, &request).await?;
        let number = result.changelist.number;

        for change in &result.changes {
            if let Some(old) = &change.old_path {
                state.files.remove(old);
            }
            if change.change_type == FileChangeType::Delete {
                state.files.remove(&change.path);
                continue;
            }
            match WorkspaceStateFile::observe(&root.join(&change.path), change.file_id.clone(), number) {
                Ok(entry) => {
                    state.files.insert(change.path.clone(), entry);
                }
                Err(e) => {
                    warn!(path = %change.path, error = %e, "submitted file vanished from disk");
                    state.files.remove(&change.path);
                }
            }
        }
        // Nothing else landed in between: the workspace now matches the new head.
        if result.changelist.parent_number == Some(state.changelist_number) {
            state.changelist_number = number;
        }
        staged.clear();

        ws.save_state(&state).map_err(SubmitError::Workspace)?;
        ws.save_staged(&staged).map_err(SubmitError::Workspace)?;
        Ok(result)
    }
}

/// Reject modification lists that can never succeed.
fn validate_modifications(modifications: &[Modification]) -> Result<(), SubmitError> {
    if modifications.is_empty() {
        return Err(SubmitError::Validation("no modifications".into()));
    }
    let mut seen = HashSet::new();
    for m in modifications {
        if m.path.is_empty() {
            return Err(SubmitError::Validation("empty path".into()));
        }
        if !seen.insert(m.path.as_str()) {
            return Err(SubmitError::Validation(format!("'{}' appears more than once", m.path)));
        }
        if m.delete && m.old_path.is_some() {
            return Err(SubmitError::Validation(format!("'{}' is both deleted and renamed", m.path)));
        }
    }
    Ok(())
}

/// Resolve each modification to a file identity and change type.
fn plan_changes(
    modifications: &[Modification],
    records: &HashMap<String, FileRecord>,
) -> Result<Vec<PlannedChange>, SubmitError> {
    let mut changes = Vec::with_capacity(modifications.len());
    for m in modifications {
        let existing = records.get(m.lookup_path());
        let change = if m.delete {
            let record = existing.ok_or_else(|| {
                SubmitError::Validation(format!("cannot delete '{}': no such file", m.path))
            })?;
            PlannedChange {
                file_id: record.id.clone(),
                change_type: FileChangeType::Delete,
                path: m.path.clone(),
                old_path: None,
            }
        } else if let Some(old_path) = &m.old_path {
            let record = existing.ok_or_else(|| {
                SubmitError::Validation(format!("cannot rename '{old_path}': no such file"))
            })?;
            if let Some(taken) = records.get(&m.path) {
                if taken.id != record.id {
                    return Err(SubmitError::Validation(format!(
                        "cannot rename '{old_path}' to '{}': path already exists",
                        m.path
                    )));
                }
            }
            PlannedChange {
                file_id: record.id.clone(),
                change_type: FileChangeType::Modify,
                path: m.path.clone(),
                old_path: Some(old_path.clone()),
            }
        } else {
            match existing {
                Some(record) => PlannedChange {
                    file_id: record.id.clone(),
                    change_type: FileChangeType::Modify,
                    path: m.path.clone(),
                    old_path: None,
                },
                None => PlannedChange {
                    file_id: Uuid::new_v4().to_string(),
                    change_type: FileChangeType::Add,
                    path: m.path.clone(),
                    old_path: None,
                },
            }
        };
        changes.push(change);
    }
    Ok(changes)
}
