//! Pull/merge executor.
//!
//! A pull moves a workspace to a target changelist:
//!
//! ```text
//! resolving target -> diffing -> fetching (ascending CLs) -> applying deletions
//!     -> auto-merging text files -> persisting state
//! ```
//!
//! Locally modified text files that the pull will overwrite are captured
//! before any fetch and three-way merged afterwards. If any fetch fails the
//! pull aborts: captured local content is written back and the workspace
//! state record is left untouched.
//!
//! With the conflict guard enabled, a pull refuses to start while a locally
//! modified file is binary and outdated or has been deleted on the remote.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::conflict::merger::{ConflictMarker, Merger};
use crate::errors::{ConflictEntry, HistoryError, SyncError, TransportError, WorkspaceError};
use crate::history::HistoryStore;
use crate::models::{Changelist, ChangelistNumber, ConflictKind, FileId};
use crate::status::is_binary;
use crate::transport::{ContentTransport, Credentials, FetchRequest, FetchTask};
use crate::tree::diff;
use crate::workspace::{write_atomic, Workspace, WorkspaceState, WorkspaceStateFile};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Steps of a pull, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullStep {
    ResolvingTarget,
    Diffing,
    Fetching,
    ApplyingDeletions,
    Merging,
    Persisting,
}

impl std::fmt::Display for PullStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolvingTarget => write!(f, "resolving_target"),
            Self::Diffing => write!(f, "diffing"),
            Self::Fetching => write!(f, "fetching"),
            Self::ApplyingDeletions => write!(f, "applying_deletions"),
            Self::Merging => write!(f, "merging"),
            Self::Persisting => write!(f, "persisting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    Clean,
    /// Merged with conflict markers left in the file.
    Conflicted { markers: Vec<ConflictMarker> },
    /// The merge could not run; the remote content was kept.
    Failed { reason: String },
}

/// Result of merging one locally modified file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMerge {
    pub path: String,
    pub file_id: FileId,
    pub base_changelist: ChangelistNumber,
    pub remote_changelist: ChangelistNumber,
    pub outcome: MergeOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullOutcome {
    pub from_changelist: ChangelistNumber,
    pub to_changelist: ChangelistNumber,
    pub fetched_changelists: Vec<ChangelistNumber>,
    pub deleted_paths: Vec<String>,
    pub merges: Vec<FileMerge>,
}

impl PullOutcome {
    /// Paths left with conflict markers.
    pub fn conflicted_paths(&self) -> Vec<&str> {
        self.merges
            .iter()
            .filter(|m| matches!(m.outcome, MergeOutcome::Conflicted { .. }))
            .map(|m| m.path.as_str())
            .collect()
    }
}

/// Local content captured before fetching.
#[derive(Debug)]
struct MergeCandidate {
    file_id: FileId,
    local_path: String,
    target_path: String,
    base_changelist: ChangelistNumber,
    remote_changelist: ChangelistNumber,
    local_content: String,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct PullExecutor {
    history: Arc<dyn HistoryStore>,
    transport: Arc<dyn ContentTransport>,
    repo_id: String,
    branch: String,
    credentials: Credentials,
    poll_interval: Duration,
    auto_merge: bool,
    conflict_guard: bool,
}

impl PullExecutor {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn ContentTransport>,
        repo_id: impl Into<String>,
        branch: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            history,
            transport,
            repo_id: repo_id.into(),
            branch: branch.into(),
            credentials,
            poll_interval: Duration::from_millis(100),
            auto_merge: true,
            conflict_guard: false,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_auto_merge(mut self, enabled: bool) -> Self {
        self.auto_merge = enabled;
        self
    }

    /// Refuse to pull over hard conflicts (see [`hard_conflicts`]) instead
    /// of leaving it to the caller to check first.
    pub fn with_conflict_guard(mut self, enabled: bool) -> Self {
        self.conflict_guard = enabled;
        self
    }

    /// Pull `ws` to `target`, or to the branch head as of this call.
    pub async fn pull(
        &self,
        ws: &Workspace,
        target: Option<ChangelistNumber>,
    ) -> Result<PullOutcome, SyncError> {
        let _lock = ws.lock()?;
        let root = ws.root();
        let state = ws.load_state();

        // -- resolving target
        let target_number = match target {
            Some(n) => n,
            None => self.history.get_branch(&self.repo_id, &self.branch).await?.head_number,
        };
        let target_cl = self.history.get_changelist(&self.repo_id, target_number).await?;
        info!(
            from = state.changelist_number,
            to = target_number,
            branch = %self.branch,
            "pull started"
        );

        // -- diffing
        let local_tree = state.local_tree();
        let delta = diff(&local_tree, &target_cl.state_tree);
        let local_paths = state.paths_by_id();

        if self.conflict_guard {
            let conflicts = hard_conflicts(root, &state, &target_cl);
            if !conflicts.is_empty() {
                warn!(count = conflicts.len(), "pull refused, unresolved conflicts");
                return Err(SyncError::Conflicts(conflicts));
            }
        }

        let incoming_ids: Vec<FileId> = target_cl
            .state_tree
            .iter()
            .filter(|(id, n)| local_tree.get(id) != Some(*n))
            .map(|(id, _)| id.clone())
            .collect();
        let mut target_paths: HashMap<FileId, String> = HashMap::new();
        if !incoming_ids.is_empty() {
            for record in self.history.get_files(&self.repo_id, &incoming_ids).await? {
                target_paths.insert(record.id, record.path);
            }
        }
        for id in &incoming_ids {
            if !target_paths.contains_key(id) {
                return Err(HistoryError::not_found("file", id).into());
            }
        }

        let candidates = if self.auto_merge {
            capture_candidates(root, &state, &target_cl, &target_paths)
        } else {
            Vec::new()
        };

        // -- fetching
        let snapshots = self
            .history
            .get_changelists_with_numbers(&self.repo_id, &delta.changelists_to_pull)
            .await?;
        if snapshots.len() != delta.changelists_to_pull.len() {
            let missing = delta
                .changelists_to_pull
                .iter()
                .find(|n| !snapshots.iter().any(|c| c.number == **n))
                .copied()
                .unwrap_or_default();
            return Err(HistoryError::not_found("changelist", missing).into());
        }

        let mut fetched = Vec::new();
        for snapshot in &snapshots {
            let mut paths: Vec<String> = target_cl
                .state_tree
                .iter()
                .filter(|(id, n)| *n == snapshot.number && local_tree.get(id) != Some(*n))
                .filter_map(|(id, _)| target_paths.get(id).cloned())
                .collect();
            paths.sort();

            if let Err(e) = self.fetch_snapshot(root, snapshot, paths).await {
                let (step, code) = match e {
                    TransportError::Failed { step, code } => (step, code),
                    other => (other.to_string(), -1),
                };
                let last_step = match fetched.last() {
                    Some(n) => format!("fetched CL {n}; CL {} failed at '{step}'", snapshot.number),
                    None => format!("CL {} failed at '{step}' before any snapshot completed", snapshot.number),
                };
                warn!(changelist = snapshot.number, code, last_step = %last_step, "pull aborted");
                restore_candidates(root, &candidates);
                return Err(SyncError::Transport { last_step, code });
            }
            debug!(changelist = snapshot.number, "snapshot applied");
            fetched.push(snapshot.number);
        }

        // -- applying deletions
        // Paths the target tree still uses, possibly by a different file.
        let occupied: HashSet<&str> = target_cl
            .state_tree
            .iter()
            .filter_map(|(id, _)| {
                target_paths
                    .get(id)
                    .map(String::as_str)
                    .or_else(|| local_paths.get(id.as_str()).copied())
            })
            .collect();

        let mut deleted_paths = Vec::new();
        for file_id in &delta.deletions {
            let Some(path) = local_paths.get(file_id.as_str()) else {
                continue;
            };
            if occupied.contains(path) {
                debug!(path = %path, "path reused by another file, keeping");
                continue;
            }
            remove_file(root, path)?;
            deleted_paths.push(path.to_string());
        }
        // Renamed files: the old path is gone once the new one is written.
        for (path, entry) in &state.files {
            if let Some(new_path) = target_paths.get(&entry.file_id) {
                if new_path != path && !occupied.contains(path.as_str()) {
                    remove_file(root, path)?;
                }
            }
        }

        // -- merging
        let merges = self.merge_candidates(root, &candidates).await;

        // -- persisting
        let mut files = BTreeMap::new();
        for (file_id, changelist) in target_cl.state_tree.iter() {
            let path = match target_paths.get(file_id) {
                Some(p) => p.clone(),
                None => match local_paths.get(file_id.as_str()) {
                    Some(p) => p.to_string(),
                    None => continue,
                },
            };
            let abs = root.join(&path);
            match WorkspaceStateFile::observe(&abs, file_id.clone(), changelist) {
                Ok(entry) => {
                    files.insert(path, entry);
                }
                Err(_) => {
                    // Tracked but absent on disk: keep the old record so the
                    // file shows as missing rather than untracked.
                    if let Some(prev) = state.files.get(&path).filter(|p| p.file_id == *file_id) {
                        files.insert(path, prev.clone());
                    }
                }
            }
        }
        let new_state = WorkspaceState {
            changelist_number: target_number,
            files,
        };
        ws.save_state(&new_state)?;

        let mut staged = ws.load_staged();
        let mut staged_any = false;
        for merge in &merges {
            // Merged content is hashed into the new state above, so the
            // local edits only stay visible as a staged modification.
            if !matches!(merge.outcome, MergeOutcome::Failed { .. }) && staged.get(&merge.path).is_none() {
                staged.stage_add(&merge.path);
                staged_any = true;
            }
        }
        if staged_any {
            ws.save_staged(&staged)?;
        }

        info!(
            from = state.changelist_number,
            to = target_number,
            fetched = fetched.len(),
            deleted = deleted_paths.len(),
            merged = merges.len(),
            "pull succeeded"
        );

        Ok(PullOutcome {
            from_changelist: state.changelist_number,
            to_changelist: target_number,
            fetched_changelists: fetched,
            deleted_paths,
            merges,
        })
    }

    /// Merge only `paths` up to the branch head, without moving the
    /// workspace's recorded changelist. Used before a submit so the files
    /// being submitted are current while the rest of the workspace stays
    /// behind.
    ///
    /// Every path is classified and all remote content is fetched before the
    /// first write, so a conflict or fetch error leaves the workspace as it
    /// was. If a write fails midway, files already merged are recorded.
    pub async fn merge_paths(&self, ws: &Workspace, paths: &[String]) -> Result<Vec<FileMerge>, SyncError> {
        let _lock = ws.lock()?;
        let root = ws.root();
        let mut state = ws.load_state();
        let mut staged = ws.load_staged();
        let head_number = self.history.get_branch(&self.repo_id, &self.branch).await?.head_number;
        let head = self.history.get_changelist(&self.repo_id, head_number).await?;

        // Classify.
        let mut conflicts = Vec::new();
        let mut work = Vec::new();
        for path in paths {
            let entry = state
                .get(path)
                .ok_or_else(|| SyncError::NotTracked(path.clone()))?
                .clone();
            let abs = root.join(path);
            let modified = state.is_modified(path, &abs);
            match head.state_tree.get(&entry.file_id) {
                None => conflicts.push(conflict_entry(path, &entry, None, ConflictKind::DeletedOnRemote)),
                Some(remote) if remote == entry.changelist => {}
                Some(remote) if modified && is_binary(&abs) => {
                    conflicts.push(conflict_entry(path, &entry, Some(remote), ConflictKind::Binary))
                }
                Some(remote) => work.push((path.clone(), entry, remote, modified)),
            }
        }
        if !conflicts.is_empty() {
            return Err(SyncError::Conflicts(conflicts));
        }

        // Fetch.
        let mut pending = Vec::with_capacity(work.len());
        for (path, entry, remote, modified) in work {
            let remote_cl = self.history.get_changelist(&self.repo_id, remote).await?;
            let remote_path = self
                .history
                .get_files(&self.repo_id, std::slice::from_ref(&entry.file_id))
                .await?
                .into_iter()
                .next()
                .map(|r| r.path)
                .unwrap_or_else(|| path.clone());
            let incoming = self
                .transport
                .fetch_file(&self.repo_id, &remote_cl.version_index, &remote_path)
                .await?;
            let local = if modified {
                let local_content = fs::read_to_string(root.join(&path)).map_err(WorkspaceError::from)?;
                let candidate = MergeCandidate {
                    file_id: entry.file_id.clone(),
                    local_path: path.clone(),
                    target_path: path.clone(),
                    base_changelist: entry.changelist,
                    remote_changelist: remote,
                    local_content,
                };
                let base = self.base_content(&candidate).await;
                Some((candidate, base))
            } else {
                None
            };
            pending.push((path, entry, remote, incoming, local));
        }

        // Write.
        let mut results = Vec::new();
        let mut failure = None;
        for (path, entry, remote, incoming, local) in pending {
            if let Err(e) = write_file(root, &path, &incoming) {
                failure = Some(e);
                break;
            }
            let modified = local.is_some();
            let outcome = match local {
                Some((candidate, base)) => merge_one(root, &candidate, base),
                None => MergeOutcome::Clean,
            };
            let abs = root.join(&path);
            match WorkspaceStateFile::observe(&abs, entry.file_id.clone(), remote) {
                Ok(updated) => {
                    state.files.insert(path.clone(), updated);
                }
                Err(e) => {
                    failure = Some(WorkspaceError::from(e));
                    break;
                }
            }
            if modified && !matches!(outcome, MergeOutcome::Failed { .. }) && staged.get(&path).is_none() {
                staged.stage_add(&path);
            }
            results.push(FileMerge {
                path,
                file_id: entry.file_id,
                base_changelist: entry.changelist,
                remote_changelist: remote,
                outcome,
            });
        }

        ws.save_state(&state)?;
        ws.save_staged(&staged)?;
        if let Some(e) = failure {
            warn!(merged = results.len(), error = %e, "pre-submit merge stopped");
            return Err(e.into());
        }
        info!(files = results.len(), head = head_number, "pre-submit merge finished");
        Ok(results)
    }

    async fn fetch_snapshot(
        &self,
        root: &Path,
        snapshot: &Changelist,
        paths: Vec<String>,
    ) -> Result<String, TransportError> {
        let request = FetchRequest {
            remote_base: self.repo_id.clone(),
            version_index: snapshot.version_index.clone(),
            local_root: root.to_path_buf(),
            credentials: self.credentials.clone(),
            paths: Some(paths),
        };
        let task = FetchTask::start(Arc::clone(&self.transport), request, self.poll_interval).await?;
        task.wait().await
    }

    async fn merge_candidates(&self, root: &Path, candidates: &[MergeCandidate]) -> Vec<FileMerge> {
        let mut merges = Vec::new();
        for candidate in candidates {
            let base = self.base_content(candidate).await;
            let outcome = merge_one(root, candidate, base);
            merges.push(FileMerge {
                path: candidate.target_path.clone(),
                file_id: candidate.file_id.clone(),
                base_changelist: candidate.base_changelist,
                remote_changelist: candidate.remote_changelist,
                outcome,
            });
        }
        merges
    }

    async fn base_content(&self, candidate: &MergeCandidate) -> Result<String, String> {
        let base_cl = self
            .history
            .get_changelist(&self.repo_id, candidate.base_changelist)
            .await
            .map_err(|e| e.to_string())?;
        let bytes = self
            .transport
            .fetch_file(&self.repo_id, &base_cl.version_index, &candidate.local_path)
            .await
            .map_err(|e| e.to_string())?;
        String::from_utf8(bytes).map_err(|_| "base content is not UTF-8".to_string())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Merge one candidate against the freshly written remote content at its
/// target path. Failures leave the remote content in place.
fn merge_one(root: &Path, candidate: &MergeCandidate, base: Result<String, String>) -> MergeOutcome {
    let path = &candidate.target_path;
    let base = match base {
        Ok(base) => base,
        Err(reason) => {
            warn!(path = %path, reason = %reason, "merge skipped, keeping remote content");
            return MergeOutcome::Failed { reason };
        }
    };
    let incoming = match fs::read_to_string(root.join(path)) {
        Ok(text) => text,
        Err(e) => {
            let reason = format!("cannot read incoming content: {e}");
            warn!(path = %path, reason = %reason, "merge skipped");
            return MergeOutcome::Failed { reason };
        }
    };

    let result = Merger::three_way_merge(&base, &candidate.local_content, &incoming);
    if let Err(e) = write_file(root, path, result.merged_content.as_bytes()) {
        let reason = format!("cannot write merged content: {e}");
        warn!(path = %path, reason = %reason, "merge skipped");
        return MergeOutcome::Failed { reason };
    }
    if result.has_conflicts {
        info!(path = %path, regions = result.conflict_markers.len(), "merge left conflict markers");
        MergeOutcome::Conflicted {
            markers: result.conflict_markers,
        }
    } else {
        debug!(path = %path, "clean merge");
        MergeOutcome::Clean
    }
}

/// Locally modified files a pull to `target` cannot merge: binary files the
/// target changes, and files the target no longer tracks. A file deleted on
/// both sides is not a conflict.
pub fn hard_conflicts(root: &Path, state: &WorkspaceState, target: &Changelist) -> Vec<ConflictEntry> {
    let mut conflicts = Vec::new();
    for (path, entry) in &state.files {
        let abs = root.join(path);
        if !abs.is_file() || !state.is_modified(path, &abs) {
            continue;
        }
        match target.state_tree.get(&entry.file_id) {
            None => conflicts.push(conflict_entry(path, entry, None, ConflictKind::DeletedOnRemote)),
            Some(remote) if remote != entry.changelist && is_binary(&abs) => {
                conflicts.push(conflict_entry(path, entry, Some(remote), ConflictKind::Binary))
            }
            Some(_) => {}
        }
    }
    conflicts
}

fn conflict_entry(
    path: &str,
    entry: &WorkspaceStateFile,
    remote: Option<ChangelistNumber>,
    kind: ConflictKind,
) -> ConflictEntry {
    ConflictEntry {
        path: path.to_string(),
        local_changelist: Some(entry.changelist),
        remote_changelist: remote,
        reason: kind.to_string(),
    }
}

/// Tracked text files that the pull will overwrite with a different
/// changelist and whose content differs from the recorded hash.
fn capture_candidates(
    root: &Path,
    state: &WorkspaceState,
    target: &Changelist,
    target_paths: &HashMap<FileId, String>,
) -> Vec<MergeCandidate> {
    let mut candidates = Vec::new();
    for (path, entry) in &state.files {
        let Some(remote) = target.state_tree.get(&entry.file_id) else {
            continue;
        };
        if remote == entry.changelist {
            continue;
        }
        let abs = root.join(path);
        if !abs.is_file() || !state.is_modified(path, &abs) || is_binary(&abs) {
            continue;
        }
        let Ok(local_content) = fs::read_to_string(&abs) else {
            continue;
        };
        debug!(path = %path, base = entry.changelist, remote, "captured merge candidate");
        candidates.push(MergeCandidate {
            file_id: entry.file_id.clone(),
            local_path: path.clone(),
            target_path: target_paths.get(&entry.file_id).cloned().unwrap_or_else(|| path.clone()),
            base_changelist: entry.changelist,
            remote_changelist: remote,
            local_content,
        });
    }
    candidates
}

/// Best-effort write-back of captured local content after a failed fetch.
fn restore_candidates(root: &Path, candidates: &[MergeCandidate]) {
    for candidate in candidates {
        if let Err(e) = write_file(root, &candidate.local_path, candidate.local_content.as_bytes()) {
            warn!(path = %candidate.local_path, error = %e, "could not restore local content");
        }
    }
}

fn write_file(root: &Path, path: &str, data: &[u8]) -> Result<(), WorkspaceError> {
    write_atomic(&root.join(path), data)
}

fn remove_file(root: &Path, path: &str) -> Result<(), WorkspaceError> {
    match fs::remove_file(root.join(path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
