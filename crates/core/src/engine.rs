//! Wiring for one workspace configuration.
//!
//! [`Engine`] owns the history database, the content transport, the status
//! resolver and the workspace registry, and hands out the sync components
//! configured from [`CheckpointConfig`].

use std::fs;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CheckpointConfig;
use crate::conflict::{scan_conflict_markers, ConflictResolver, SyncChecker};
use crate::db::Database;
use crate::errors::{CoreError, WorkspaceError};
use crate::history::HistoryStore;
use crate::models::{FileStatus, PendingChange, PendingChangeSet, ResolvedFile};
use crate::pull::PullExecutor;
use crate::registry::WorkspaceRegistry;
use crate::status::{collect_workspace_paths, is_binary, StatusResolver};
use crate::submit::SubmitAllocator;
use crate::transport::{ContentTransport, Credentials, LocalBlockStore};
use crate::workspace::Workspace;

pub struct Engine {
    config: CheckpointConfig,
    db: Arc<Database>,
    transport: Arc<dyn ContentTransport>,
    status: StatusResolver,
    registry: WorkspaceRegistry,
}

impl Engine {
    /// Open the history database and the local block store named by
    /// `config`.
    pub fn open(config: CheckpointConfig) -> Result<Self, CoreError> {
        if let Some(parent) = config.server.database.parent() {
            fs::create_dir_all(parent).map_err(WorkspaceError::from)?;
        }
        let db = Database::new(&config.server.database)?;
        db.initialize()?;
        fs::create_dir_all(&config.store.path).map_err(WorkspaceError::from)?;
        let store = LocalBlockStore::new(&config.store.path).with_token(config.store.token.clone());
        info!(
            database = %config.server.database.display(),
            store = %config.store.path.display(),
            "engine ready"
        );
        Ok(Self::with_parts(config, Arc::new(db), Arc::new(store)))
    }

    /// Build an engine from already constructed collaborators.
    pub fn with_parts(
        config: CheckpointConfig,
        db: Arc<Database>,
        transport: Arc<dyn ContentTransport>,
    ) -> Self {
        let status = StatusResolver::new(config.sync.pattern_cache_ttl());
        Self {
            config,
            db,
            transport,
            status,
            registry: WorkspaceRegistry::new(),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    pub fn status_resolver(&self) -> &StatusResolver {
        &self.status
    }

    fn history(&self) -> Arc<dyn HistoryStore> {
        self.db.clone()
    }

    /// Fresh credentials for the content store.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.config.store.token.clone(), self.config.store.expiry_secs)
    }

    pub fn checker(&self) -> SyncChecker {
        let ws = &self.config.workspace;
        SyncChecker::new(self.history(), &ws.repo_id, &ws.branch)
    }

    pub fn pull_executor(&self) -> PullExecutor {
        let ws = &self.config.workspace;
        PullExecutor::new(
            self.history(),
            Arc::clone(&self.transport),
            &ws.repo_id,
            &ws.branch,
            self.credentials(),
        )
        .with_poll_interval(self.config.sync.poll_interval())
        .with_auto_merge(self.config.sync.auto_merge)
        .with_conflict_guard(true)
    }

    pub fn submitter(&self) -> SubmitAllocator {
        let ws = &self.config.workspace;
        SubmitAllocator::new(
            self.history(),
            Arc::clone(&self.transport),
            &ws.repo_id,
            &ws.workspace_id,
            &ws.user_id,
            self.credentials(),
        )
        .with_max_attempts(self.config.sync.submit_attempts)
    }

    pub fn resolver(&self) -> ConflictResolver {
        let ws = &self.config.workspace;
        ConflictResolver::new(self.history(), Arc::clone(&self.transport), &ws.repo_id, &ws.branch)
    }

    /// Register `ws` under `session_id` with a pending set derived from its
    /// staged record and on-disk content.
    pub fn open_session(&self, session_id: &str, ws: &Workspace) {
        self.registry.register(session_id, ws.clone());
        for (path, change) in pending_changes(ws) {
            self.registry.record_pending(session_id, &path, change);
        }
    }

    /// Resolve the status of every path in the session's workspace: files
    /// on disk plus tracked and pending paths missing from it.
    pub fn session_status(&self, session_id: &str) -> Result<Vec<ResolvedFile>, CoreError> {
        let ws = self
            .registry
            .get(session_id)
            .ok_or_else(|| WorkspaceError::NotInitialized(format!("session {session_id}")))?;
        let state = ws.load_state();
        let pending = self.registry.pending_snapshot(session_id);

        let mut paths = collect_workspace_paths(ws.root()).map_err(WorkspaceError::from)?;
        paths.extend(state.files.keys().cloned());
        paths.extend(pending.keys().cloned());
        paths.sort();
        paths.dedup();

        Ok(self.status.resolve_batch(ws.root(), &state, &pending, &paths)?)
    }
}

/// Pending statuses for a workspace: staged modifications, unstaged edits
/// to tracked files, and text files still carrying conflict markers.
pub fn pending_changes(ws: &Workspace) -> PendingChangeSet {
    let root = ws.root();
    let state = ws.load_state();
    let staged = ws.load_staged();
    let mut pending = PendingChangeSet::new();

    let tracked = |path: &str| state.get(path).map(|e| (e.file_id.clone(), e.changelist));

    for m in &staged.modifications {
        let (status, ids) = if m.delete {
            (FileStatus::Deleted, tracked(m.path.as_str()))
        } else if let Some(old) = &m.old_path {
            (FileStatus::Renamed, tracked(old.as_str()))
        } else if has_conflict_markers(&root.join(&m.path)) {
            (FileStatus::Conflicted, tracked(m.path.as_str()))
        } else if let Some(ids) = tracked(m.path.as_str()) {
            (FileStatus::Modified, Some(ids))
        } else {
            (FileStatus::Added, None)
        };
        pending.insert(
            m.path.clone(),
            PendingChange {
                status,
                file_id: ids.as_ref().map(|(id, _)| id.clone()),
                changelist: ids.map(|(_, cl)| cl),
            },
        );
    }

    for path in state.modified_paths(root) {
        if pending.contains_key(&path) || !root.join(&path).is_file() {
            continue;
        }
        let status = if has_conflict_markers(&root.join(&path)) {
            FileStatus::Conflicted
        } else {
            FileStatus::Modified
        };
        let ids = tracked(path.as_str());
        pending.insert(
            path,
            PendingChange {
                status,
                file_id: ids.as_ref().map(|(id, _)| id.clone()),
                changelist: ids.map(|(_, cl)| cl),
            },
        );
    }

    debug!(count = pending.len(), "derived pending changes");
    pending
}

fn has_conflict_markers(abs: &std::path::Path) -> bool {
    if !abs.is_file() || is_binary(abs) {
        return false;
    }
    fs::read_to_string(abs)
        .map(|text| !scan_conflict_markers(&text).is_empty())
        .unwrap_or(false)
}
