//! File status resolution.
//!
//! [`StatusResolver`] classifies workspace-relative paths by combining disk
//! reality, ignore/cloak patterns, the pending change set and the recorded
//! workspace state. The first matching rule wins:
//!
//! 1. directory: `Unknown`
//! 2. pending change: its status verbatim
//! 3. ignore pattern: `Ignored`
//! 4. cloak pattern: `HiddenChanges` (tracking ids still resolved)
//! 5. tracked: `Unknown` if missing on disk, else writable/read-only controlled
//! 6. untracked on disk: `Local`
//! 7. otherwise `Unknown`

pub mod binary;
pub mod patterns;

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::errors::WorkspaceError;
use crate::models::{FileStatus, PendingChangeSet, ResolvedFile};
use crate::workspace::{WorkspaceState, META_DIR};

pub use binary::is_binary;
pub use patterns::{PatternCache, PatternSet};

pub struct StatusResolver {
    cache: PatternCache,
}

impl StatusResolver {
    pub fn new(pattern_ttl: Duration) -> Self {
        Self {
            cache: PatternCache::new(pattern_ttl),
        }
    }

    /// Resolve a single path.
    pub fn resolve(
        &self,
        root: &Path,
        state: &WorkspaceState,
        pending: &PendingChangeSet,
        path: &str,
    ) -> Result<ResolvedFile, WorkspaceError> {
        let patterns = self.cache.get(root)?;
        Ok(resolve_with(&patterns, root, state, pending, path))
    }

    /// Resolve many paths against one pattern-set load.
    pub fn resolve_batch(
        &self,
        root: &Path,
        state: &WorkspaceState,
        pending: &PendingChangeSet,
        paths: &[String],
    ) -> Result<Vec<ResolvedFile>, WorkspaceError> {
        let patterns = self.cache.get(root)?;
        Ok(paths
            .iter()
            .map(|p| resolve_with(&patterns, root, state, pending, p))
            .collect())
    }

    /// Forget cached patterns for `root` after a marker file changed.
    pub fn invalidate(&self, root: &Path) {
        self.cache.invalidate(root);
    }
}

/// Resolve one path against an already loaded pattern set.
pub fn resolve_with(
    patterns: &PatternSet,
    root: &Path,
    state: &WorkspaceState,
    pending: &PendingChangeSet,
    path: &str,
) -> ResolvedFile {
    let abs = root.join(path);
    let meta = fs::metadata(&abs).ok();
    let tracked = state.get(path);

    let resolved = |status: FileStatus, with_ids: bool| ResolvedFile {
        path: path.to_string(),
        status,
        file_id: tracked.filter(|_| with_ids).map(|t| t.file_id.clone()),
        changelist: tracked.filter(|_| with_ids).map(|t| t.changelist),
    };

    if meta.as_ref().is_some_and(|m| m.is_dir()) {
        return resolved(FileStatus::Unknown, false);
    }

    if let Some(change) = pending.get(path) {
        return ResolvedFile {
            path: path.to_string(),
            status: change.status,
            file_id: change.file_id.clone(),
            changelist: change.changelist,
        };
    }

    if patterns.is_ignored(path) {
        return resolved(FileStatus::Ignored, false);
    }

    if patterns.is_cloaked(path) {
        return resolved(FileStatus::HiddenChanges, true);
    }

    if tracked.is_some() {
        let status = match &meta {
            None => {
                debug!(path, "tracked file missing on disk");
                FileStatus::Unknown
            }
            Some(m) if m.permissions().readonly() => FileStatus::ReadOnlyControlled,
            Some(_) => FileStatus::WritableControlled,
        };
        return resolved(status, true);
    }

    if meta.is_some() {
        return resolved(FileStatus::Local, false);
    }

    resolved(FileStatus::Unknown, false)
}

/// Every file path under `root` (skipping the metadata directory), sorted.
pub fn collect_workspace_paths(root: &Path) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    collect(root, "", &mut out)?;
    out.sort();
    Ok(out)
}

fn collect(dir: &Path, rel_dir: &str, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if rel_dir.is_empty() && name == META_DIR {
            continue;
        }
        let rel = if rel_dir.is_empty() {
            name
        } else {
            format!("{rel_dir}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect(&entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}
