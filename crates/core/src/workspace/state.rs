//! The persisted workspace-state record (`.checkpoint/state.json`).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{hash_bytes, write_atomic};
use crate::errors::WorkspaceError;
use crate::models::{ChangelistNumber, FileId};
use crate::tree::StateTree;

/// Tracking metadata for one path, as observed at the last successful pull
/// or submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStateFile {
    pub file_id: FileId,
    pub changelist: ChangelistNumber,
    /// SHA-256 of the on-disk content, hex encoded.
    pub hash: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime: i64,
}

impl WorkspaceStateFile {
    /// Read `abs_path` and record it as `file_id` at `changelist`.
    pub fn observe(
        abs_path: &Path,
        file_id: impl Into<FileId>,
        changelist: ChangelistNumber,
    ) -> std::io::Result<Self> {
        let data = fs::read(abs_path)?;
        let mtime = fs::metadata(abs_path)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self {
            file_id: file_id.into(),
            changelist,
            hash: hash_bytes(&data),
            size: data.len() as u64,
            mtime,
        })
    }
}

/// A workspace's last-known position in history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    pub changelist_number: ChangelistNumber,
    #[serde(default)]
    pub files: BTreeMap<String, WorkspaceStateFile>,
}

impl WorkspaceState {
    /// Load the state record. A missing or unreadable record is treated as
    /// an empty workspace at changelist 0; a full pull repairs it.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read workspace state, starting from changelist 0");
                return Self::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt workspace state, starting from changelist 0");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)?;
        debug!(
            path = %path.display(),
            changelist = self.changelist_number,
            files = self.files.len(),
            "saved workspace state"
        );
        Ok(())
    }

    /// The local state tree: file id to recorded changelist.
    pub fn local_tree(&self) -> StateTree {
        self.files
            .values()
            .map(|f| (f.file_id.clone(), f.changelist))
            .collect()
    }

    /// File id to path lookup.
    pub fn paths_by_id(&self) -> HashMap<&str, &str> {
        self.files
            .iter()
            .map(|(path, f)| (f.file_id.as_str(), path.as_str()))
            .collect()
    }

    pub fn get(&self, path: &str) -> Option<&WorkspaceStateFile> {
        self.files.get(path)
    }

    /// `true` if the file at `abs_path` no longer matches the recorded hash.
    /// A tracked file missing from disk counts as modified.
    pub fn is_modified(&self, path: &str, abs_path: &Path) -> bool {
        let Some(entry) = self.files.get(path) else {
            return false;
        };
        match fs::read(abs_path) {
            Ok(data) => entry.size != data.len() as u64 || entry.hash != hash_bytes(&data),
            Err(_) => true,
        }
    }

    /// Tracked paths whose on-disk content no longer matches the record,
    /// sorted. Includes tracked files missing from disk.
    pub fn modified_paths(&self, root: &Path) -> Vec<String> {
        self.files
            .keys()
            .filter(|path| self.is_modified(path, &root.join(path.as_str())))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, cl: i64) -> WorkspaceStateFile {
        WorkspaceStateFile {
            file_id: id.into(),
            changelist: cl,
            hash: String::new(),
            size: 0,
            mtime: 0,
        }
    }

    #[test]
    fn test_missing_or_corrupt_state_defaults_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(WorkspaceState::load(&path), WorkspaceState::default());

        fs::write(&path, b"{ not json").unwrap();
        let state = WorkspaceState::load(&path);
        assert_eq!(state.changelist_number, 0);
        assert!(state.files.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut state = WorkspaceState {
            changelist_number: 5,
            ..Default::default()
        };
        state.files.insert("src/a.rs".into(), entry("f1", 5));
        state.save(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("changelistNumber"));
        assert!(raw.contains("fileId"));
        assert_eq!(WorkspaceState::load(&path), state);
    }

    #[test]
    fn test_local_tree_and_lookup() {
        let mut state = WorkspaceState::default();
        state.files.insert("a.txt".into(), entry("f1", 3));
        state.files.insert("b.txt".into(), entry("f2", 4));
        let tree = state.local_tree();
        assert_eq!(tree.get("f1"), Some(3));
        assert_eq!(tree.get("f2"), Some(4));
        assert_eq!(state.paths_by_id().get("f2"), Some(&"b.txt"));
    }

    #[test]
    fn test_is_modified_uses_recorded_hash() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "hello\n").unwrap();

        let mut state = WorkspaceState::default();
        state
            .files
            .insert("a.txt".into(), WorkspaceStateFile::observe(&file, "f1", 1).unwrap());
        assert!(!state.is_modified("a.txt", &file));

        fs::write(&file, "hello world\n").unwrap();
        assert!(state.is_modified("a.txt", &file));

        assert_eq!(state.modified_paths(dir.path()), vec!["a.txt".to_string()]);

        fs::remove_file(&file).unwrap();
        assert!(state.is_modified("a.txt", &file));
        assert!(!state.is_modified("untracked.txt", &file));
    }
}
