//! Staged modifications (`.checkpoint/staged.json`): adds, removes and
//! renames recorded by the user but not yet submitted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::write_atomic;
use crate::errors::WorkspaceError;
use crate::models::Modification;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedChanges {
    #[serde(default)]
    pub modifications: Vec<Modification>,
}

impl StagedChanges {
    /// Load the staged record; an unreadable record is treated as empty.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt staged record, ignoring");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Modification> {
        self.modifications.iter().find(|m| m.path == path)
    }

    /// Stage an add (or an explicit modify) of `path`.
    pub fn stage_add(&mut self, path: &str) {
        self.replace(path, Modification::upsert(path));
    }

    /// Stage a delete. Deleting a path that was staged as a rename target
    /// deletes the original file instead.
    pub fn stage_delete(&mut self, path: &str) {
        let original = self
            .get(path)
            .and_then(|m| m.old_path.clone())
            .unwrap_or_else(|| path.to_string());
        self.modifications.retain(|m| m.path != path);
        self.replace(&original, Modification::delete(original.clone()));
    }

    /// Stage a rename. Chained renames collapse into one from the original
    /// path; renaming a staged add just moves the add.
    pub fn stage_rename(&mut self, old_path: &str, new_path: &str) {
        let staged = self
            .modifications
            .iter()
            .position(|m| m.path == old_path && !m.delete);
        let next = match staged.map(|i| self.modifications.remove(i)) {
            Some(Modification {
                old_path: Some(original),
                ..
            }) => Modification::rename(original, new_path),
            Some(_) => Modification::upsert(new_path),
            None => Modification::rename(old_path, new_path),
        };
        self.replace(new_path, next);
    }

    /// Remove any staged entry for `path`.
    pub fn unstage(&mut self, path: &str) -> bool {
        let before = self.modifications.len();
        self.modifications.retain(|m| m.path != path);
        before != self.modifications.len()
    }

    pub fn clear(&mut self) {
        self.modifications.clear();
    }

    fn replace(&mut self, path: &str, modification: Modification) {
        self.modifications.retain(|m| m.path != path);
        self.modifications.push(modification);
    }
}
