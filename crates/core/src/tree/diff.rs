//! Diff between a local state tree and a target state tree.

use std::collections::BTreeSet;

use tracing::debug;

use super::StateTree;
use crate::models::{ChangelistNumber, FileId};

/// What a workspace must do to move from one state tree to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// Distinct changelists whose snapshots must be fetched, ascending.
    pub changelists_to_pull: Vec<ChangelistNumber>,
    /// File ids present locally but absent from the target, sorted.
    pub deletions: Vec<FileId>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.changelists_to_pull.is_empty() && self.deletions.is_empty()
    }
}

/// Compare `local` against `target` in O(|local| + |target|).
pub fn diff(local: &StateTree, target: &StateTree) -> StateDiff {
    let mut to_pull = BTreeSet::new();
    for (file_id, target_cl) in target.iter() {
        if local.get(file_id) != Some(target_cl) {
            to_pull.insert(target_cl);
        }
    }

    let mut deletions: Vec<FileId> = local
        .iter()
        .filter(|(file_id, _)| !target.contains(file_id))
        .map(|(file_id, _)| file_id.clone())
        .collect();
    deletions.sort();

    debug!(
        to_pull = to_pull.len(),
        deletions = deletions.len(),
        "computed state diff"
    );

    StateDiff {
        changelists_to_pull: to_pull.into_iter().collect(),
        deletions,
    }
}
