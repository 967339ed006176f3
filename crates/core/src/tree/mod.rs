//! State trees: the complete set of files that exist as of a changelist,
//! each mapped to the changelist that last touched it.

pub mod diff;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{ChangelistNumber, FileId};

pub use diff::{diff, StateDiff};

/// One edit applied to a state tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEdit {
    /// ADD or MODIFY: the file exists at the new changelist.
    Upsert,
    /// DELETE: the file no longer exists.
    Delete,
}

/// Mapping of file identity to the changelist that last touched it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTree(HashMap<FileId, ChangelistNumber>);

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file_id: &str) -> Option<ChangelistNumber> {
        self.0.get(file_id).copied()
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.0.contains_key(file_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileId, ChangelistNumber)> {
        self.0.iter().map(|(id, n)| (id, *n))
    }

    /// File ids sorted, for stable output.
    pub fn sorted_ids(&self) -> Vec<&FileId> {
        let mut ids: Vec<&FileId> = self.0.keys().collect();
        ids.sort();
        ids
    }

    /// Compute the tree that results from applying `edits` as changelist
    /// `number`. If a file id appears more than once the last edit wins.
    pub fn apply<I, S>(&self, edits: I, number: ChangelistNumber) -> StateTree
    where
        I: IntoIterator<Item = (S, TreeEdit)>,
        S: Into<FileId>,
    {
        let mut next = self.0.clone();
        for (file_id, edit) in edits {
            match edit {
                TreeEdit::Upsert => {
                    next.insert(file_id.into(), number);
                }
                TreeEdit::Delete => {
                    next.remove(&file_id.into());
                }
            }
        }
        StateTree(next)
    }
}

impl FromIterator<(FileId, ChangelistNumber)> for StateTree {
    fn from_iter<T: IntoIterator<Item = (FileId, ChangelistNumber)>>(iter: T) -> Self {
        StateTree(iter.into_iter().collect())
    }
}

impl From<HashMap<FileId, ChangelistNumber>> for StateTree {
    fn from(map: HashMap<FileId, ChangelistNumber>) -> Self {
        StateTree(map)
    }
}
