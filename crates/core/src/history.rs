//! History/metadata service interface.
//!
//! The sync and submit engines only talk to history through
//! [`HistoryStore`]. [`crate::db::Database`] is the SQLite-backed
//! implementation.

use async_trait::async_trait;

use crate::errors::HistoryError;
use crate::models::{Branch, Changelist, ChangelistNumber, FileChangeType, FileId, FileRecord};
use crate::tree::StateTree;

/// One file change inside a [`CommitPlan`], with its identity already
/// resolved (new ids are generated by the allocator for adds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub file_id: FileId,
    pub change_type: FileChangeType,
    pub path: String,
    pub old_path: Option<String>,
}

/// Everything the allocator has decided for one submit attempt. Committed
/// as a single transaction by [`HistoryStore::commit_changelist`].
#[derive(Debug, Clone)]
pub struct CommitPlan {
    pub repo_id: String,
    pub branch: String,
    pub workspace_id: String,
    pub user_id: String,
    pub message: String,
    pub version_index: String,
    /// The changelist number to create.
    pub number: ChangelistNumber,
    /// The branch head read at the start of the attempt. The commit only
    /// succeeds if the branch still points here.
    pub parent_number: ChangelistNumber,
    pub state_tree: StateTree,
    pub changes: Vec<PlannedChange>,
    pub keep_checked_out: bool,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn get_branch(&self, repo_id: &str, name: &str) -> Result<Branch, HistoryError>;

    async fn get_changelist(
        &self,
        repo_id: &str,
        number: ChangelistNumber,
    ) -> Result<Changelist, HistoryError>;

    /// Changelists for the given numbers, ascending. Missing numbers are
    /// skipped.
    async fn get_changelists_with_numbers(
        &self,
        repo_id: &str,
        numbers: &[ChangelistNumber],
    ) -> Result<Vec<Changelist>, HistoryError>;

    async fn get_files(&self, repo_id: &str, ids: &[FileId]) -> Result<Vec<FileRecord>, HistoryError>;

    /// Live (not deleted) file records for the given paths.
    async fn find_files_by_path(
        &self,
        repo_id: &str,
        paths: &[String],
    ) -> Result<Vec<FileRecord>, HistoryError>;

    /// Highest changelist number in the repository across all branches.
    async fn max_changelist_number(&self, repo_id: &str) -> Result<ChangelistNumber, HistoryError>;

    /// Most recent changelists reachable from the head of `branch`, newest
    /// first.
    async fn list_changelists(
        &self,
        repo_id: &str,
        branch: &str,
        limit: u32,
    ) -> Result<Vec<Changelist>, HistoryError>;

    /// Atomically record file identities, the changelist, its file changes,
    /// checkout side effects, and advance the branch head from
    /// `plan.parent_number` to `plan.number`.
    ///
    /// Fails with [`HistoryError::WriteConflict`] if the number is taken or
    /// the head moved.
    async fn commit_changelist(&self, plan: CommitPlan) -> Result<Changelist, HistoryError>;
}
