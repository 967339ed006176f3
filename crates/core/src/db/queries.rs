//! Typed query helpers for the history tables, and the [`HistoryStore`]
//! implementation on top of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, info};

use super::Database;
use crate::errors::{DatabaseError, HistoryError};
use crate::history::{CommitPlan, HistoryStore};
use crate::models::{
    Branch, Changelist, ChangelistNumber, FileChange, FileChangeType, FileId, FileRecord,
};
use crate::tree::StateTree;

const CHANGELIST_COLUMNS: &str =
    "repo_id, number, message, parent_number, version_index, state_tree, user_id, created_at";

/// A `changelists` row before its JSON column is decoded.
struct ChangelistRow {
    repo_id: String,
    number: i64,
    message: String,
    parent_number: Option<i64>,
    version_index: String,
    state_tree: String,
    user_id: String,
    created_at: String,
}

impl ChangelistRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            repo_id: row.get(0)?,
            number: row.get(1)?,
            message: row.get(2)?,
            parent_number: row.get(3)?,
            version_index: row.get(4)?,
            state_tree: row.get(5)?,
            user_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Changelist, DatabaseError> {
        let state_tree: StateTree =
            serde_json::from_str(&self.state_tree).map_err(|e| DatabaseError::CorruptColumn {
                column: "changelists.state_tree".into(),
                detail: format!("changelist {}: {e}", self.number),
            })?;
        Ok(Changelist {
            repo_id: self.repo_id,
            number: self.number,
            message: self.message,
            parent_number: self.parent_number,
            version_index: self.version_index,
            state_tree,
            user_id: self.user_id,
            created_at: parse_datetime(&self.created_at),
        })
    }
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- repos & branches ---------------------------------------------------

    /// Create a repository with changelist 0 (empty tree, empty version
    /// index) and a default branch pointing at it.
    pub fn create_repo(
        &self,
        repo_id: &str,
        name: &str,
        default_branch: &str,
        user_id: &str,
    ) -> Result<Branch, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO repos (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![repo_id, name, now],
            )?;
            conn.execute(
                "INSERT INTO changelists
                 (repo_id, number, message, parent_number, version_index, state_tree, user_id, created_at)
                 VALUES (?1, 0, 'repository created', NULL, '', '{}', ?2, ?3)",
                params![repo_id, user_id, now],
            )?;
            conn.execute(
                "INSERT INTO branches (repo_id, name, head_number, is_default, created_at)
                 VALUES (?1, ?2, 0, 1, ?3)",
                params![repo_id, default_branch, now],
            )?;
            Ok(())
        })?;
        info!(repo_id, name, default_branch, "created repository");
        Ok(Branch {
            repo_id: repo_id.to_string(),
            name: default_branch.to_string(),
            head_number: 0,
            is_default: true,
            archived_at: None,
        })
    }

    /// Create a non-default branch whose head is `from_number`.
    pub fn create_branch(
        &self,
        repo_id: &str,
        name: &str,
        from_number: ChangelistNumber,
    ) -> Result<Branch, DatabaseError> {
        // Make sure the starting changelist exists before pointing at it.
        self.get_changelist_row(repo_id, from_number)?;
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO branches (repo_id, name, head_number, is_default, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![repo_id, name, from_number, now],
        )?;
        debug!(repo_id, name, from_number, "created branch");
        Ok(Branch {
            repo_id: repo_id.to_string(),
            name: name.to_string(),
            head_number: from_number,
            is_default: false,
            archived_at: None,
        })
    }

    /// Get a branch by name (returns an error if not found).
    pub fn get_branch_row(&self, repo_id: &str, name: &str) -> Result<Branch, DatabaseError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT repo_id, name, head_number, is_default, archived_at
             FROM branches WHERE repo_id = ?1 AND name = ?2",
            params![repo_id, name],
            |row| {
                let archived_at: Option<String> = row.get(4)?;
                Ok(Branch {
                    repo_id: row.get(0)?,
                    name: row.get(1)?,
                    head_number: row.get(2)?,
                    is_default: row.get::<_, i64>(3)? != 0,
                    archived_at: archived_at.as_deref().map(parse_datetime),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                entity: "branch".into(),
                id: format!("{repo_id}/{name}"),
            },
            other => other.into(),
        })
    }

    // -- changelists --------------------------------------------------------

    pub fn get_changelist_row(
        &self,
        repo_id: &str,
        number: ChangelistNumber,
    ) -> Result<Changelist, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CHANGELIST_COLUMNS} FROM changelists WHERE repo_id = ?1 AND number = ?2"
                ),
                params![repo_id, number],
                ChangelistRow::from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DatabaseError::NotFound {
                    entity: "changelist".into(),
                    id: format!("{repo_id}@{number}"),
                },
                other => other.into(),
            })?;
        row.decode()
    }

    pub fn list_changelists_by_number(
        &self,
        repo_id: &str,
        numbers: &[ChangelistNumber],
    ) -> Result<Vec<Changelist>, DatabaseError> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {CHANGELIST_COLUMNS} FROM changelists
             WHERE repo_id = ?1 AND number IN ({}) ORDER BY number ASC",
            placeholders(2, numbers.len())
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(rusqlite::types::Value::from(repo_id.to_string()))
            .chain(numbers.iter().map(|n| rusqlite::types::Value::from(*n)));
        let rows = stmt
            .query_map(params_from_iter(args), ChangelistRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ChangelistRow::decode).collect()
    }

    /// Highest changelist number in the repository (0 for a fresh repo).
    pub fn max_changelist_row(&self, repo_id: &str) -> Result<ChangelistNumber, DatabaseError> {
        let conn = self.conn();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(number) FROM changelists WHERE repo_id = ?1",
            params![repo_id],
            |row| row.get(0),
        )?;
        max.ok_or_else(|| DatabaseError::NotFound {
            entity: "repository".into(),
            id: repo_id.to_string(),
        })
    }

    /// Walk the parent chain from `head` and return up to `limit`
    /// changelists, newest first.
    pub fn list_changelist_chain(
        &self,
        repo_id: &str,
        head: ChangelistNumber,
        limit: u32,
    ) -> Result<Vec<Changelist>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE chain(n, depth) AS (
                 SELECT ?2, 1
                 UNION ALL
                 SELECT c.parent_number, chain.depth + 1
                 FROM changelists c JOIN chain ON c.repo_id = ?1 AND c.number = chain.n
                 WHERE c.parent_number IS NOT NULL AND chain.depth < ?3
             )
             SELECT {} FROM changelists c JOIN chain ON c.number = chain.n
             WHERE c.repo_id = ?1 ORDER BY c.number DESC",
            CHANGELIST_COLUMNS
                .split(", ")
                .map(|col| format!("c.{col}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![repo_id, head, limit], ChangelistRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ChangelistRow::decode).collect()
    }

    // -- files --------------------------------------------------------------

    pub fn list_files_by_id(
        &self,
        repo_id: &str,
        ids: &[FileId],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.query_files("id", repo_id, ids, false)
    }

    pub fn list_live_files_by_path(
        &self,
        repo_id: &str,
        paths: &[String],
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        self.query_files("path", repo_id, paths, true)
    }

    fn query_files(
        &self,
        column: &str,
        repo_id: &str,
        keys: &[String],
        live_only: bool,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, repo_id, path FROM files WHERE repo_id = ?1 AND {column} IN ({}){}",
            placeholders(2, keys.len()),
            if live_only { " AND deleted_at IS NULL" } else { "" }
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(repo_id).chain(keys.iter().map(String::as_str));
        let files = stmt
            .query_map(params_from_iter(args), |row| {
                Ok(FileRecord {
                    id: row.get(0)?,
                    repo_id: row.get(1)?,
                    path: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn list_file_changes(
        &self,
        repo_id: &str,
        changelist: ChangelistNumber,
    ) -> Result<Vec<FileChange>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT file_id, changelist, change_type, path, old_path FROM file_changes
             WHERE repo_id = ?1 AND changelist = ?2 ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map(params![repo_id, changelist], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(file_id, changelist, kind, path, old_path)| {
                let change_type =
                    FileChangeType::from_str_val(&kind).ok_or_else(|| DatabaseError::CorruptColumn {
                        column: "file_changes.change_type".into(),
                        detail: kind.clone(),
                    })?;
                Ok(FileChange {
                    file_id,
                    changelist,
                    change_type,
                    path,
                    old_path,
                })
            })
            .collect()
    }

    // -- checkouts ----------------------------------------------------------

    pub fn checkout_file(
        &self,
        repo_id: &str,
        workspace_id: &str,
        file_id: &str,
        user_id: &str,
    ) -> Result<(), DatabaseError> {
        insert_checkout(&self.conn(), repo_id, workspace_id, file_id, user_id)
    }

    /// File ids checked out by `workspace_id`, sorted.
    pub fn list_checkouts(
        &self,
        repo_id: &str,
        workspace_id: &str,
    ) -> Result<Vec<FileId>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT file_id FROM checkouts WHERE repo_id = ?1 AND workspace_id = ?2
             ORDER BY file_id ASC",
        )?;
        let ids = stmt
            .query_map(params![repo_id, workspace_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // -- commit -------------------------------------------------------------

    /// Apply a [`CommitPlan`] in one transaction. Any failure rolls back
    /// every write of the attempt.
    pub fn commit_plan(&self, plan: &CommitPlan) -> Result<Changelist, DatabaseError> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let tree_json = serde_json::to_string(&plan.state_tree).map_err(|e| {
            DatabaseError::CorruptColumn {
                column: "changelists.state_tree".into(),
                detail: e.to_string(),
            }
        })?;

        self.transaction(|conn| {
            for change in &plan.changes {
                match change.change_type {
                    FileChangeType::Add => {
                        conn.execute(
                            "INSERT INTO files (id, repo_id, path, created_at) VALUES (?1, ?2, ?3, ?4)",
                            params![change.file_id, plan.repo_id, change.path, now_str],
                        )?;
                    }
                    FileChangeType::Modify => {
                        if change.old_path.is_some() {
                            conn.execute(
                                "UPDATE files SET path = ?1 WHERE id = ?2",
                                params![change.path, change.file_id],
                            )?;
                        }
                    }
                    FileChangeType::Delete => {
                        conn.execute(
                            "UPDATE files SET deleted_at = ?1 WHERE id = ?2",
                            params![now_str, change.file_id],
                        )?;
                    }
                }
            }

            conn.execute(
                "INSERT INTO changelists
                 (repo_id, number, message, parent_number, version_index, state_tree, user_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    plan.repo_id,
                    plan.number,
                    plan.message,
                    plan.parent_number,
                    plan.version_index,
                    tree_json,
                    plan.user_id,
                    now_str
                ],
            )?;

            let moved = conn.execute(
                "UPDATE branches SET head_number = ?1
                 WHERE repo_id = ?2 AND name = ?3 AND head_number = ?4 AND head_number < ?1",
                params![plan.number, plan.repo_id, plan.branch, plan.parent_number],
            )?;
            if moved == 0 {
                let current: Option<i64> = conn
                    .query_row(
                        "SELECT head_number FROM branches WHERE repo_id = ?1 AND name = ?2",
                        params![plan.repo_id, plan.branch],
                        |row| row.get(0),
                    )
                    .optional()?;
                return Err(match current {
                    None => DatabaseError::NotFound {
                        entity: "branch".into(),
                        id: format!("{}/{}", plan.repo_id, plan.branch),
                    },
                    Some(head) => DatabaseError::Conflict(format!(
                        "branch '{}' head moved from {} to {}",
                        plan.branch, plan.parent_number, head
                    )),
                });
            }

            for change in &plan.changes {
                conn.execute(
                    "INSERT INTO file_changes (repo_id, changelist, file_id, change_type, path, old_path)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        plan.repo_id,
                        plan.number,
                        change.file_id,
                        change.change_type.to_string(),
                        change.path,
                        change.old_path
                    ],
                )?;

                let clear = !plan.keep_checked_out || change.change_type == FileChangeType::Delete;
                if clear {
                    conn.execute(
                        "DELETE FROM checkouts WHERE repo_id = ?1 AND workspace_id = ?2 AND file_id = ?3",
                        params![plan.repo_id, plan.workspace_id, change.file_id],
                    )?;
                } else if change.change_type == FileChangeType::Add {
                    insert_checkout(
                        conn,
                        &plan.repo_id,
                        &plan.workspace_id,
                        &change.file_id,
                        &plan.user_id,
                    )?;
                }
            }
            Ok(())
        })?;

        debug!(
            repo_id = %plan.repo_id,
            branch = %plan.branch,
            number = plan.number,
            changes = plan.changes.len(),
            "committed changelist"
        );

        Ok(Changelist {
            repo_id: plan.repo_id.clone(),
            number: plan.number,
            message: plan.message.clone(),
            parent_number: Some(plan.parent_number),
            version_index: plan.version_index.clone(),
            state_tree: plan.state_tree.clone(),
            user_id: plan.user_id.clone(),
            created_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// HistoryStore
// ---------------------------------------------------------------------------

#[async_trait]
impl HistoryStore for Database {
    async fn get_branch(&self, repo_id: &str, name: &str) -> Result<Branch, HistoryError> {
        Ok(self.get_branch_row(repo_id, name)?)
    }

    async fn get_changelist(
        &self,
        repo_id: &str,
        number: ChangelistNumber,
    ) -> Result<Changelist, HistoryError> {
        Ok(self.get_changelist_row(repo_id, number)?)
    }

    async fn get_changelists_with_numbers(
        &self,
        repo_id: &str,
        numbers: &[ChangelistNumber],
    ) -> Result<Vec<Changelist>, HistoryError> {
        Ok(self.list_changelists_by_number(repo_id, numbers)?)
    }

    async fn get_files(&self, repo_id: &str, ids: &[FileId]) -> Result<Vec<FileRecord>, HistoryError> {
        Ok(self.list_files_by_id(repo_id, ids)?)
    }

    async fn find_files_by_path(
        &self,
        repo_id: &str,
        paths: &[String],
    ) -> Result<Vec<FileRecord>, HistoryError> {
        Ok(self.list_live_files_by_path(repo_id, paths)?)
    }

    async fn max_changelist_number(&self, repo_id: &str) -> Result<ChangelistNumber, HistoryError> {
        Ok(self.max_changelist_row(repo_id)?)
    }

    async fn list_changelists(
        &self,
        repo_id: &str,
        branch: &str,
        limit: u32,
    ) -> Result<Vec<Changelist>, HistoryError> {
        let branch = self.get_branch_row(repo_id, branch)?;
        Ok(self.list_changelist_chain(repo_id, branch.head_number, limit)?)
    }

    async fn commit_changelist(&self, plan: CommitPlan) -> Result<Changelist, HistoryError> {
        Ok(self.commit_plan(&plan)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn insert_checkout(
    conn: &Connection,
    repo_id: &str,
    workspace_id: &str,
    file_id: &str,
    user_id: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO checkouts (repo_id, workspace_id, file_id, user_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![repo_id, workspace_id, file_id, user_id, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// `?start, ?start+1, ...` for an `IN (...)` clause of `count` values.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a datetime string, returning Utc::now() as a fallback if parsing fails.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::PlannedChange;
    use crate::tree::TreeEdit;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.create_repo("r1", "game", "main", "alice").unwrap();
        db
    }

    fn add_plan(number: i64, parent: i64, file_id: &str, path: &str) -> CommitPlan {
        let parent_tree = StateTree::new();
        CommitPlan {
            repo_id: "r1".into(),
            branch: "main".into(),
            workspace_id: "ws1".into(),
            user_id: "alice".into(),
            message: format!("add {path}"),
            version_index: format!("v{number}"),
            number,
            parent_number: parent,
            state_tree: parent_tree.apply([(file_id, TreeEdit::Upsert)], number),
            changes: vec![PlannedChange {
                file_id: file_id.into(),
                change_type: FileChangeType::Add,
                path: path.into(),
                old_path: None,
            }],
            keep_checked_out: true,
        }
    }

    #[test]
    fn test_create_repo_bootstraps_changelist_zero() {
        let db = setup_db();
        let branch = db.get_branch_row("r1", "main").unwrap();
        assert_eq!(branch.head_number, 0);
        assert!(branch.is_default);

        let cl = db.get_changelist_row("r1", 0).unwrap();
        assert_eq!(cl.version_index, "");
        assert!(cl.state_tree.is_empty());
        assert_eq!(cl.parent_number, None);
        assert_eq!(db.max_changelist_row("r1").unwrap(), 0);
    }

    #[test]
    fn test_missing_rows_are_not_found() {
        let db = setup_db();
        assert!(matches!(
            db.get_branch_row("r1", "dev"),
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(matches!(
            db.get_changelist_row("r1", 42),
            Err(DatabaseError::NotFound { .. })
        ));
        assert!(matches!(
            db.max_changelist_row("nope"),
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[test]
    fn test_commit_plan_advances_head_and_records_changes() {
        let db = setup_db();
        let cl = db.commit_plan(&add_plan(1, 0, "f1", "src/main.rs")).unwrap();
        assert_eq!(cl.number, 1);
        assert_eq!(cl.parent_number, Some(0));

        assert_eq!(db.get_branch_row("r1", "main").unwrap().head_number, 1);
        let stored = db.get_changelist_row("r1", 1).unwrap();
        assert_eq!(stored.state_tree.get("f1"), Some(1));

        let changes = db.list_file_changes("r1", 1).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, FileChangeType::Add);

        let files = db.list_live_files_by_path("r1", &["src/main.rs".into()]).unwrap();
        assert_eq!(files[0].id, "f1");
        assert_eq!(db.list_checkouts("r1", "ws1").unwrap(), vec!["f1".to_string()]);
    }

    #[test]
    fn test_commit_plan_rejects_stale_head() {
        let db = setup_db();
        db.commit_plan(&add_plan(1, 0, "f1", "a.txt")).unwrap();

        // Second writer still believes head is 0.
        let err = db.commit_plan(&add_plan(2, 0, "f2", "b.txt")).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        // Nothing from the failed attempt survived.
        assert!(db.list_files_by_id("r1", &["f2".into()]).unwrap().is_empty());
        assert!(matches!(
            db.get_changelist_row("r1", 2),
            Err(DatabaseError::NotFound { .. })
        ));
        assert_eq!(db.get_branch_row("r1", "main").unwrap().head_number, 1);
    }

    #[test]
    fn test_commit_plan_duplicate_number_is_write_conflict() {
        let db = setup_db();
        db.commit_plan(&add_plan(1, 0, "f1", "a.txt")).unwrap();
        let err: HistoryError = db.commit_plan(&add_plan(1, 1, "f2", "b.txt")).unwrap_err().into();
        assert!(err.is_write_conflict());
    }

    #[test]
    fn test_changelist_chain_and_lookup() {
        let db = setup_db();
        db.commit_plan(&add_plan(1, 0, "f1", "a.txt")).unwrap();
        db.commit_plan(&add_plan(2, 1, "f2", "b.txt")).unwrap();
        db.commit_plan(&add_plan(3, 2, "f3", "c.txt")).unwrap();

        let chain = db.list_changelist_chain("r1", 3, 2).unwrap();
        let numbers: Vec<i64> = chain.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![3, 2]);

        let picked = db.list_changelists_by_number("r1", &[3, 1, 99]).unwrap();
        let numbers: Vec<i64> = picked.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(db.max_changelist_row("r1").unwrap(), 3);
    }

    #[test]
    fn test_create_branch_requires_existing_changelist() {
        let db = setup_db();
        assert!(db.create_branch("r1", "dev", 5).is_err());
        let dev = db.create_branch("r1", "dev", 0).unwrap();
        assert!(!dev.is_default);
        assert!(db.create_branch("r1", "dev", 0).is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
    }
}
