//! Database schema definitions and migration runner.
//!
//! Migrations are plain SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial history schema",
        r#"
        CREATE TABLE IF NOT EXISTS repos (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS changelists (
            repo_id        TEXT    NOT NULL REFERENCES repos (id),
            number         INTEGER NOT NULL CHECK (number >= 0),
            message        TEXT    NOT NULL DEFAULT '',
            parent_number  INTEGER,
            version_index  TEXT    NOT NULL,
            state_tree     TEXT    NOT NULL,
            user_id        TEXT    NOT NULL,
            created_at     TEXT    NOT NULL,
            PRIMARY KEY (repo_id, number),
            CHECK (version_index <> '' OR number = 0)
        );

        CREATE TABLE IF NOT EXISTS branches (
            repo_id      TEXT    NOT NULL REFERENCES repos (id),
            name         TEXT    NOT NULL,
            head_number  INTEGER NOT NULL,
            is_default   INTEGER NOT NULL DEFAULT 0,
            archived_at  TEXT,
            created_at   TEXT    NOT NULL,
            UNIQUE (repo_id, name)
        );

        CREATE TABLE IF NOT EXISTS files (
            id          TEXT PRIMARY KEY,
            repo_id     TEXT NOT NULL REFERENCES repos (id),
            path        TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            deleted_at  TEXT
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_files_live_path
            ON files (repo_id, path) WHERE deleted_at IS NULL;

        CREATE TABLE IF NOT EXISTS file_changes (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            repo_id     TEXT    NOT NULL,
            changelist  INTEGER NOT NULL,
            file_id     TEXT    NOT NULL REFERENCES files (id),
            change_type TEXT    NOT NULL CHECK (change_type IN ('ADD', 'MODIFY', 'DELETE')),
            path        TEXT    NOT NULL,
            old_path    TEXT,
            FOREIGN KEY (repo_id, changelist) REFERENCES changelists (repo_id, number)
        );

        CREATE INDEX IF NOT EXISTS idx_file_changes_changelist
            ON file_changes (repo_id, changelist);

        CREATE TABLE IF NOT EXISTS checkouts (
            repo_id       TEXT NOT NULL,
            workspace_id  TEXT NOT NULL,
            file_id       TEXT NOT NULL REFERENCES files (id),
            user_id       TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            PRIMARY KEY (repo_id, workspace_id, file_id)
        );
        "#,
    ),
    (
        2,
        "file history lookup",
        r#"
        CREATE INDEX IF NOT EXISTS idx_file_changes_file_id ON file_changes (file_id);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in ["repos", "branches", "changelists", "files", "file_changes", "checkouts"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_changelist_numbers_unique_per_repo() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO repos VALUES ('r1', 'repo', '2025-01-01T00:00:00Z');
             INSERT INTO changelists VALUES ('r1', 0, '', NULL, '', '{}', 'u', '2025-01-01T00:00:00Z');",
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO changelists VALUES ('r1', 0, 'again', NULL, 'v', '{}', 'u', '2025-01-01T00:00:00Z')",
            [],
        );
        assert!(dup.is_err());
    }
}
