//! SQLite-backed history service.
//!
//! [`Database`] stores repositories, branches, changelists, file records,
//! file changes and checkouts, and implements
//! [`crate::history::HistoryStore`] on top of them. Submits go through
//! [`Database::commit_plan`], a single transaction guarded by a
//! compare-and-set on the branch head.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// History database handle. One connection behind a `Mutex`, shared
/// through `Arc` by every component of an engine.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the history database at `path` in WAL mode.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let db = Self::configure(conn)?;
        info!(path = %path.display(), "opened history database");
        Ok(db)
    }

    /// Private in-memory database, used by tests and tooling.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        Self::configure(Connection::open_in_memory()?)
    }

    fn configure(conn: Connection) -> Result<Self, DatabaseError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bring the schema up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!(version = schema::get_schema_version(&conn)?, "history schema ready");
        Ok(())
    }

    /// Applied migration version (0 for an uninitialized database).
    pub fn schema_version(&self) -> Result<u32, DatabaseError> {
        schema::get_schema_version(&self.conn())
    }

    /// Lock the connection, recovering it if a previous holder panicked.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("history database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction; committed on `Ok`, rolled back on `Err`.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
