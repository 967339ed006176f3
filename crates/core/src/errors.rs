//! Error types for the Checkpoint core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::models::ChangelistNumber;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// History service errors
// ---------------------------------------------------------------------------

/// Errors from the history/metadata service.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// A branch, changelist, repository or file record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Write access was denied at the repository layer.
    #[error("permission denied: {0}")]
    Permission(String),

    /// A concurrent writer got there first (unique or primary-key violation,
    /// or the branch head moved since it was read).
    #[error("concurrent write conflict: {0}")]
    WriteConflict(String),

    /// Underlying persistence failure.
    #[error("history database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for HistoryError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            DatabaseError::Conflict(detail) => Self::WriteConflict(detail),
            DatabaseError::SqliteError(rusqlite::Error::SqliteFailure(code, detail))
                if is_key_collision(code.extended_code) =>
            {
                Self::WriteConflict(detail.unwrap_or_else(|| "constraint violation".into()))
            }
            other => Self::Database(other),
        }
    }
}

/// Only key collisions mean another writer won. CHECK, NOT NULL and
/// foreign-key violations are bugs and must not be retried.
fn is_key_collision(extended_code: std::os::raw::c_int) -> bool {
    extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        || extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
}

impl HistoryError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// `true` only for failures caused by a concurrent submitter.
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A guarded write lost to a concurrent writer (e.g. the branch head
    /// moved between read and compare-and-set).
    #[error("concurrent write conflict: {0}")]
    Conflict(String),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A stored JSON column could not be decoded.
    #[error("corrupt {column} column: {detail}")]
    CorruptColumn { column: String, detail: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Content transport errors
// ---------------------------------------------------------------------------

/// Errors from the content transport (block/version store).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport reported a non-zero error code while applying a snapshot.
    #[error("content transport failed during '{step}' (code {code})")]
    Failed { step: String, code: i32 },

    /// The handle was never issued or was already released.
    #[error("unknown transport handle {0}")]
    UnknownHandle(u64),

    /// No version with this index exists in the store.
    #[error("version '{0}' not found in content store")]
    VersionNotFound(String),

    /// The version exists but does not contain the requested path.
    #[error("'{path}' is not part of version '{version}'")]
    PathNotInVersion { version: String, path: String },

    /// Generic I/O wrapper.
    #[error("content transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization failure.
    #[error("content transport manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Workspace errors
// ---------------------------------------------------------------------------

/// Errors from local workspace persistence and locking.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Another pull/submit/resolve holds the workspace lock.
    #[error("workspace is locked by another operation ({path}, held by {holder})")]
    Locked { path: String, holder: String },

    /// The directory has no `.checkpoint` metadata.
    #[error("not a checkpoint workspace: {0}")]
    NotInitialized(String),

    /// A path escapes the workspace root or is otherwise unusable.
    #[error("invalid workspace path '{0}'")]
    InvalidPath(String),

    /// Generic I/O wrapper.
    #[error("workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure while writing workspace records.
    #[error("workspace serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// A single hard conflict reported before a pull is allowed to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub path: String,
    pub local_changelist: Option<ChangelistNumber>,
    pub remote_changelist: Option<ChangelistNumber>,
    pub reason: String,
}

impl std::fmt::Display for ConflictEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let local = self
            .local_changelist
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".into());
        let remote = self
            .remote_changelist
            .map(|n| n.to_string())
            .unwrap_or_else(|| "deleted".into());
        write!(
            f,
            "{} (local CL {}, remote CL {}: {})",
            self.path, local, remote, self.reason
        )
    }
}

fn join_conflicts(conflicts: &[ConflictEntry]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from sync-status checks, pulls, merges and conflict resolution.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Hard conflicts (binary divergence or remote deletion of a local edit).
    #[error("conflicts must be resolved first: {}", join_conflicts(.0))]
    Conflicts(Vec<ConflictEntry>),

    /// The remote head moved since the cached sync status was taken.
    #[error("branch head moved from {cached} to {current}; re-check sync status for: {}", .paths.join(", "))]
    StaleStatus {
        cached: ChangelistNumber,
        current: ChangelistNumber,
        paths: Vec<String>,
    },

    /// Content transport failed; the pull was aborted without persisting.
    #[error("pull aborted: content transport failed during '{last_step}' (code {code})")]
    Transport { last_step: String, code: i32 },

    /// The named path is not tracked by the workspace.
    #[error("path is not tracked by this workspace: {0}")]
    NotTracked(String),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Content transport failure outside a snapshot fetch.
    #[error("content transport error: {0}")]
    ContentTransport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// Submit errors
// ---------------------------------------------------------------------------

/// Errors from the submit/commit allocator.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The modification list is unusable as given; never retried.
    #[error("invalid submit: {0}")]
    Validation(String),

    /// Every attempt lost a race with a concurrent submitter.
    #[error("submit failed after {attempts} attempts ({last_reason}); try again")]
    RetriesExhausted { attempts: u32, last_reason: String },

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
