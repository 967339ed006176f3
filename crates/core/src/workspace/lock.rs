//! Exclusive per-workspace lock file.
//!
//! Pull, submit and conflict resolution all read-modify-write the workspace
//! state and staged records, so only one of them may run at a time in a
//! given workspace. The lock file is created with `create_new` and holds
//! the owner's PID; it is removed when the guard drops, including on error
//! and panic unwinding.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::WorkspaceError;

#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Create the lock file, refusing if it already exists.
    pub fn acquire(path: &Path) -> Result<Self, WorkspaceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => {
                let lock = Self {
                    path: path.to_path_buf(),
                };
                lock.stamp(file)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                let holder = if holder.is_empty() {
                    "unknown".to_string()
                } else {
                    format!("pid {holder}")
                };
                Err(WorkspaceError::Locked {
                    path: path.display().to_string(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the owner's PID. On failure `self` drops and the half-written
    /// lock file is removed.
    fn stamp(self, mut out: impl Write) -> Result<Self, WorkspaceError> {
        let pid = std::process::id();
        out.write_all(pid.to_string().as_bytes())?;
        out.flush()?;
        debug!(pid, path = %self.path.display(), "acquired workspace lock");
        Ok(self)
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove workspace lock");
        }
    }
}
