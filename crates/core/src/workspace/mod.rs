//! Local workspace: the on-disk checkout plus its `.checkpoint` metadata
//! directory (state record, staged record, config and lock file).

pub mod lock;
pub mod staged;
pub mod state;

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::errors::WorkspaceError;

pub use lock::WorkspaceLock;
pub use staged::StagedChanges;
pub use state::{WorkspaceState, WorkspaceStateFile};

/// Name of the metadata directory at the workspace root.
pub const META_DIR: &str = ".checkpoint";

const STATE_FILE: &str = "state.json";
const STAGED_FILE: &str = "staged.json";
const LOCK_FILE: &str = "lock";
const CONFIG_FILE: &str = "config.toml";

/// Handle to a workspace directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open an existing workspace. Fails if `root` has no metadata directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        if !root.join(META_DIR).is_dir() {
            return Err(WorkspaceError::NotInitialized(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// Create the metadata directory (if needed) and open the workspace.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(root.join(META_DIR))?;
        info!(root = %root.display(), "initialized workspace");
        Ok(Self { root })
    }

    /// Walk up from `start` until a directory containing `.checkpoint` is
    /// found.
    pub fn discover(start: &Path) -> Result<Self, WorkspaceError> {
        let mut dir = Some(start);
        while let Some(d) = dir {
            if d.join(META_DIR).is_dir() {
                return Ok(Self {
                    root: d.to_path_buf(),
                });
            }
            dir = d.parent();
        }
        Err(WorkspaceError::NotInitialized(start.display().to_string()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.meta_dir().join(STATE_FILE)
    }

    pub fn staged_path(&self) -> PathBuf {
        self.meta_dir().join(STAGED_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.meta_dir().join(LOCK_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.meta_dir().join(CONFIG_FILE)
    }

    /// Absolute path for a workspace-relative path.
    pub fn abs_path(&self, rel: &str) -> Result<PathBuf, WorkspaceError> {
        let rel = normalize_rel_path(rel)?;
        Ok(self.root.join(rel))
    }

    /// Acquire the exclusive workspace lock for a pull, submit or resolve.
    pub fn lock(&self) -> Result<WorkspaceLock, WorkspaceError> {
        WorkspaceLock::acquire(&self.lock_path())
    }

    pub fn load_state(&self) -> WorkspaceState {
        WorkspaceState::load(&self.state_path())
    }

    pub fn save_state(&self, state: &WorkspaceState) -> Result<(), WorkspaceError> {
        state.save(&self.state_path())
    }

    pub fn load_staged(&self) -> StagedChanges {
        StagedChanges::load(&self.staged_path())
    }

    pub fn save_staged(&self, staged: &StagedChanges) -> Result<(), WorkspaceError> {
        staged.save(&self.staged_path())
    }
}

/// Normalise a workspace-relative path to forward slashes with no `.`
/// segments. Absolute paths, `..` segments and the metadata directory are
/// rejected.
pub fn normalize_rel_path(rel: &str) -> Result<String, WorkspaceError> {
    let mut parts = Vec::new();
    for component in Path::new(&rel.replace('\\', "/")).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s.to_string()),
                None => return Err(WorkspaceError::InvalidPath(rel.to_string())),
            },
            Component::CurDir => {}
            _ => return Err(WorkspaceError::InvalidPath(rel.to_string())),
        }
    }
    if parts.is_empty() || parts[0] == META_DIR {
        return Err(WorkspaceError::InvalidPath(rel.to_string()));
    }
    Ok(parts.join("/"))
}

/// Write `data` to `path` via a temp file in the same directory followed by
/// a rename, so readers never observe a half-written file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), WorkspaceError> {
    let parent = path
        .parent()
        .ok_or_else(|| WorkspaceError::InvalidPath(path.display().to_string()))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| WorkspaceError::Io(e.error))?;
    Ok(())
}

/// SHA-256 of `data`, hex encoded.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    Ok(hash_bytes(&fs::read(path)?))
}
