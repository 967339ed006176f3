//! Filesystem-backed content store.
//!
//! Layout under the store root:
//!
//! ```text
//! objects/<2 hex>/<62 hex>          content-addressed blobs (SHA-256)
//! versions/<remote_base>/<index>.json   one manifest per version
//! ```
//!
//! A manifest maps every path of the snapshot to its blob, so each version
//! index names a full snapshot. New versions are built from a base
//! manifest plus uploaded files minus removed paths. Version indexes are
//! the SHA-256 of the manifest.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{ContentTransport, Credentials, FetchProgress, FetchRequest, StoreRequest, TransportHandle};
use crate::errors::TransportError;

pub const ERR_AUTH: i32 = 3;
pub const ERR_MANIFEST: i32 = 4;
pub const ERR_WRITE: i32 = 5;
pub const ERR_BLOB: i32 = 6;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    files: BTreeMap<String, BlobRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BlobRef {
    hash: String,
    size: u64,
}

type ProgressMap = HashMap<TransportHandle, Arc<Mutex<FetchProgress>>>;

pub struct LocalBlockStore {
    root: PathBuf,
    token: Option<String>,
    next_handle: AtomicU64,
    fetches: Mutex<ProgressMap>,
}

impl LocalBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            token: None,
            next_handle: AtomicU64::new(1),
            fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Require every request to carry this token.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of fetch handles not yet released.
    pub fn open_handles(&self) -> usize {
        self.lock_fetches().len()
    }

    fn lock_fetches(&self) -> std::sync::MutexGuard<'_, ProgressMap> {
        self.fetches.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn authorize(&self, credentials: &Credentials) -> Result<(), String> {
        if credentials.is_expired() {
            return Err("credentials expired".into());
        }
        match &self.token {
            Some(required) if credentials.token.as_ref() != Some(required) => {
                Err("invalid store token".into())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Blob & manifest helpers
// ---------------------------------------------------------------------------

fn blob_path(root: &Path, hash: &str) -> PathBuf {
    root.join("objects").join(&hash[..2]).join(&hash[2..])
}

fn manifest_path(root: &Path, remote_base: &str, version: &str) -> PathBuf {
    root.join("versions")
        .join(remote_base)
        .join(format!("{version}.json"))
}

fn read_manifest(root: &Path, remote_base: &str, version: &str) -> Result<Manifest, TransportError> {
    if version.is_empty() {
        return Ok(Manifest::default());
    }
    let path = manifest_path(root, remote_base, version);
    match fs::read(&path) {
        Ok(raw) => Ok(serde_json::from_slice(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(TransportError::VersionNotFound(version.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn put_blob(root: &Path, data: &[u8]) -> std::io::Result<BlobRef> {
    let hash = hex::encode(Sha256::digest(data));
    let path = blob_path(root, &hash);
    if !path.exists() {
        write_file_atomic(&path, data)?;
    }
    Ok(BlobRef {
        hash,
        size: data.len() as u64,
    })
}

/// Body of a fetch job; runs on the blocking pool and reports through
/// `progress`.
fn run_fetch(root: &Path, request: &FetchRequest, progress: &Mutex<FetchProgress>) {
    let set_step = |step: &str| {
        if let Ok(mut p) = progress.lock() {
            p.current_step = step.to_string();
        }
    };
    let fail = |code: i32, detail: String| {
        warn!(version = %request.version_index, code, detail = %detail, "fetch failed");
        if let Ok(mut p) = progress.lock() {
            p.error = code;
            p.completed = true;
        }
    };

    set_step("reading_manifest");
    let manifest = match read_manifest(root, &request.remote_base, &request.version_index) {
        Ok(m) => m,
        Err(e) => return fail(ERR_MANIFEST, e.to_string()),
    };

    set_step("writing_files");
    let selected: Vec<(&String, &BlobRef)> = match &request.paths {
        None => manifest.files.iter().collect(),
        Some(paths) => paths
            .iter()
            .filter_map(|p| manifest.files.get_key_value(p))
            .collect(),
    };
    for (path, blob) in selected {
        let data = match fs::read(blob_path(root, &blob.hash)) {
            Ok(d) => d,
            Err(e) => return fail(ERR_BLOB, format!("{path}: {e}")),
        };
        if let Err(e) = write_file_atomic(&request.local_root.join(path), &data) {
            return fail(ERR_WRITE, format!("{path}: {e}"));
        }
    }

    if let Ok(mut p) = progress.lock() {
        p.current_step = "done".into();
        p.completed = true;
    }
}

// ---------------------------------------------------------------------------
// ContentTransport
// ---------------------------------------------------------------------------

#[async_trait]
impl ContentTransport for LocalBlockStore {
    async fn start_fetch(&self, request: FetchRequest) -> Result<TransportHandle, TransportError> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let progress = Arc::new(Mutex::new(FetchProgress {
            current_step: "queued".into(),
            completed: false,
            error: 0,
        }));
        self.lock_fetches().insert(handle, Arc::clone(&progress));

        if let Err(detail) = self.authorize(&request.credentials) {
            warn!(handle, detail = %detail, "fetch rejected");
            if let Ok(mut p) = progress.lock() {
                p.current_step = "authorizing".into();
                p.error = ERR_AUTH;
                p.completed = true;
            }
            return Ok(handle);
        }

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || run_fetch(&root, &request, &progress));
        Ok(handle)
    }

    async fn poll(&self, handle: TransportHandle) -> Result<FetchProgress, TransportError> {
        let progress = self
            .lock_fetches()
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownHandle(handle))?;
        let snapshot = progress
            .lock()
            .map(|p| (*p).clone())
            .unwrap_or_else(|p| (*p.into_inner()).clone());
        Ok(snapshot)
    }

    fn release(&self, handle: TransportHandle) {
        if self.lock_fetches().remove(&handle).is_none() {
            warn!(handle, "release of unknown fetch handle");
        }
    }

    async fn fetch_file(
        &self,
        remote_base: &str,
        version_index: &str,
        path: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let manifest = read_manifest(&self.root, remote_base, version_index)?;
        let blob = manifest
            .files
            .get(path)
            .ok_or_else(|| TransportError::PathNotInVersion {
                version: version_index.to_string(),
                path: path.to_string(),
            })?;
        Ok(fs::read(blob_path(&self.root, &blob.hash))?)
    }

    async fn store_version(&self, request: StoreRequest) -> Result<String, TransportError> {
        if let Err(detail) = self.authorize(&request.credentials) {
            warn!(detail = %detail, "upload rejected");
            return Err(TransportError::Failed {
                step: "authorizing".into(),
                code: ERR_AUTH,
            });
        }

        let mut manifest = read_manifest(&self.root, &request.remote_base, &request.base_version)?;
        for path in &request.remove {
            manifest.files.remove(path);
        }
        for path in &request.upload {
            let data = fs::read(request.local_root.join(path))?;
            let blob = put_blob(&self.root, &data)?;
            manifest.files.insert(path.clone(), blob);
        }

        let raw = serde_json::to_vec(&manifest)?;
        let index = hex::encode(Sha256::digest(&raw));
        let path = manifest_path(&self.root, &request.remote_base, &index);
        if !path.exists() {
            write_file_atomic(&path, &raw)?;
        }
        info!(
            remote_base = %request.remote_base,
            version = %index,
            files = manifest.files.len(),
            uploaded = request.upload.len(),
            removed = request.remove.len(),
            "stored version"
        );
        debug!(base = %request.base_version, "version base");
        Ok(index)
    }
}
