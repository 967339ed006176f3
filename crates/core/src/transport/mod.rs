//! Content transport: the block/version store the sync engine fetches
//! snapshots from and uploads new versions to.
//!
//! A snapshot fetch is a long-running operation behind an opaque handle:
//! start it, poll until it reports completion, then release the handle.
//! [`FetchTask`] wraps that protocol so the handle is released exactly once
//! on success, failure and cancellation.

pub mod fetch;
pub mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;

pub use fetch::FetchTask;
pub use local::LocalBlockStore;

/// Opaque identifier of an in-flight fetch.
pub type TransportHandle = u64;

/// Access credentials attached to every transport request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Credentials valid for `expiry_secs` from now.
    pub fn new(token: Option<String>, expiry_secs: u64) -> Self {
        Self {
            token,
            expires_at: Utc::now() + Duration::seconds(expiry_secs as i64),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Apply (part of) a version snapshot to a local directory.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Namespace in the store, normally the repository id.
    pub remote_base: String,
    pub version_index: String,
    pub local_root: PathBuf,
    pub credentials: Credentials,
    /// Restrict the fetch to these paths; `None` applies the whole snapshot.
    pub paths: Option<Vec<String>>,
}

/// Progress report of a fetch. `error` is non-zero on failure, in which
/// case `completed` is also set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    pub current_step: String,
    pub completed: bool,
    pub error: i32,
}

/// Create a new version from a base version plus local files.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub remote_base: String,
    /// Version the new snapshot starts from; empty for an empty base.
    pub base_version: String,
    pub local_root: PathBuf,
    /// Workspace-relative paths whose current content is uploaded.
    pub upload: Vec<String>,
    /// Paths dropped from the snapshot.
    pub remove: Vec<String>,
    pub credentials: Credentials,
}

#[async_trait]
pub trait ContentTransport: Send + Sync {
    async fn start_fetch(&self, request: FetchRequest) -> Result<TransportHandle, TransportError>;

    async fn poll(&self, handle: TransportHandle) -> Result<FetchProgress, TransportError>;

    /// Free the resources behind `handle`. Must be called exactly once per
    /// handle returned by [`ContentTransport::start_fetch`].
    fn release(&self, handle: TransportHandle);

    /// Read one file of a version.
    async fn fetch_file(
        &self,
        remote_base: &str,
        version_index: &str,
        path: &str,
    ) -> Result<Vec<u8>, TransportError>;

    /// Upload a new version and return its index.
    async fn store_version(&self, request: StoreRequest) -> Result<String, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_expiry() {
        assert!(!Credentials::new(None, 60).is_expired());
        assert!(Credentials::new(Some("t".into()), 0).is_expired());
    }
}
