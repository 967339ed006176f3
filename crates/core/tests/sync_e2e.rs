//! End-to-end tests for workspace sync: status checks, pull with
//! auto-merge, pull atomicity and conflict resolution.
//!
//! These tests drive the real components:
//! - in-memory SQLite history (`Database`)
//! - `LocalBlockStore` over a temp directory
//! - real workspaces on disk
//!
//! Remote changes are produced by submitting from a separate author
//! directory, the same way a second user would.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use checkpoint_core::conflict::{ConflictResolver, Resolution, SyncChecker};
use checkpoint_core::db::Database;
use checkpoint_core::errors::{SyncError, TransportError};
use checkpoint_core::history::HistoryStore;
use checkpoint_core::models::{Changelist, ConflictKind, FileChangeType, Modification};
use checkpoint_core::pull::{MergeOutcome, PullExecutor};
use checkpoint_core::submit::{SubmitAllocator, SubmitRequest};
use checkpoint_core::transport::{
    ContentTransport, Credentials, FetchProgress, FetchRequest, LocalBlockStore, StoreRequest,
    TransportHandle,
};
use checkpoint_core::workspace::Workspace;

const REPO: &str = "repo";
const BRANCH: &str = "main";

// ===========================================================================
// Helpers
// ===========================================================================

struct Harness {
    db: Arc<Database>,
    store: Arc<LocalBlockStore>,
    author: TempDir,
    _store_dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.create_repo(REPO, "Repo", BRANCH, "alice").unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        Self {
            db: Arc::new(db),
            store: Arc::new(LocalBlockStore::new(store_dir.path())),
            author: tempfile::tempdir().unwrap(),
            _store_dir: store_dir,
        }
    }

    fn history(&self) -> Arc<dyn HistoryStore> {
        self.db.clone()
    }

    fn submitter(&self) -> SubmitAllocator {
        SubmitAllocator::new(
            self.history(),
            self.store.clone(),
            REPO,
            "ws-author",
            "alice",
            Credentials::new(None, 3600),
        )
    }

    fn puller_with(&self, transport: Arc<dyn ContentTransport>) -> PullExecutor {
        PullExecutor::new(self.history(), transport, REPO, BRANCH, Credentials::new(None, 3600))
            .with_poll_interval(Duration::from_millis(5))
    }

    fn puller(&self) -> PullExecutor {
        self.puller_with(self.store.clone())
    }

    fn checker(&self) -> SyncChecker {
        SyncChecker::new(self.history(), REPO, BRANCH)
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.history(), self.store.clone(), REPO, BRANCH)
    }

    /// Write `files` into the author directory and submit them.
    async fn author_writes(&self, files: &[(&str, &[u8])], message: &str) -> Changelist {
        let mut modifications = Vec::new();
        for (path, content) in files {
            let abs = self.author.path().join(path);
            if let Some(parent) = abs.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(abs, content).unwrap();
            modifications.push(Modification::upsert(*path));
        }
        self.author_submits(modifications, message).await
    }

    async fn author_submits(&self, modifications: Vec<Modification>, message: &str) -> Changelist {
        let request = SubmitRequest {
            branch: BRANCH.into(),
            message: message.into(),
            modifications,
            keep_checked_out: false,
        };
        self.submitter()
            .submit(self.author.path(), &request)
            .await
            .unwrap()
            .changelist
    }

    /// A fresh workspace pulled to the current head.
    async fn workspace(&self) -> (TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::init(dir.path()).unwrap();
        self.puller().pull(&ws, None).await.unwrap();
        (dir, ws)
    }
}

fn read(root: &Path, path: &str) -> String {
    fs::read_to_string(root.join(path)).unwrap()
}

const BASE: &str = "line1\nline2\nline3\nline4\nline5\n";

// ===========================================================================
// Sync status & pull
// ===========================================================================

#[tokio::test]
async fn test_outdated_text_file_is_merged_on_pull() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", b"draft 1\n")], "cl1").await;
    for n in 2..=4 {
        h.author_writes(&[("a.txt", format!("draft {n}\n").as_bytes())], "draft").await;
    }
    let cl5 = h.author_writes(&[("a.txt", BASE.as_bytes())], "cl5").await;
    assert_eq!(cl5.number, 5);

    let (_dir, ws) = h.workspace().await;
    let root = ws.root();
    let state = ws.load_state();
    assert_eq!(state.changelist_number, 5);
    let f1 = state.get("a.txt").unwrap().file_id.clone();
    assert_eq!(state.get("a.txt").unwrap().changelist, 5);

    // Remote edits line 1 and adds b.txt; the user edits line 5.
    let remote = BASE.replace("line1", "line1 remote");
    h.author_writes(&[("a.txt", remote.as_bytes())], "cl6").await;
    h.author_writes(&[("b.txt", b"new file\n")], "cl7").await;
    fs::write(root.join("a.txt"), BASE.replace("line5", "line5 local")).unwrap();

    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();
    assert!(!status.up_to_date);
    assert_eq!(status.remote_head, 7);
    assert_eq!(status.outdated_files.len(), 1);
    assert_eq!(status.outdated_files[0].file_id, f1);
    assert_eq!(status.outdated_files[0].local_changelist, 5);
    assert_eq!(status.outdated_files[0].remote_changelist, 6);
    assert_eq!(status.new_on_remote.len(), 1);
    assert_eq!(status.new_on_remote[0].path, "b.txt");
    assert!(status.deleted_on_remote.is_empty());

    let check = h
        .checker()
        .check_conflicts(root, &ws.load_state(), &["a.txt".to_string()])
        .await
        .unwrap();
    assert!(!check.has_conflicts);
    assert_eq!(check.mergeable, vec!["a.txt".to_string()]);

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert_eq!(outcome.from_changelist, 5);
    assert_eq!(outcome.to_changelist, 7);
    assert_eq!(outcome.fetched_changelists, vec![6, 7]);
    assert_eq!(outcome.merges.len(), 1);
    assert_eq!(outcome.merges[0].outcome, MergeOutcome::Clean);

    let merged = read(root, "a.txt");
    assert!(merged.contains("line1 remote"));
    assert!(merged.contains("line5 local"));
    assert_eq!(read(root, "b.txt"), "new file\n");

    let state = ws.load_state();
    let head = h.db.get_changelist(REPO, 7).await.unwrap();
    assert_eq!(state.changelist_number, 7);
    assert_eq!(state.local_tree(), head.state_tree);
    assert_eq!(state.get("b.txt").unwrap().changelist, 7);
    // The merged local edit stays pending for the next submit.
    assert!(ws.load_staged().get("a.txt").is_some());

    let status = h.checker().check_sync_status(&state).await.unwrap();
    assert!(status.up_to_date);
}

#[tokio::test]
async fn test_overlapping_edits_leave_conflict_markers() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes())], "base").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(&[("a.txt", BASE.replace("line3", "remote three").as_bytes())], "remote").await;
    fs::write(ws.root().join("a.txt"), BASE.replace("line3", "local three")).unwrap();

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert_eq!(outcome.conflicted_paths(), vec!["a.txt"]);
    match &outcome.merges[0].outcome {
        MergeOutcome::Conflicted { markers } => assert!(!markers.is_empty()),
        other => panic!("expected conflict markers, got {other:?}"),
    }
    let text = read(ws.root(), "a.txt");
    assert!(text.contains("<<<<<<<"));
    assert!(text.contains("remote three"));
    assert!(text.contains("local three"));
    // The pull itself still advanced.
    assert_eq!(ws.load_state().changelist_number, 2);
}

#[tokio::test]
async fn test_pull_records_state_before_staging_merges() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes())], "cl1").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(&[("a.txt", BASE.replace("line1", "remote").as_bytes())], "cl2").await;
    fs::write(ws.root().join("a.txt"), BASE.replace("line5", "local")).unwrap();
    // An unwritable staged record.
    fs::create_dir_all(ws.staged_path().join("blocker")).unwrap();

    let err = h.puller().pull(&ws, None).await.unwrap_err();
    assert!(matches!(err, SyncError::Workspace(_)), "{err}");

    let state = ws.load_state();
    assert_eq!(state.changelist_number, 2);
    assert_eq!(state.get("a.txt").unwrap().changelist, 2);
    let text = read(ws.root(), "a.txt");
    assert!(text.contains("remote") && text.contains("local"));
}

#[tokio::test]
async fn test_pull_applies_deletions_and_renames() {
    let h = Harness::new();
    h.author_writes(&[("x.txt", b"x\n"), ("y.txt", b"y\n")], "add").await;
    let (_dir, ws) = h.workspace().await;
    let x_id = ws.load_state().get("x.txt").unwrap().file_id.clone();

    fs::create_dir_all(h.author.path().join("docs")).unwrap();
    fs::rename(h.author.path().join("x.txt"), h.author.path().join("docs/z.txt")).unwrap();
    fs::remove_file(h.author.path().join("y.txt")).unwrap();
    h.author_submits(
        vec![Modification::rename("x.txt", "docs/z.txt"), Modification::delete("y.txt")],
        "move and delete",
    )
    .await;

    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();
    assert_eq!(status.deleted_on_remote.len(), 1);
    assert_eq!(status.deleted_on_remote[0].path, "y.txt");

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert_eq!(outcome.deleted_paths, vec!["y.txt".to_string()]);
    let root = ws.root();
    assert!(!root.join("x.txt").exists());
    assert!(!root.join("y.txt").exists());
    assert_eq!(read(root, "docs/z.txt"), "x\n");

    let state = ws.load_state();
    assert_eq!(state.files.len(), 1);
    assert_eq!(state.get("docs/z.txt").unwrap().file_id, x_id);

    let changes = h.db.list_file_changes(REPO, 2).unwrap();
    let rename = changes.iter().find(|c| c.file_id == x_id).unwrap();
    assert_eq!(rename.change_type, FileChangeType::Modify);
    assert_eq!(rename.old_path.as_deref(), Some("x.txt"));
    assert!(changes.iter().any(|c| c.change_type == FileChangeType::Delete && c.path == "y.txt"));
}

#[tokio::test]
async fn test_pull_keeps_path_re_added_after_delete() {
    let h = Harness::new();
    h.author_writes(&[("p.txt", b"first\n"), ("keep.txt", b"k\n")], "cl1").await;
    let (_dir, ws) = h.workspace().await;
    let old_id = ws.load_state().get("p.txt").unwrap().file_id.clone();

    fs::remove_file(h.author.path().join("p.txt")).unwrap();
    h.author_submits(vec![Modification::delete("p.txt")], "cl2").await;
    let cl3 = h.author_writes(&[("p.txt", b"second\n")], "cl3").await;

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert!(outcome.deleted_paths.is_empty(), "{:?}", outcome.deleted_paths);
    assert_eq!(read(ws.root(), "p.txt"), "second\n");

    let state = ws.load_state();
    let entry = state.get("p.txt").unwrap();
    assert_ne!(entry.file_id, old_id);
    assert_eq!(entry.changelist, 3);
    assert_eq!(state.local_tree(), cl3.state_tree);
    assert!(state.modified_paths(ws.root()).is_empty());
}

#[tokio::test]
async fn test_pull_rename_into_vacated_path() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", b"from a\n"), ("b.txt", b"from b\n")], "cl1").await;
    let (_dir, ws) = h.workspace().await;
    let state = ws.load_state();
    let a_id = state.get("a.txt").unwrap().file_id.clone();
    let b_id = state.get("b.txt").unwrap().file_id.clone();

    let author = h.author.path();
    fs::rename(author.join("a.txt"), author.join("c.txt")).unwrap();
    h.author_submits(vec![Modification::rename("a.txt", "c.txt")], "a to c").await;
    fs::rename(author.join("b.txt"), author.join("a.txt")).unwrap();
    let cl3 = h
        .author_submits(vec![Modification::rename("b.txt", "a.txt")], "b to a")
        .await;

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert!(outcome.deleted_paths.is_empty());
    let root = ws.root();
    assert_eq!(read(root, "a.txt"), "from b\n");
    assert_eq!(read(root, "c.txt"), "from a\n");
    assert!(!root.join("b.txt").exists());

    let state = ws.load_state();
    let paths: Vec<&str> = state.files.keys().map(String::as_str).collect();
    assert_eq!(paths, vec!["a.txt", "c.txt"]);
    assert_eq!(state.get("a.txt").unwrap().file_id, b_id);
    assert_eq!(state.get("c.txt").unwrap().file_id, a_id);
    assert_eq!(state.local_tree(), cl3.state_tree);
}

#[tokio::test]
async fn test_pull_to_explicit_changelist() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", b"one\n")], "cl1").await;
    h.author_writes(&[("a.txt", b"two\n")], "cl2").await;
    h.author_writes(&[("a.txt", b"three\n")], "cl3").await;

    let dir = tempfile::tempdir().unwrap();
    let ws = Workspace::init(dir.path()).unwrap();
    let outcome = h.puller().pull(&ws, Some(2)).await.unwrap();
    assert_eq!(outcome.to_changelist, 2);
    assert_eq!(read(ws.root(), "a.txt"), "two\n");

    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();
    assert_eq!(status.outdated_files[0].remote_changelist, 3);
}

// ===========================================================================
// Pull atomicity
// ===========================================================================

/// Delegates to a real store but makes the N-th snapshot fetch fail, and
/// single-file fetches of `missing_file` fail.
struct FailingTransport {
    inner: Arc<LocalBlockStore>,
    fail_on: usize,
    missing_file: Option<&'static str>,
    fetches: AtomicUsize,
    failing: Mutex<HashSet<TransportHandle>>,
}

impl FailingTransport {
    fn new(inner: Arc<LocalBlockStore>, fail_on: usize, missing_file: Option<&'static str>) -> Self {
        Self {
            inner,
            fail_on,
            missing_file,
            fetches: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ContentTransport for FailingTransport {
    async fn start_fetch(&self, request: FetchRequest) -> Result<TransportHandle, TransportError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = self.inner.start_fetch(request).await?;
        if n == self.fail_on {
            self.failing.lock().unwrap().insert(handle);
        }
        Ok(handle)
    }

    async fn poll(&self, handle: TransportHandle) -> Result<FetchProgress, TransportError> {
        if self.failing.lock().unwrap().contains(&handle) {
            return Ok(FetchProgress {
                current_step: "writing_files".into(),
                completed: true,
                error: 7,
            });
        }
        self.inner.poll(handle).await
    }

    fn release(&self, handle: TransportHandle) {
        self.inner.release(handle);
    }

    async fn fetch_file(
        &self,
        remote_base: &str,
        version_index: &str,
        path: &str,
    ) -> Result<Vec<u8>, TransportError> {
        if self.missing_file == Some(path) {
            return Err(TransportError::PathNotInVersion {
                version: version_index.to_string(),
                path: path.to_string(),
            });
        }
        self.inner.fetch_file(remote_base, version_index, path).await
    }

    async fn store_version(&self, request: StoreRequest) -> Result<String, TransportError> {
        self.inner.store_version(request).await
    }
}

#[tokio::test]
async fn test_failed_fetch_leaves_state_untouched() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes())], "cl1").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(&[("a.txt", BASE.replace("line1", "remote").as_bytes())], "cl2").await;
    h.author_writes(&[("b.txt", b"b\n")], "cl3").await;
    h.author_writes(&[("c.txt", b"c\n")], "cl4").await;

    let local = BASE.replace("line5", "local");
    fs::write(ws.root().join("a.txt"), &local).unwrap();
    let before = fs::read(ws.state_path()).unwrap();

    let transport = Arc::new(FailingTransport::new(h.store.clone(), 2, None));
    let err = h.puller_with(transport.clone()).pull(&ws, None).await.unwrap_err();
    match err {
        SyncError::Transport { last_step, code } => {
            assert_eq!(code, 7);
            assert!(last_step.contains("fetched CL 2"), "{last_step}");
            assert!(last_step.contains("writing_files"), "{last_step}");
        }
        other => panic!("expected transport failure, got {other}"),
    }

    assert_eq!(fs::read(ws.state_path()).unwrap(), before);
    // Captured local edits are written back.
    assert_eq!(read(ws.root(), "a.txt"), local);
    assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.open_handles(), 0);
    assert!(ws.lock().is_ok());

    // A retry with a healthy transport completes normally.
    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert_eq!(outcome.to_changelist, 4);
    assert_eq!(outcome.merges[0].outcome, MergeOutcome::Clean);
}

#[tokio::test]
async fn test_merge_paths_fetch_failure_writes_nothing() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes()), ("b.txt", b"b\n")], "cl1").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(
        &[("a.txt", BASE.replace("line1", "remote").as_bytes()), ("b.txt", b"b2\n")],
        "cl2",
    )
    .await;
    let local = BASE.replace("line5", "local");
    fs::write(ws.root().join("a.txt"), &local).unwrap();
    let before = fs::read(ws.state_path()).unwrap();

    let transport = Arc::new(FailingTransport::new(h.store.clone(), 0, Some("b.txt")));
    let err = h
        .puller_with(transport)
        .merge_paths(&ws, &["a.txt".to_string(), "b.txt".to_string()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("b.txt"), "{err}");

    assert_eq!(read(ws.root(), "a.txt"), local);
    assert_eq!(read(ws.root(), "b.txt"), "b\n");
    assert_eq!(fs::read(ws.state_path()).unwrap(), before);
    assert!(ws.load_staged().is_empty());
    assert!(ws.lock().is_ok());
}

// ===========================================================================
// Conflicts & resolution
// ===========================================================================

const PNG_V1: &[u8] = &[0x89, b'P', b'N', b'G', 0, 1, 2, 3];
const PNG_V2: &[u8] = &[0x89, b'P', b'N', b'G', 0, 9, 9, 9];
const PNG_LOCAL: &[u8] = &[0x89, b'P', b'N', b'G', 0, 5, 5, 5];

async fn diverged() -> (Harness, TempDir, Workspace) {
    let h = Harness::new();
    h.author_writes(
        &[("logo.png", PNG_V1), ("notes.txt", BASE.as_bytes()), ("old.txt", b"old\n")],
        "cl1",
    )
    .await;
    let (dir, ws) = h.workspace().await;

    h.author_writes(
        &[("logo.png", PNG_V2), ("notes.txt", BASE.replace("line1", "remote").as_bytes())],
        "cl2",
    )
    .await;
    fs::remove_file(h.author.path().join("old.txt")).unwrap();
    h.author_submits(vec![Modification::delete("old.txt")], "cl3").await;

    let root = ws.root();
    fs::write(root.join("logo.png"), PNG_LOCAL).unwrap();
    fs::write(root.join("notes.txt"), BASE.replace("line5", "local")).unwrap();
    fs::write(root.join("old.txt"), "old, edited\n").unwrap();
    (h, dir, ws)
}

#[tokio::test]
async fn test_only_binary_and_deleted_files_conflict() {
    let (h, _dir, ws) = diverged().await;
    let state = ws.load_state();
    let modified = state.modified_paths(ws.root());
    assert_eq!(modified.len(), 3);

    let result = h.checker().check_conflicts(ws.root(), &state, &modified).await.unwrap();
    assert!(result.has_conflicts);
    let kinds: Vec<(&str, ConflictKind)> =
        result.conflicts.iter().map(|c| (c.path.as_str(), c.kind)).collect();
    assert!(kinds.contains(&("logo.png", ConflictKind::Binary)));
    assert!(kinds.contains(&("old.txt", ConflictKind::DeletedOnRemote)));
    assert!(!result.conflicts.iter().any(|c| c.path == "notes.txt"));
    assert_eq!(result.mergeable, vec!["notes.txt".to_string()]);

    let msg = checkpoint_core::conflict::conflict_error(&result).unwrap().to_string();
    assert!(msg.contains("logo.png") && msg.contains("old.txt"));
}

#[tokio::test]
async fn test_guarded_pull_refuses_hard_conflicts() {
    let (h, _dir, ws) = diverged().await;
    let before = fs::read(ws.state_path()).unwrap();
    let puller = h.puller().with_conflict_guard(true);

    let err = puller.pull(&ws, None).await.unwrap_err();
    match err {
        SyncError::Conflicts(entries) => {
            let mut found: Vec<(&str, &str)> =
                entries.iter().map(|e| (e.path.as_str(), e.reason.as_str())).collect();
            found.sort();
            assert_eq!(found, vec![("logo.png", "binary"), ("old.txt", "deleted on remote")]);
        }
        other => panic!("expected conflicts, got {other}"),
    }

    // Nothing was fetched or rewritten.
    assert_eq!(fs::read(ws.state_path()).unwrap(), before);
    assert_eq!(fs::read(ws.root().join("logo.png")).unwrap(), PNG_LOCAL);
    assert_eq!(read(ws.root(), "notes.txt"), BASE.replace("line5", "local"));
    assert!(ws.load_staged().is_empty());

    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();
    for path in ["logo.png", "old.txt"] {
        h.resolver()
            .resolve(&ws, &status, &[path.to_string()], Resolution::AcceptRemote)
            .await
            .unwrap();
    }
    let outcome = puller.pull(&ws, None).await.unwrap();
    assert_eq!(outcome.to_changelist, 3);
    assert_eq!(outcome.merges.len(), 1);
    assert_eq!(outcome.merges[0].path, "notes.txt");
}

#[tokio::test]
async fn test_merge_paths_checks_every_path_before_writing() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes()), ("z.png", PNG_V1)], "cl1").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(
        &[("a.txt", BASE.replace("line1", "remote").as_bytes()), ("z.png", PNG_V2)],
        "cl2",
    )
    .await;
    let local = BASE.replace("line5", "local");
    fs::write(ws.root().join("a.txt"), &local).unwrap();
    fs::write(ws.root().join("z.png"), PNG_LOCAL).unwrap();
    let before = fs::read(ws.state_path()).unwrap();

    let err = h
        .puller()
        .merge_paths(&ws, &["a.txt".to_string(), "z.png".to_string()])
        .await
        .unwrap_err();
    match err {
        SyncError::Conflicts(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].path, "z.png");
            assert_eq!(entries[0].reason, "binary");
            assert_eq!(entries[0].remote_changelist, Some(2));
        }
        other => panic!("expected conflicts, got {other}"),
    }

    // The mergeable text file was not touched either.
    assert_eq!(read(ws.root(), "a.txt"), local);
    assert_eq!(fs::read(ws.root().join("z.png")).unwrap(), PNG_LOCAL);
    assert_eq!(fs::read(ws.state_path()).unwrap(), before);
    assert!(ws.load_staged().is_empty());

    // Without the binary the text file merges and is staged.
    let merges = h.puller().merge_paths(&ws, &["a.txt".to_string()]).await.unwrap();
    assert_eq!(merges[0].outcome, MergeOutcome::Clean);
    assert_eq!(ws.load_state().get("a.txt").unwrap().changelist, 2);
    assert!(ws.load_staged().get("a.txt").is_some());
}

#[tokio::test]
async fn test_resolve_then_pull_and_submit() {
    let (h, _dir, ws) = diverged().await;
    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();

    let resolved = h
        .resolver()
        .resolve(&ws, &status, &["logo.png".to_string()], Resolution::AcceptRemote)
        .await
        .unwrap();
    assert_eq!(resolved[0].remote_changelist, Some(2));
    assert_eq!(fs::read(ws.root().join("logo.png")).unwrap(), PNG_V2);
    assert_eq!(ws.load_state().get("logo.png").unwrap().changelist, 2);

    let resolved = h
        .resolver()
        .resolve(&ws, &status, &["old.txt".to_string()], Resolution::AcceptLocal)
        .await
        .unwrap();
    assert_eq!(resolved[0].remote_changelist, None);
    assert!(ws.load_state().get("old.txt").is_none());
    assert!(ws.load_staged().get("old.txt").is_some());

    // No hard conflicts remain.
    let state = ws.load_state();
    let modified = state.modified_paths(ws.root());
    let check = h.checker().check_conflicts(ws.root(), &state, &modified).await.unwrap();
    assert!(!check.has_conflicts, "{:?}", check.conflicts);

    let outcome = h.puller().pull(&ws, None).await.unwrap();
    assert_eq!(outcome.to_changelist, 3);
    assert_eq!(fs::read(ws.root().join("logo.png")).unwrap(), PNG_V2);
    assert_eq!(read(ws.root(), "old.txt"), "old, edited\n");

    let result = h
        .submitter()
        .submit_workspace(&ws, BRANCH, "keep old.txt and merged notes", false)
        .await
        .unwrap();
    assert_eq!(result.changelist.number, 4);
    let old = result.changes.iter().find(|c| c.path == "old.txt").unwrap();
    assert_eq!(old.change_type, FileChangeType::Add);
    let notes = result.changes.iter().find(|c| c.path == "notes.txt").unwrap();
    assert_eq!(notes.change_type, FileChangeType::Modify);

    let state = ws.load_state();
    assert_eq!(state.changelist_number, 4);
    assert!(state.modified_paths(ws.root()).is_empty());
    assert!(ws.load_staged().is_empty());
    let status = h.checker().check_sync_status(&state).await.unwrap();
    assert!(status.up_to_date);
}

#[tokio::test]
async fn test_resolve_rejects_stale_status() {
    let (h, _dir, ws) = diverged().await;
    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();

    // The binary moves again after the status was taken.
    h.author_writes(&[("logo.png", &[0u8, 7, 7][..])], "cl4").await;

    let err = h
        .resolver()
        .resolve(&ws, &status, &["logo.png".to_string()], Resolution::AcceptLocal)
        .await
        .unwrap_err();
    match err {
        SyncError::StaleStatus { cached, current, paths } => {
            assert_eq!(cached, 3);
            assert_eq!(current, 4);
            assert_eq!(paths, vec!["logo.png".to_string()]);
        }
        other => panic!("expected stale status, got {other}"),
    }

    // Paths the new changelist did not touch can still be resolved.
    let resolved = h
        .resolver()
        .resolve(&ws, &status, &["old.txt".to_string()], Resolution::AcceptRemote)
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert!(!ws.root().join("old.txt").exists());
}

#[tokio::test]
async fn test_pre_submit_merge_keeps_workspace_behind() {
    let h = Harness::new();
    h.author_writes(&[("a.txt", BASE.as_bytes()), ("b.txt", b"b\n")], "cl1").await;
    let (_dir, ws) = h.workspace().await;

    h.author_writes(&[("a.txt", BASE.replace("line1", "remote").as_bytes())], "cl2").await;
    h.author_writes(&[("b.txt", b"b2\n")], "cl3").await;
    fs::write(ws.root().join("a.txt"), BASE.replace("line5", "local")).unwrap();

    let merges = h.puller().merge_paths(&ws, &["a.txt".to_string()]).await.unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].outcome, MergeOutcome::Clean);
    let text = read(ws.root(), "a.txt");
    assert!(text.contains("remote") && text.contains("local"));

    let state = ws.load_state();
    assert_eq!(state.changelist_number, 1);
    assert_eq!(state.get("a.txt").unwrap().changelist, 2);
    assert_eq!(read(ws.root(), "b.txt"), "b\n");

    let result = h
        .submitter()
        .submit_workspace(&ws, BRANCH, "merged a", false)
        .await
        .unwrap();
    assert_eq!(result.changelist.number, 4);
    assert_eq!(result.changes.len(), 1);
    // b.txt is still behind; the workspace did not jump to the new head.
    assert_eq!(ws.load_state().changelist_number, 1);
    let status = h.checker().check_sync_status(&ws.load_state()).await.unwrap();
    assert_eq!(status.outdated_files.len(), 1);
    assert_eq!(status.outdated_files[0].path, "b.txt");
}
