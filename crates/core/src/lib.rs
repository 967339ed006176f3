//! Checkpoint core library.
//!
//! This crate provides the workspace synchronization engine of a
//! changelist-based version control system: state trees and their diff,
//! file status resolution, sync-status and conflict detection, pull with
//! three-way auto-merge, and optimistic changelist submission, together
//! with the SQLite history service, the content-addressed block store and
//! local workspace persistence they run on.

pub mod config;
pub mod conflict;
pub mod db;
pub mod engine;
pub mod errors;
pub mod history;
pub mod models;
pub mod pull;
pub mod registry;
pub mod status;
pub mod submit;
pub mod transport;
pub mod tree;
pub mod workspace;

// Re-exports for convenience.
pub use config::CheckpointConfig;
pub use conflict::{ConflictResolver, Resolution, SyncChecker};
pub use db::Database;
pub use engine::Engine;
pub use history::HistoryStore;
pub use pull::{PullExecutor, PullOutcome};
pub use registry::WorkspaceRegistry;
pub use status::StatusResolver;
pub use submit::{SubmitAllocator, SubmitRequest, SubmitResult};
pub use transport::{ContentTransport, LocalBlockStore};
pub use tree::StateTree;
pub use workspace::Workspace;
