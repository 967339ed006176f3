//! Sync-status checks, three-way merging and conflict resolution.
//!
//! 1. **Detection** -- comparing a workspace against its branch head and
//!    separating hard conflicts from auto-mergeable text edits.
//! 2. **Merging** -- three-way merges with conflict markers.
//! 3. **Resolution** -- settling hard conflicts by keeping one side.

pub mod detector;
pub mod merger;
pub mod resolver;

pub use detector::{classify_conflicts, conflict_error, SyncChecker};
pub use merger::{scan_conflict_markers, ConflictMarker, MergeResult, Merger};
pub use resolver::{ConflictResolver, Resolution, ResolvedPath};
