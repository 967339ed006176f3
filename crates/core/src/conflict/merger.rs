//! Three-way merge engine.
//!
//! Uses `diffy` for a line-based diff3 merge of a base, the local
//! (pre-pull) content and the incoming remote content. Unresolved overlaps
//! are left in the output between standard conflict markers.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The result of a three-way merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// The merged content (contains conflict markers if `has_conflicts`).
    pub merged_content: String,
    pub has_conflicts: bool,
    pub conflict_markers: Vec<ConflictMarker>,
}

impl MergeResult {
    fn clean(content: &str) -> Self {
        Self {
            merged_content: content.to_string(),
            has_conflicts: false,
            conflict_markers: Vec::new(),
        }
    }
}

/// A single conflict region within merged output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictMarker {
    /// Line of the opening `<<<<<<<` marker (1-indexed).
    pub start_line: usize,
    /// Line of the closing `>>>>>>>` marker (1-indexed).
    pub end_line: usize,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `local` and `remote`, both derived from `base`.
    pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeResult {
        if local == base {
            debug!("local == base, remote wins cleanly");
            return MergeResult::clean(remote);
        }
        if remote == base {
            debug!("remote == base, local wins cleanly");
            return MergeResult::clean(local);
        }
        if local == remote {
            debug!("local == remote, identical changes");
            return MergeResult::clean(local);
        }

        match diffy::merge(base, local, remote) {
            Ok(merged) => {
                debug!("clean three-way merge");
                MergeResult::clean(&merged)
            }
            Err(conflicted) => {
                let conflict_markers = scan_conflict_markers(&conflicted);
                debug!(regions = conflict_markers.len(), "merge left conflict markers");
                MergeResult {
                    merged_content: conflicted,
                    has_conflicts: true,
                    conflict_markers,
                }
            }
        }
    }

    /// Quick check: would these three versions merge without conflicts?
    pub fn can_auto_merge(base: &str, local: &str, remote: &str) -> bool {
        if local == base || remote == base || local == remote {
            return true;
        }
        diffy::merge(base, local, remote).is_ok()
    }
}

/// Find `<<<<<<<` ... `>>>>>>>` blocks. An unterminated block runs to the
/// last line.
pub fn scan_conflict_markers(content: &str) -> Vec<ConflictMarker> {
    let mut markers = Vec::new();
    let mut open: Option<usize> = None;
    let mut last = 0;
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        last = line_no;
        if line.starts_with("<<<<<<<") && open.is_none() {
            open = Some(line_no);
        } else if line.starts_with(">>>>>>>") {
            if let Some(start_line) = open.take() {
                markers.push(ConflictMarker {
                    start_line,
                    end_line: line_no,
                });
            }
        }
    }
    if let Some(start_line) = open {
        markers.push(ConflictMarker {
            start_line,
            end_line: last,
        });
    }
    markers
}
