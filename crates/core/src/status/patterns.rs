//! Ignore and cloak pattern sets.
//!
//! Patterns are read from `.checkpointignore` and `.checkpointcloak` marker
//! files found anywhere in the workspace. Each pattern is rooted at the
//! directory of the file that declares it:
//!
//! | Declared in `art/` | Expands to |
//! |--------------------|------------|
//! | `*.tmp`            | `art/*.tmp`, `art/**/*.tmp` (and their contents) |
//! | `/cache`           | `art/cache` (and its contents) |
//! | `raw/*.psd`        | `art/raw/*.psd` (and its contents) |

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::workspace::META_DIR;

pub const IGNORE_FILE: &str = ".checkpointignore";
pub const CLOAK_FILE: &str = ".checkpointcloak";

/// Expanded glob patterns for one workspace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    ignore: Vec<String>,
    cloak: Vec<String>,
}

impl PatternSet {
    /// Walk `root` and collect every marker file's patterns.
    pub fn load(root: &Path) -> io::Result<Self> {
        let mut set = PatternSet::default();
        walk(root, "", &mut set)?;
        debug!(
            root = %root.display(),
            ignore = set.ignore.len(),
            cloak = set.cloak.len(),
            "loaded pattern sets"
        );
        Ok(set)
    }

    /// Build a set from marker-file contents keyed by declaring directory
    /// (`""` for the workspace root).
    pub fn from_sources(ignore: &[(&str, &str)], cloak: &[(&str, &str)]) -> Self {
        let mut set = PatternSet::default();
        for (dir, text) in ignore {
            set.ignore.extend(expand_file(dir, text));
        }
        for (dir, text) in cloak {
            set.cloak.extend(expand_file(dir, text));
        }
        set
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        rel_path == META_DIR
            || rel_path.starts_with(&format!("{META_DIR}/"))
            || matches_any(&self.ignore, rel_path)
    }

    pub fn is_cloaked(&self, rel_path: &str) -> bool {
        matches_any(&self.cloak, rel_path)
    }
}

fn matches_any(patterns: &[String], rel_path: &str) -> bool {
    let path = rel_path.replace('\\', "/");
    patterns.iter().any(|p| glob_match::glob_match(p, &path))
}

fn walk(dir: &Path, rel_dir: &str, set: &mut PatternSet) -> io::Result<()> {
    for (marker, target) in [(IGNORE_FILE, &mut set.ignore), (CLOAK_FILE, &mut set.cloak)] {
        match fs::read_to_string(dir.join(marker)) {
            Ok(text) => target.extend(expand_file(rel_dir, &text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %dir.display(), marker, error = %e, "unreadable marker file"),
        }
    }

    let mut subdirs: Vec<(PathBuf, String)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if rel_dir.is_empty() && name == META_DIR {
            continue;
        }
        let child = if rel_dir.is_empty() {
            name
        } else {
            format!("{rel_dir}/{name}")
        };
        subdirs.push((entry.path(), child));
    }
    subdirs.sort_by(|a, b| a.1.cmp(&b.1));
    for (path, child) in subdirs {
        walk(&path, &child, set)?;
    }
    Ok(())
}

fn expand_file(rel_dir: &str, text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .flat_map(|l| expand_pattern(rel_dir, l))
        .collect()
}

/// Root `pattern` at `rel_dir`.
fn expand_pattern(rel_dir: &str, pattern: &str) -> Vec<String> {
    let prefix = if rel_dir.is_empty() {
        String::new()
    } else {
        format!("{rel_dir}/")
    };
    let pat = pattern.trim_end_matches('/');
    let anchored = pat.starts_with('/') || pat.contains('/');
    let pat = pat.trim_start_matches('/');
    if pat.is_empty() {
        return Vec::new();
    }

    let mut out = vec![format!("{prefix}{pat}"), format!("{prefix}{pat}/**")];
    if !anchored {
        out.push(format!("{prefix}**/{pat}"));
        out.push(format!("{prefix}**/{pat}/**"));
    }
    out
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Per-workspace-root cache of loaded pattern sets with a freshness window.
#[derive(Debug)]
pub struct PatternCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, (Instant, Arc<PatternSet>)>>,
}

impl PatternCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached pattern set for `root`, reloaded when older than the TTL.
    pub fn get(&self, root: &Path) -> io::Result<Arc<PatternSet>> {
        {
            let entries = self.lock();
            if let Some((loaded_at, set)) = entries.get(root) {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(set));
                }
            }
        }
        let set = Arc::new(PatternSet::load(root)?);
        self.lock()
            .insert(root.to_path_buf(), (Instant::now(), Arc::clone(&set)));
        Ok(set)
    }

    /// Drop the cached set for `root`, e.g. after a marker file was edited.
    pub fn invalidate(&self, root: &Path) {
        self.lock().remove(root);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, (Instant, Arc<PatternSet>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
