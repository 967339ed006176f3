//! `chk resolve`.

use anyhow::{Context, Result};

use checkpoint_core::conflict::Resolution;
use checkpoint_core::workspace::{normalize_rel_path, Workspace};
use checkpoint_core::Engine;

use super::style;

pub async fn run_resolve(engine: &Engine, ws: &Workspace, paths: &[String], accept: &str) -> Result<()> {
    let resolution = Resolution::from_str_val(accept)
        .with_context(|| format!("unknown resolution '{accept}' (use local or remote)"))?;
    let paths = paths
        .iter()
        .map(|p| normalize_rel_path(p))
        .collect::<Result<Vec<_>, _>>()?;

    let state = ws.load_state();
    let status = engine
        .checker()
        .check_sync_status(&state)
        .await
        .context("failed to check sync status")?;

    let resolved = engine
        .resolver()
        .resolve(ws, &status, &paths, resolution)
        .await
        .context("failed to resolve conflicts")?;

    if resolved.is_empty() {
        println!("{}", style::warn("None of the given paths changed on the remote"));
        return Ok(());
    }
    for r in &resolved {
        println!("{}", style::success(&format!("{} ({})", r.path, r.resolution)));
    }
    Ok(())
}
