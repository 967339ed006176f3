//! `chk add`, `chk rm`, `chk mv`: record modifications for the next submit.

use anyhow::{Context, Result};

use checkpoint_core::workspace::{normalize_rel_path, Workspace};

use super::style;

pub fn run_add(ws: &Workspace, paths: &[String]) -> Result<()> {
    let _lock = ws.lock()?;
    let mut staged = ws.load_staged();
    for raw in paths {
        let path = normalize_rel_path(raw)?;
        let abs = ws.root().join(&path);
        if !abs.is_file() {
            anyhow::bail!("no such file: {path}");
        }
        staged.stage_add(&path);
        println!("{}", style::success(&format!("staged {path}")));
    }
    ws.save_staged(&staged).context("failed to save staged changes")?;
    Ok(())
}

pub fn run_rm(ws: &Workspace, paths: &[String]) -> Result<()> {
    let _lock = ws.lock()?;
    let state = ws.load_state();
    let mut staged = ws.load_staged();
    for raw in paths {
        let path = normalize_rel_path(raw)?;
        let staged_add = staged.get(&path).is_some_and(|m| !m.delete && m.old_path.is_none());
        if state.get(&path).is_none() && !staged_add {
            anyhow::bail!("not tracked: {path}");
        }
        let abs = ws.root().join(&path);
        if abs.exists() {
            std::fs::remove_file(&abs).with_context(|| format!("failed to remove {path}"))?;
        }
        if state.get(&path).is_some() || staged.get(&path).is_some_and(|m| m.old_path.is_some()) {
            staged.stage_delete(&path);
        } else {
            // Never submitted: dropping the staged add is enough.
            staged.unstage(&path);
        }
        println!("{}", style::success(&format!("removed {path}")));
    }
    ws.save_staged(&staged).context("failed to save staged changes")?;
    Ok(())
}

pub fn run_mv(ws: &Workspace, from: &str, to: &str) -> Result<()> {
    let _lock = ws.lock()?;
    let from = normalize_rel_path(from)?;
    let to = normalize_rel_path(to)?;
    let state = ws.load_state();
    let mut staged = ws.load_staged();
    if state.get(&from).is_none() && staged.get(&from).is_none() {
        anyhow::bail!("not tracked: {from}");
    }
    let dest = ws.root().join(&to);
    if dest.exists() {
        anyhow::bail!("destination exists: {to}");
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(ws.root().join(&from), &dest)
        .with_context(|| format!("failed to move {from} to {to}"))?;
    staged.stage_rename(&from, &to);
    ws.save_staged(&staged).context("failed to save staged changes")?;
    println!("{}", style::success(&format!("renamed {from} -> {to}")));
    Ok(())
}
