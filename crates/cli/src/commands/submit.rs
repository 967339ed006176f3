//! `chk submit`.

use anyhow::{Context, Result};

use checkpoint_core::workspace::Workspace;
use checkpoint_core::Engine;

use super::{spinner, style};

pub async fn run_submit(engine: &Engine, ws: &Workspace, message: &str, keep_checked_out: bool) -> Result<()> {
    // Refuse to overwrite remote changes the workspace has not seen.
    let state = ws.load_state();
    let status = engine
        .checker()
        .check_sync_status(&state)
        .await
        .context("failed to check sync status")?;
    if !status.up_to_date {
        let staged = ws.load_staged();
        let mut candidates = state.modified_paths(ws.root());
        candidates.extend(staged.modifications.iter().map(|m| m.lookup_path().to_string()));
        let behind: Vec<String> = candidates
            .into_iter()
            .filter(|p| status.remote_changelist_for(p).is_some())
            .collect();
        if !behind.is_empty() {
            anyhow::bail!(
                "these files changed on the remote since your last pull: {}\nrun 'chk merge {}' (or 'chk pull') first",
                behind.join(", "),
                behind.join(" ")
            );
        }
    }

    let branch = engine.config().workspace.branch.clone();
    let progress = spinner("Submitting...");
    let result = engine
        .submitter()
        .submit_workspace(ws, &branch, message, keep_checked_out)
        .await;
    progress.finish_and_clear();
    let result = result?;

    println!(
        "{}",
        style::success(&format!(
            "Submitted {} ({} file(s))",
            style::changelist(result.changelist.number),
            result.changes.len()
        ))
    );
    for change in &result.changes {
        match &change.old_path {
            Some(old) => println!("  {:<6} {old} -> {}", change.change_type.to_string(), change.path),
            None => println!("  {:<6} {}", change.change_type.to_string(), change.path),
        }
    }
    if result.attempts > 1 {
        println!("{}", style::dim(&format!("succeeded on attempt {}", result.attempts)));
    }
    Ok(())
}
