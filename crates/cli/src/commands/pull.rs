//! `chk pull` and `chk merge`.

use anyhow::{Context, Result};

use checkpoint_core::conflict::conflict_error;
use checkpoint_core::pull::{FileMerge, MergeOutcome};
use checkpoint_core::workspace::{normalize_rel_path, Workspace};
use checkpoint_core::Engine;

use super::{spinner, style};

fn print_merges(merges: &[FileMerge]) {
    for m in merges {
        match &m.outcome {
            MergeOutcome::Clean => println!("  {} {}", style::success("merged"), m.path),
            MergeOutcome::Conflicted { markers } => {
                let lines = markers
                    .iter()
                    .map(|c| format!("{}-{}", c.start_line, c.end_line))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "  {} {} (lines {lines})",
                    style::warn("conflict"),
                    m.path
                );
            }
            MergeOutcome::Failed { reason } => {
                println!("  {} {} ({reason}); remote content kept", style::error("not merged"), m.path)
            }
        }
    }
}

pub async fn run_pull(engine: &Engine, ws: &Workspace, to: Option<i64>) -> Result<()> {
    // Hard conflicts stop the pull before anything is touched.
    let state = ws.load_state();
    let modified = state.modified_paths(ws.root());
    let check = engine
        .checker()
        .check_conflicts(ws.root(), &state, &modified)
        .await
        .context("failed to check conflicts")?;
    if let Some(err) = conflict_error(&check) {
        return Err(err.into());
    }
    if to.is_none() && check.status.up_to_date {
        println!(
            "{}",
            style::success(&format!("Already at {}", style::changelist(check.status.remote_head)))
        );
        return Ok(());
    }

    let progress = spinner("Pulling...");
    let result = engine.pull_executor().pull(ws, to).await;
    progress.finish_and_clear();
    let outcome = result?;

    println!(
        "{}",
        style::success(&format!(
            "Pulled {} -> {}",
            style::changelist(outcome.from_changelist),
            style::changelist(outcome.to_changelist)
        ))
    );
    if !outcome.fetched_changelists.is_empty() {
        let fetched = outcome
            .fetched_changelists
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        println!("  fetched: {fetched}");
    }
    for path in &outcome.deleted_paths {
        println!("  deleted: {path}");
    }
    print_merges(&outcome.merges);

    let conflicted = outcome.conflicted_paths();
    if !conflicted.is_empty() {
        println!();
        println!(
            "{}",
            style::warn("Fix the conflict markers above, then run 'chk submit'")
        );
    }
    Ok(())
}

pub async fn run_merge(engine: &Engine, ws: &Workspace, paths: &[String]) -> Result<()> {
    let paths = paths
        .iter()
        .map(|p| normalize_rel_path(p))
        .collect::<Result<Vec<_>, _>>()?;
    let merges = engine
        .pull_executor()
        .merge_paths(ws, &paths)
        .await
        .context("pre-submit merge failed")?;
    if merges.is_empty() {
        println!("{}", style::success("Files are already current"));
    } else {
        print_merges(&merges);
    }
    Ok(())
}
