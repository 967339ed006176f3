//! `chk status`, `chk sync-status`, `chk conflicts`.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use checkpoint_core::models::{FileStatus, SyncStatus};
use checkpoint_core::workspace::Workspace;
use checkpoint_core::Engine;

use super::style;

fn status_cell(status: FileStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        FileStatus::Added | FileStatus::Renamed => cell.fg(Color::Green),
        FileStatus::Modified => cell.fg(Color::Yellow),
        FileStatus::Deleted | FileStatus::Conflicted => cell.fg(Color::Red),
        FileStatus::Local => cell.fg(Color::Cyan),
        _ => cell,
    }
}

pub fn run_status(engine: &Engine, ws: &Workspace, all: bool) -> Result<()> {
    let session = format!("cli-{}", std::process::id());
    engine.open_session(&session, ws);
    let files = engine
        .session_status(&session)
        .context("failed to resolve file status")?;
    engine.registry().unregister(&session);

    let state = ws.load_state();
    println!(
        "{} on branch '{}' at {}",
        style::header("Workspace"),
        engine.config().workspace.branch,
        style::changelist(state.changelist_number)
    );

    let shown: Vec<_> = files
        .iter()
        .filter(|f| {
            all || !matches!(
                f.status,
                FileStatus::WritableControlled | FileStatus::ReadOnlyControlled | FileStatus::Ignored
            )
        })
        .collect();
    if shown.is_empty() {
        println!("{}", style::success("Nothing to submit, working tree clean"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Status", "CL"]);
    for f in shown {
        table.add_row(vec![
            Cell::new(&f.path),
            status_cell(f.status),
            Cell::new(f.changelist.map(|n| n.to_string()).unwrap_or_else(|| "-".into())),
        ]);
    }
    println!("{table}");

    let conflicted = files.iter().filter(|f| f.status == FileStatus::Conflicted).count();
    if conflicted > 0 {
        println!(
            "{}",
            style::warn(&format!("{conflicted} file(s) contain conflict markers; edit them and submit"))
        );
    }
    Ok(())
}

fn print_sync_status(status: &SyncStatus) {
    if status.up_to_date {
        println!(
            "{}",
            style::success(&format!("Up to date with {}", style::changelist(status.remote_head)))
        );
        return;
    }
    println!(
        "Workspace at {}, branch head at {}",
        style::changelist(status.local_changelist),
        style::changelist(status.remote_head)
    );

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Change", "Local CL", "Remote CL"]);
    for f in &status.outdated_files {
        table.add_row(vec![
            Cell::new(&f.path),
            Cell::new("outdated").fg(Color::Yellow),
            Cell::new(f.local_changelist),
            Cell::new(f.remote_changelist),
        ]);
    }
    for f in &status.deleted_on_remote {
        table.add_row(vec![
            Cell::new(&f.path),
            Cell::new("deleted").fg(Color::Red),
            Cell::new(f.local_changelist),
            Cell::new("-"),
        ]);
    }
    for f in &status.new_on_remote {
        table.add_row(vec![
            Cell::new(&f.path),
            Cell::new("new").fg(Color::Green),
            Cell::new("-"),
            Cell::new(f.remote_changelist),
        ]);
    }
    println!("{table}");
    println!(
        "{}",
        style::dim(&format!("checked at {}", status.checked_at.format("%Y-%m-%d %H:%M:%S UTC")))
    );
}

pub async fn run_sync_status(engine: &Engine, ws: &Workspace, json: bool) -> Result<()> {
    let state = ws.load_state();
    let status = engine
        .checker()
        .check_sync_status(&state)
        .await
        .context("failed to check sync status")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_sync_status(&status);
    }
    Ok(())
}

pub async fn run_conflicts(engine: &Engine, ws: &Workspace) -> Result<()> {
    let state = ws.load_state();
    let modified = state.modified_paths(ws.root());
    let result = engine
        .checker()
        .check_conflicts(ws.root(), &state, &modified)
        .await
        .context("failed to check conflicts")?;

    if !result.has_conflicts && result.mergeable.is_empty() {
        println!("{}", style::success("No conflicts"));
        return Ok(());
    }

    if result.has_conflicts {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Path", "Reason", "Local CL", "Remote CL"]);
        for c in &result.conflicts {
            table.add_row(vec![
                Cell::new(&c.path),
                Cell::new(c.kind.to_string()).fg(Color::Red),
                Cell::new(c.local_changelist),
                Cell::new(
                    c.remote_changelist
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "deleted".into()),
                ),
            ]);
        }
        println!("{}", style::header("Conflicts"));
        println!("{table}");
        println!("Resolve with: chk resolve <path> --accept local|remote");
    }

    if !result.mergeable.is_empty() {
        println!();
        println!("{}", style::header("Will auto-merge on pull"));
        for path in &result.mergeable {
            println!("  {path}");
        }
    }
    Ok(())
}
