//! `chk log`.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use checkpoint_core::history::HistoryStore;
use checkpoint_core::Engine;

pub async fn run_log(engine: &Engine, limit: u32) -> Result<()> {
    let ws = &engine.config().workspace;
    let changelists = engine
        .db()
        .list_changelists(&ws.repo_id, &ws.branch, limit)
        .await
        .context("failed to list changelists")?;

    if changelists.is_empty() {
        println!("No changelists found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["CL", "User", "Date", "Files", "Message"]);
    for cl in &changelists {
        table.add_row(vec![
            Cell::new(cl.number),
            Cell::new(&cl.user_id),
            Cell::new(cl.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(cl.state_tree.len()),
            Cell::new(&cl.message),
        ]);
    }
    println!("{table}");
    Ok(())
}
