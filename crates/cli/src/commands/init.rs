//! `chk init`: create the workspace metadata and config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use checkpoint_core::config::CheckpointConfig;
use checkpoint_core::workspace::Workspace;
use checkpoint_core::Engine;

use super::style;

pub struct InitOptions {
    pub repo: String,
    pub workspace_id: String,
    pub user: String,
    pub branch: String,
    pub database: Option<PathBuf>,
    pub store: Option<PathBuf>,
    pub create_repo: bool,
}

/// Shared per-user location for the history database and block store.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("checkpoint")
}

pub fn run_init(dir: &Path, opts: InitOptions) -> Result<()> {
    let ws = Workspace::init(dir).context("failed to create workspace metadata")?;
    let config_path = ws.config_path();
    if config_path.exists() {
        anyhow::bail!(
            "workspace already initialized: {} exists",
            config_path.display()
        );
    }

    let data_dir = default_data_dir();
    let mut config = CheckpointConfig::new(
        &opts.repo,
        &opts.workspace_id,
        &opts.user,
        opts.database.unwrap_or_else(|| data_dir.join("history.db")),
        opts.store.unwrap_or_else(|| data_dir.join("blocks")),
    );
    config.workspace.branch = opts.branch;
    config.validate().context("invalid workspace settings")?;
    config
        .save_to_file(&config_path)
        .context("failed to write workspace config")?;

    if opts.create_repo {
        let engine = Engine::open(
            CheckpointConfig::load_and_resolve(&config_path).context("failed to reload config")?,
        )
        .context("failed to open history database")?;
        let branch = &engine.config().workspace.branch;
        engine
            .db()
            .create_repo(&opts.repo, &opts.repo, branch, &opts.user)
            .context("failed to create repository")?;
        println!("{}", style::success(&format!("Created repository '{}' on branch '{}'", opts.repo, branch)));
    }

    println!(
        "{}",
        style::success(&format!("Initialized workspace in {}", ws.root().display()))
    );
    println!("  Config: {}", config_path.display());
    println!();
    println!("Next: run 'chk pull' to fetch the branch head");
    Ok(())
}
