//! Checkpoint command-line client.
//!
//! Thin surface over `checkpoint-core`: workspace setup, status, sync
//! checks, pull/merge, conflict resolution, staging, submit and history.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use checkpoint_core::config::CheckpointConfig;
use checkpoint_core::workspace::Workspace;
use checkpoint_core::Engine;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "chk",
    version,
    about = "Checkpoint workspace client: sync, merge and submit changelists"
)]
struct Cli {
    /// Workspace directory (defaults to the current directory or the
    /// nearest parent containing `.checkpoint`).
    #[arg(short = 'C', long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a workspace in the current directory.
    Init {
        /// Repository id in the history service.
        #[arg(long)]
        repo: String,

        /// Identifier of this workspace.
        #[arg(long)]
        workspace_id: String,

        /// User submitting changelists.
        #[arg(long)]
        user: String,

        /// Branch to track.
        #[arg(long, default_value = "main")]
        branch: String,

        /// History database path (defaults to the user data directory).
        #[arg(long)]
        database: Option<PathBuf>,

        /// Block store directory (defaults to the user data directory).
        #[arg(long)]
        store: Option<PathBuf>,

        /// Also create the repository in the history service.
        #[arg(long)]
        create_repo: bool,
    },

    /// Show the status of workspace files.
    Status {
        /// Include unchanged and ignored files.
        #[arg(short, long)]
        all: bool,
    },

    /// Compare the workspace with the branch head.
    SyncStatus {
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List hard conflicts and auto-mergeable files.
    Conflicts,

    /// Bring the workspace up to a changelist (default: branch head).
    Pull {
        /// Target changelist number.
        #[arg(long)]
        to: Option<i64>,
    },

    /// Merge only the named files up to the branch head.
    Merge {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Resolve conflicted files by keeping one side.
    Resolve {
        #[arg(required = true)]
        paths: Vec<String>,

        /// Side to keep: local or remote.
        #[arg(long)]
        accept: String,
    },

    /// Stage new or modified files.
    Add {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Remove tracked files and stage the deletion.
    Rm {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Move a file and stage the rename.
    Mv { from: String, to: String },

    /// Submit staged and modified files as a new changelist.
    Submit {
        #[arg(short, long)]
        message: String,

        /// Keep submitted files checked out.
        #[arg(long)]
        keep_checked_out: bool,
    },

    /// Show recent changelists on the tracked branch.
    Log {
        /// Maximum number of changelists.
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.workspace.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", commands::style::error(&format!("{e:#}")));
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the workspace config's level, else `warn`.
fn init_logging(workspace: Option<&Path>) {
    let level = start_dir(workspace)
        .ok()
        .and_then(|dir| Workspace::discover(&dir).ok())
        .and_then(|ws| CheckpointConfig::load_from_file(ws.config_path()).ok())
        .map(|config| config.log.level)
        .unwrap_or_else(|| "warn".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Init {
        repo,
        workspace_id,
        user,
        branch,
        database,
        store,
        create_repo,
    } = cli.command
    {
        let dir = start_dir(cli.workspace.as_deref())?;
        return commands::init::run_init(
            &dir,
            commands::init::InitOptions {
                repo,
                workspace_id,
                user,
                branch,
                database,
                store,
                create_repo,
            },
        );
    }

    let ws = Workspace::discover(&start_dir(cli.workspace.as_deref())?)
        .context("not inside a checkpoint workspace (run `chk init` first)")?;

    // Staging never talks to the history service.
    match &cli.command {
        Commands::Add { paths } => return commands::stage::run_add(&ws, paths),
        Commands::Rm { paths } => return commands::stage::run_rm(&ws, paths),
        Commands::Mv { from, to } => return commands::stage::run_mv(&ws, from, to),
        _ => {}
    }

    let engine = open_engine(&ws)?;
    match cli.command {
        Commands::Status { all } => commands::status::run_status(&engine, &ws, all),
        Commands::SyncStatus { json } => commands::status::run_sync_status(&engine, &ws, json).await,
        Commands::Conflicts => commands::status::run_conflicts(&engine, &ws).await,
        Commands::Pull { to } => commands::pull::run_pull(&engine, &ws, to).await,
        Commands::Merge { paths } => commands::pull::run_merge(&engine, &ws, &paths).await,
        Commands::Resolve { paths, accept } => {
            commands::resolve::run_resolve(&engine, &ws, &paths, &accept).await
        }
        Commands::Submit {
            message,
            keep_checked_out,
        } => commands::submit::run_submit(&engine, &ws, &message, keep_checked_out).await,
        Commands::Log { limit } => commands::log::run_log(&engine, limit).await,
        Commands::Init { .. } | Commands::Add { .. } | Commands::Rm { .. } | Commands::Mv { .. } => {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn start_dir(workspace: Option<&Path>) -> Result<PathBuf> {
    match workspace {
        Some(dir) => Ok(dir.to_path_buf()),
        None => std::env::current_dir().context("cannot determine current directory"),
    }
}

fn open_engine(ws: &Workspace) -> Result<Engine> {
    let config = CheckpointConfig::load_and_resolve(ws.config_path())
        .context("failed to load workspace configuration")?;
    tracing::debug!(
        repo_id = %config.workspace.repo_id,
        branch = %config.workspace.branch,
        "loaded workspace configuration"
    );
    Engine::open(config).context("failed to open history database or block store")
}
