//! TOML-based workspace configuration.
//!
//! Loaded from `<workspace>/.checkpoint/config.toml`. Secrets (the content
//! store token) are never written to the file; the config names an
//! environment variable instead and [`CheckpointConfig::resolve_env_vars`]
//! reads it at runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub workspace: WorkspaceConfig,

    pub server: ServerConfig,

    pub store: StoreConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub log: LogConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Identity of this workspace in the history service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub repo_id: String,
    pub workspace_id: String,
    pub user_id: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the history database.
    pub database: PathBuf,
}

/// Content store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the block store.
    pub path: PathBuf,

    /// Environment variable holding the store access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Lifetime of transfer credentials in seconds.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,

    /// Resolved token (not serialized).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_expiry_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts the submit allocator makes before giving up.
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,

    /// Interval between content-transport polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long loaded ignore/cloak patterns stay fresh.
    #[serde(default = "default_pattern_cache_ttl_secs")]
    pub pattern_cache_ttl_secs: u64,

    /// Auto-merge locally modified text files during pull.
    #[serde(default = "default_true")]
    pub auto_merge: bool,
}

fn default_submit_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_pattern_cache_ttl_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submit_attempts: default_submit_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            pattern_cache_ttl_secs: default_pattern_cache_ttl_secs(),
            auto_merge: true,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pattern_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.pattern_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl CheckpointConfig {
    /// Build a fresh config for `chk init`.
    pub fn new(
        repo_id: impl Into<String>,
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
        database: PathBuf,
        store: PathBuf,
    ) -> Self {
        Self {
            workspace: WorkspaceConfig {
                repo_id: repo_id.into(),
                workspace_id: workspace_id.into(),
                user_id: user_id.into(),
                branch: default_branch(),
            },
            server: ServerConfig { database },
            store: StoreConfig {
                path: store,
                token_env: None,
                expiry_secs: default_expiry_secs(),
                token: None,
            },
            sync: SyncConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load a config from a TOML file. Does **not** resolve environment
    /// variables.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: CheckpointConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        // Relative paths are relative to the workspace root, which is the
        // parent of the `.checkpoint` directory holding this file.
        if let Some(root) = path.parent().and_then(Path::parent) {
            config.resolve_paths(root);
        }

        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        if self.server.database.is_relative() {
            self.server.database = root.join(&self.server.database);
        }
        if self.store.path.is_relative() {
            self.store.path = root.join(&self.store.path);
        }
    }

    /// Resolve `store.token_env`. A referenced variable that is unset is an
    /// error.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.store.token_env {
            match std::env::var(env_name) {
                Ok(val) if !val.is_empty() => {
                    debug!(env_name, "resolved store token");
                    self.store.token = Some(val);
                }
                _ => {
                    return Err(ConfigError::EnvVarMissing {
                        var: env_name.clone(),
                        field: "store.token_env".into(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("workspace.repo_id", &self.workspace.repo_id),
            ("workspace.workspace_id", &self.workspace.workspace_id),
            ("workspace.user_id", &self.workspace.user_id),
            ("workspace.branch", &self.workspace.branch),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "must not be empty".into(),
                });
            }
        }
        if self.sync.submit_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.submit_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.sync.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.poll_interval_ms".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}
