//! Resilience configuration
//!
//! Loaded from `<workspace>/.ticketvault/config.toml` when present, then
//! overridden by `TICKETVAULT_*` environment variables. Durations are
//! integer milliseconds; nested keys use `__` in variable names, e.g.
//! `TICKETVAULT_RETRY__MAX_RETRIES=5`.
use crate::error::retry::{duration_ms, RetryConfig};
use crate::recovery::RecoveryConfig;
use crate::restore::RestoreConfig;
use crate::storage::paths::{
    default_alternate_paths, default_primary_path, default_recovery_path, HIDDEN_DIR,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "TICKETVAULT";

/// Config file name inside the hidden directory
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Workspace root; set by the loader, never read from sources
    #[serde(skip)]
    pub workspace: PathBuf,

    /// Overrides `<workspace>/.ticketvault/tickets.db`
    pub primary_path: Option<PathBuf>,

    /// Overrides the home/temp alternates
    pub alternate_paths: Option<Vec<PathBuf>>,

    /// Overrides `<workspace>/.ticketvault/recovery/tickets-recovery.json`
    pub recovery_path: Option<PathBuf>,

    pub retry: RetryConfig,

    #[serde(rename = "autosave_interval_ms", with = "duration_ms")]
    pub autosave_interval: Duration,

    #[serde(rename = "snapshot_max_age_ms", with = "duration_ms")]
    pub snapshot_max_age: Duration,

    #[serde(rename = "backup_retention_ms", with = "duration_ms")]
    pub backup_retention: Duration,

    #[serde(rename = "restore_check_interval_ms", with = "duration_ms")]
    pub restore_check_interval: Duration,

    /// Minimum time in fallback before restoring
    #[serde(rename = "restore_min_age_ms", with = "duration_ms")]
    pub restore_min_age: Duration,

    pub migration_batch_size: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            primary_path: None,
            alternate_paths: None,
            recovery_path: None,
            retry: RetryConfig::default(),
            autosave_interval: Duration::from_secs(30),
            snapshot_max_age: Duration::from_secs(24 * 60 * 60),
            backup_retention: Duration::from_secs(7 * 24 * 60 * 60),
            restore_check_interval: Duration::from_secs(60),
            restore_min_age: Duration::from_secs(5 * 60),
            migration_batch_size: 50,
        }
    }
}

impl ResilienceConfig {
    /// Defaults rooted at `workspace`, ignoring files and environment
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    /// `<workspace>/.ticketvault/config.toml`
    pub fn config_path(workspace: &Path) -> PathBuf {
        workspace.join(HIDDEN_DIR).join(CONFIG_FILE)
    }

    /// Load configuration for `workspace` from file and environment
    pub fn load(workspace: &Path) -> Result<Self> {
        let path = Self::config_path(workspace);

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;

        let mut loaded: Self = settings
            .try_deserialize()
            .context("Invalid ticketvault configuration")?;
        loaded.workspace = workspace.to_path_buf();
        loaded.validate()?;

        tracing::debug!(workspace = %workspace.display(), config = ?loaded, "Configuration loaded");
        Ok(loaded)
    }

    /// Reject values the managers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.migration_batch_size == 0 {
            bail!("migration_batch_size must be at least 1");
        }
        if self.autosave_interval.is_zero() {
            bail!("autosave_interval_ms must be greater than zero");
        }
        if self.restore_check_interval.is_zero() {
            bail!("restore_check_interval_ms must be greater than zero");
        }
        if self.retry.base_delay > self.retry.max_delay {
            bail!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay,
                self.retry.max_delay
            );
        }
        Ok(())
    }

    pub fn primary_path(&self) -> PathBuf {
        self.primary_path
            .clone()
            .unwrap_or_else(|| default_primary_path(&self.workspace))
    }

    pub fn alternate_paths(&self) -> Vec<PathBuf> {
        self.alternate_paths
            .clone()
            .unwrap_or_else(|| default_alternate_paths(&self.workspace))
    }

    pub fn recovery_path(&self) -> PathBuf {
        self.recovery_path
            .clone()
            .unwrap_or_else(|| default_recovery_path(&self.workspace))
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            path: self.recovery_path(),
            autosave_interval: self.autosave_interval,
            max_age: self.snapshot_max_age,
            backup_retention: self.backup_retention,
        }
    }

    pub fn restore_config(&self) -> RestoreConfig {
        RestoreConfig {
            primary_path: self.primary_path(),
            alternate_paths: self.alternate_paths(),
            check_interval: self.restore_check_interval,
            max_age: self.restore_min_age,
            batch_size: self.migration_batch_size,
        }
    }
}
