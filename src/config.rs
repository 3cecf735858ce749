//! finspect configuration
//!
//! A single [`FinspectConfig`] value is loaded once at process start and handed to each
//! component's constructor. Nothing reads configuration from globals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::dispatcher::EventJobMapping;
use crate::jobs::RetryPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FinspectConfig {
    pub storage: StorageConfig,
    pub watcher: WatcherConfig,
    pub dispatcher: DispatcherConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file holding the events, jobs and watch path tables
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".finspect/db/finspect.db"),
        }
    }
}

/// A watch path registered at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialWatchPath {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Raw notifications for one file inside this window collapse into a single event
    pub coalesce_window_ms: u64,

    /// A file that never goes quiet is still recorded once its burst is this old
    pub max_coalesce_delay_ms: u64,

    /// Files above this size are fingerprinted by size + mtime instead of a content hash
    pub max_hash_bytes: u64,

    /// Glob patterns for paths that never produce events
    pub ignore_patterns: Vec<String>,

    pub paths: Vec<InitialWatchPath>,
}

impl WatcherConfig {
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Never shorter than the window itself
    pub fn max_coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.max_coalesce_delay_ms).max(self.coalesce_window())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 250,
            max_coalesce_delay_ms: 2_000,
            max_hash_bytes: 64 * 1024 * 1024,
            ignore_patterns: vec![
                "**/.git/**".to_string(),
                "**/.finspect/**".to_string(),
                "**/*.swp".to_string(),
                "**/*.swx".to_string(),
                "**/*~".to_string(),
                "**/.#*".to_string(),
            ],
            paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Job bodies allowed to run at the same time across all lanes
    pub worker_slots: usize,

    pub job_timeout_ms: u64,

    /// Automatic retries applied by the dispatcher after a failed run
    pub retry: RetryPolicy,

    pub mapping: EventJobMapping,
}

impl DispatcherConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_slots: 4,
            job_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            mapping: EventJobMapping::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,

    /// Used when RUST_LOG is not set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(".finspect/logs"),
            filter: "finspect=info".to_string(),
        }
    }
}

impl FinspectConfig {
    /// Load configuration from a TOML file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Configuration file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FinspectConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        debug!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;

        debug!("Saved configuration to: {}", path.display());
        Ok(())
    }
}
