//! Configuration management for the backup engine.
//!
//! One TOML file holds both the static settings and the persisted quota
//! state (accounted size, last backup timestamp). The orchestrator and the
//! evictor are the only writers; every mutation is followed by an explicit
//! `save` so the accounting survives a crash mid-run.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub disk: DiskConfig,
    pub backup: BackupConfig,
    pub state: QuotaState,
    pub transfer: TransferConfig,
    pub daemon: DaemonConfig,
    pub log: LogConfig,

    /// Where this config was loaded from (and will be saved to).
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Filesystem UUID of the backup disk; unset until the disk is enrolled.
    #[serde(default)]
    pub uuid: Option<String>,

    /// Quota ceiling in bytes for all retained backups combined.
    #[serde(default)]
    pub quota_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Backup subdirectory under the disk mount point.
    #[serde(default = "default_backup_subdir")]
    pub dir: String,

    /// Source tree to back up. Trailing-slash semantics follow rsync.
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Snapshot directory name format (UTC, lexicographically sortable).
    #[serde(default = "default_date_format")]
    pub date_format: String,

    /// User-configured exclude patterns.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// System exclude patterns (pseudo-filesystems, scratch space).
    #[serde(default = "default_system_exclude")]
    pub system_exclude: Vec<String>,

    /// What to do when eviction cannot make the backup fit the quota.
    #[serde(default)]
    pub quota_policy: QuotaPolicy,
}

/// Persisted quota accounting, updated on commit and during eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    /// Cumulative size of retained backups in bytes, hard-link-deduplicated.
    #[serde(default)]
    pub backup_size: u64,

    /// Timestamp string of the last successful backup; empty means never.
    #[serde(default)]
    pub last_backup: String,

    #[serde(default)]
    pub days_since_last_backup: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Path to the rsync binary.
    #[serde(default = "default_rsync_path")]
    pub rsync_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Lock file location; existence is the single-instance gate.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file; rotated by size at startup.
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

/// Behavior when old backups cannot be evicted down to the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPolicy {
    /// Back up anyway and surface the condition. Skipping a backup risks
    /// losing more data than briefly exceeding the quota.
    #[default]
    Proceed,
    /// Skip the transfer and report failure.
    Abort,
}

// Default values
fn default_backup_subdir() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("Backups/{}", host)
}

fn default_source() -> PathBuf {
    PathBuf::from("/")
}

fn default_date_format() -> String {
    "%Y-%m-%d-%H%M%S".to_string()
}

fn default_system_exclude() -> Vec<String> {
    [
        "/proc/*",
        "/sys/*",
        "/dev/*",
        "/run/*",
        "/tmp/*",
        "/var/tmp/*",
        "/mnt/*",
        "/media/*",
        "/lost+found",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_rsync_path() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/diskvault.lock")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_max_files() -> usize {
    4
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default_at(path))
        }
    }

    /// Create a default configuration that will persist to `path`.
    pub fn default_at(path: &Path) -> Self {
        Config {
            disk: DiskConfig {
                uuid: None,
                quota_bytes: 0,
            },
            backup: BackupConfig {
                dir: default_backup_subdir(),
                source: default_source(),
                date_format: default_date_format(),
                exclude: Vec::new(),
                system_exclude: default_system_exclude(),
                quota_policy: QuotaPolicy::default(),
            },
            state: QuotaState {
                backup_size: 0,
                last_backup: String::new(),
                days_since_last_backup: 0,
            },
            transfer: TransferConfig {
                rsync_path: default_rsync_path(),
            },
            daemon: DaemonConfig {
                lock_file: default_lock_file(),
            },
            log: LogConfig {
                level: default_log_level(),
                file: None,
                max_bytes: default_log_max_bytes(),
                max_files: default_log_max_files(),
            },
            path: path.to_path_buf(),
        }
    }

    /// Persist the current state to the file it was loaded from.
    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
