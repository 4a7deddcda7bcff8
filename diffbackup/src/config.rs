//! Configuration for the backup engine.
//!
//! Loaded from a TOML file; every field falls back to a default so a partial
//! file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::errors::{BackupError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run scheduled backups
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Send `save-off` before a backup and `save-on` afterwards
    #[serde(default = "default_true")]
    pub turn_off_auto_save: bool,

    /// File names skipped by every walk (lock files and the like)
    #[serde(default = "default_ignored_files")]
    pub ignored_files: Vec<String>,

    /// Directory holding `slotN/` and the overwrite slot
    #[serde(default = "default_backup_path")]
    pub backup_path: PathBuf,

    /// Folder name of the overwrite slot inside `backup_path`
    #[serde(default = "default_overwrite_folder")]
    pub overwrite_folder: String,

    /// Root of the managed server
    #[serde(default = "default_server_path")]
    pub server_path: PathBuf,

    /// World directory name inside `server_path`
    #[serde(default = "default_world_name")]
    pub world_name: String,

    /// Minutes between scheduled backups
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: f64,

    /// Seconds to wait for the server to report a finished save
    #[serde(default = "default_saving_timeout_secs")]
    pub saving_timeout_secs: u64,

    /// Grace period before a confirmed restore stops the server
    #[serde(default = "default_restore_countdown_secs")]
    pub restore_countdown_secs: u64,

    /// Delay before the catch-up backup that follows a skipped schedule
    #[serde(default = "default_join_backup_delay_secs")]
    pub join_backup_delay_secs: u64,

    /// Promote a full tier into the next one instead of evicting
    #[serde(default)]
    pub auto_merge: bool,

    /// Capacities of the slot tiers, newest tier first
    #[serde(default = "default_slot_tiers")]
    pub slot_tiers: Vec<usize>,
}

fn default_true() -> bool {
    true
}

fn default_ignored_files() -> Vec<String> {
    vec!["session.lock".to_string()]
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("./differential_backup")
}

fn default_overwrite_folder() -> String {
    "overwrite".to_string()
}

fn default_server_path() -> PathBuf {
    PathBuf::from("./server")
}

fn default_world_name() -> String {
    "world".to_string()
}

fn default_interval_minutes() -> f64 {
    30.0
}

fn default_saving_timeout_secs() -> u64 {
    60
}

fn default_restore_countdown_secs() -> u64 {
    10
}

fn default_join_backup_delay_secs() -> u64 {
    3
}

fn default_slot_tiers() -> Vec<usize> {
    vec![5]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            turn_off_auto_save: default_true(),
            ignored_files: default_ignored_files(),
            backup_path: default_backup_path(),
            overwrite_folder: default_overwrite_folder(),
            server_path: default_server_path(),
            world_name: default_world_name(),
            interval_minutes: default_interval_minutes(),
            saving_timeout_secs: default_saving_timeout_secs(),
            restore_countdown_secs: default_restore_countdown_secs(),
            join_backup_delay_secs: default_join_backup_delay_secs(),
            auto_merge: false,
            slot_tiers: default_slot_tiers(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig =
            toml::from_str(&content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.slot_tiers.is_empty() {
            return Err(BackupError::Config("slot_tiers must list at least one tier".into()));
        }
        if self.slot_tiers.iter().any(|&c| c == 0) {
            return Err(BackupError::Config("slot tier capacity must be at least 1".into()));
        }
        if !(self.interval_minutes.is_finite() && self.interval_minutes > 0.0) {
            return Err(BackupError::Config("interval_minutes must be a positive number".into()));
        }
        let total = self
            .slot_tiers
            .iter()
            .try_fold(0u32, |sum, &c| u32::try_from(c).ok().and_then(|c| sum.checked_add(c)));
        if total.map_or(true, |t| t == u32::MAX) {
            return Err(BackupError::Config("slot_tiers hold more slots than slot IDs can number".into()));
        }
        if self.world_name.is_empty() || self.overwrite_folder.is_empty() {
            return Err(BackupError::Config("world_name and overwrite_folder must not be empty".into()));
        }
        Ok(())
    }

    /// Live world directory
    pub fn world_dir(&self) -> PathBuf {
        self.server_path.join(&self.world_name)
    }

    pub fn overwrite_dir(&self) -> PathBuf {
        self.backup_path.join(&self.overwrite_folder)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_minutes * 60.0)
    }

    pub fn saving_timeout(&self) -> Duration {
        Duration::from_secs(self.saving_timeout_secs)
    }

    pub fn join_backup_delay(&self) -> Duration {
        Duration::from_secs(self.join_backup_delay_secs)
    }

    /// Total number of rotating slots across all tiers
    pub fn total_slots(&self) -> usize {
        self.slot_tiers.iter().sum()
    }
}
