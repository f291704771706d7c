//! Configuration for backup managers
//!
//! Three layers, all serde types with defaults for every optional key:
//!
//! - [`BackupConfig`]: tunables of the backup engine (retention, compression,
//!   optional streams, verification depth, lock timeout)
//! - [`SourceLayout`]: where the host application keeps the state to capture
//! - [`Settings`]: what the `backstop` binary reads from its JSON settings
//!   file, bundling the two above with the backup directory and schedule
//!
//! Unknown keys are ignored so older binaries can read newer files. Every
//! layer carries a `version` string.
//!
//! ```rust,no_run
//! use backstop::config::{BackupConfig, SourceLayout, TreeCategory};
//!
//! let config = BackupConfig {
//!     max_backups: 5,
//!     ..Default::default()
//! };
//! config.validate().unwrap();
//!
//! let layout = SourceLayout::new("/srv/app", "instance/app.db")
//!     .with_config_file("config.json")
//!     .with_tree("templates", "templates", TreeCategory::Assets)
//!     .with_tree("utils", "utils", TreeCategory::Code);
//! ```

use crate::error::{BackupError, Result};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Current configuration format version
pub const CONFIG_VERSION: &str = "1";

/// Stream prefixes that tree names may not use
pub const RESERVED_TREE_NAMES: &[&str] = &["config", "database", "signatures", "logs", "artifacts"];

/// Free space required by the health check (1 GiB)
pub const DEFAULT_MIN_FREE_SPACE: u64 = 1024 * 1024 * 1024;

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Format version of this configuration
    pub version: String,
    /// Archives kept by retention (at least 1)
    pub max_backups: usize,
    /// Deflate level, 0 (store) to 9
    pub compression_level: u32,
    /// Capture the generated artifacts directory in FULL backups
    pub include_generated_artifacts: bool,
    /// Capture log files in FULL backups
    pub include_logs: bool,
    /// Re-hash archive and streams during verification
    pub deep_verify: bool,
    /// Perform FULL when INCREMENTAL has no baseline
    pub incremental_fallback_to_full: bool,
    /// How long create/restore/delete wait for the directory lock
    pub lock_timeout_ms: u64,
    /// Application name recorded in manifests
    pub system_name: Option<String>,
    /// Free space the backup directory's disk must keep; 0 disables the check
    pub min_free_space_bytes: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            max_backups: 10,
            compression_level: 6,
            include_generated_artifacts: false,
            include_logs: true,
            deep_verify: true,
            incremental_fallback_to_full: true,
            lock_timeout_ms: 30_000,
            system_name: None,
            min_free_space_bytes: DEFAULT_MIN_FREE_SPACE,
        }
    }
}

impl BackupConfig {
    /// Check value ranges
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] naming the first bad field
    pub fn validate(&self) -> Result<()> {
        if self.max_backups == 0 {
            return Err(BackupError::InvalidConfiguration(
                "max_backups must be at least 1".to_string(),
            ));
        }
        if self.compression_level > 9 {
            return Err(BackupError::InvalidConfiguration(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    /// Lock timeout as a duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        utils::atomic_write(path, &data)
    }
}

/// Restore grouping of a tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeCategory {
    /// Configuration-like content, restored by CONFIG
    Config,
    /// Templates and static assets, FULL only
    Assets,
    /// Utility code, restored by CONFIG
    Code,
}

/// A named directory captured recursively
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRoot {
    /// Stream prefix, unique and not reserved
    pub name: String,
    /// Directory, relative to the app root unless absolute
    pub path: PathBuf,
    /// Restore grouping
    pub category: TreeCategory,
}

/// Where the host application keeps the state to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLayout {
    /// Base for every relative path below
    pub app_root: PathBuf,
    /// Live SQLite database file
    pub database_path: PathBuf,
    /// Individual configuration files
    pub config_files: Vec<PathBuf>,
    /// Recursively captured trees
    pub trees: Vec<TreeRoot>,
    /// Generated documents directory
    pub artifacts_dir: Option<PathBuf>,
    /// Glob patterns selecting log files, relative to the app root
    pub log_patterns: Vec<String>,
}

impl Default for SourceLayout {
    fn default() -> Self {
        Self {
            app_root: PathBuf::from("."),
            database_path: PathBuf::from("instance/app.db"),
            config_files: Vec::new(),
            trees: Vec::new(),
            artifacts_dir: None,
            log_patterns: vec!["logs/*.log".to_string()],
        }
    }
}

impl SourceLayout {
    /// Layout with an app root and database and nothing else
    pub fn new(app_root: impl Into<PathBuf>, database_path: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            database_path: database_path.into(),
            config_files: Vec::new(),
            trees: Vec::new(),
            artifacts_dir: None,
            log_patterns: Vec::new(),
        }
    }

    /// Add an individual config file
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_files.push(path.into());
        self
    }

    /// Add a tree
    pub fn with_tree(mut self, name: impl Into<String>, path: impl Into<PathBuf>, category: TreeCategory) -> Self {
        self.trees.push(TreeRoot {
            name: name.into(),
            path: path.into(),
            category,
        });
        self
    }

    /// Set the artifacts directory
    pub fn with_artifacts_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(path.into());
        self
    }

    /// Add a log glob
    pub fn with_log_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.log_patterns.push(pattern.into());
        self
    }

    /// Resolve a layout path against the app root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.app_root.join(path)
        }
    }

    /// Absolute database path
    pub fn database(&self) -> PathBuf {
        self.resolve(&self.database_path)
    }

    /// Look up a tree by stream prefix
    pub fn tree(&self, name: &str) -> Option<&TreeRoot> {
        self.trees.iter().find(|t| t.name == name)
    }

    /// Check names and paths
    ///
    /// Tree names must be single path segments, unique, and distinct from the
    /// reserved stream prefixes.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(BackupError::InvalidConfiguration(
                "database_path must be set".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for tree in &self.trees {
            let name = tree.name.as_str();
            if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
                return Err(BackupError::InvalidConfiguration(format!(
                    "tree name '{}' must be a single path segment",
                    name
                )));
            }
            if RESERVED_TREE_NAMES.contains(&name) {
                return Err(BackupError::InvalidConfiguration(format!(
                    "tree name '{}' is reserved",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(BackupError::InvalidConfiguration(format!(
                    "tree name '{}' is used twice",
                    name
                )));
            }
        }
        for pattern in &self.log_patterns {
            globset::Glob::new(pattern)?;
        }
        Ok(())
    }
}

/// Timer settings for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Whether scheduled backups run at all
    pub enabled: bool,
    /// Local time of the daily FULL backup, `HH:MM`
    pub daily_at: String,
    /// Hours between INCREMENTAL backups, none to disable
    pub incremental_every_hours: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_at: "02:00".to_string(),
            incremental_every_hours: Some(4),
        }
    }
}

impl ScheduleConfig {
    /// Parse `daily_at` into (hour, minute)
    pub fn daily_time(&self) -> Result<(u32, u32)> {
        parse_hh_mm(&self.daily_at)
    }

    /// Check the time format and interval
    pub fn validate(&self) -> Result<()> {
        self.daily_time()?;
        if self.incremental_every_hours == Some(0) {
            return Err(BackupError::InvalidConfiguration(
                "incremental_every_hours must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an `HH:MM` wall-clock time
pub fn parse_hh_mm(value: &str) -> Result<(u32, u32)> {
    let invalid = || BackupError::InvalidConfiguration(format!("'{}' is not a HH:MM time", value));
    let (h, m) = value.trim().split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

/// Settings file read by the `backstop` binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Format version
    pub version: String,
    /// Directory holding the archives
    pub backup_dir: PathBuf,
    /// Application state to capture
    pub layout: SourceLayout,
    /// Engine tunables
    pub backup: BackupConfig,
    /// Optional timer
    pub schedule: Option<ScheduleConfig>,
    /// JSON file standing in for the signature store
    pub signatures_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            backup_dir: PathBuf::from("backups"),
            layout: SourceLayout::default(),
            backup: BackupConfig::default(),
            schedule: None,
            signatures_file: None,
        }
    }
}

impl Settings {
    /// Load and validate a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let settings: Self = serde_json::from_slice(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save atomically as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        utils::atomic_write(path, &data)
    }

    /// Validate every layer
    pub fn validate(&self) -> Result<()> {
        self.backup.validate()?;
        self.layout.validate()?;
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}
