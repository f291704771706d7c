//! Core data types used throughout backstop
//!
//! This module contains the data structures shared between the snapshot,
//! archive, restore and manager layers.
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Backups**: `BackupKind`, `BackupInfo`, `CreatedBackup`, `VerificationStatus`
//! - **Restores**: `RestoreScope`, `RestoreState`, `RestoreOutcome`, `RestoreReport`
//! - **Reporting**: `OperationReport`, `BackupStatistics`, `HealthReport`
//! - **Control**: `CancellationToken`
//! - **Hooks**: `BackupHook` - extensibility points around create and restore
//!
//! ## Examples
//!
//! ```rust
//! use backstop::types::{BackupKind, RestoreScope};
//!
//! let kind: BackupKind = "incremental".parse().unwrap();
//! assert_eq!(kind, BackupKind::Incremental);
//! assert_eq!(kind.as_str(), "INCREMENTAL");
//! assert_eq!(kind.file_tag(), "incremental");
//!
//! assert!(RestoreScope::Data.includes_database());
//! assert!(!RestoreScope::Config.includes_database());
//! ```

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a backup captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupKind {
    /// Database, config files, every tree, signatures, optional artifacts and logs
    Full,
    /// Database plus files modified since the newest FULL backup
    Incremental,
    /// Database and signature records
    Data,
    /// Config files and the config/code trees
    Config,
}

impl BackupKind {
    /// Upper-case label used in manifests and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "FULL",
            BackupKind::Incremental => "INCREMENTAL",
            BackupKind::Data => "DATA",
            BackupKind::Config => "CONFIG",
        }
    }

    /// Lower-case tag used in archive file names
    pub fn file_tag(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
            BackupKind::Data => "data",
            BackupKind::Config => "config",
        }
    }

    /// Whether the kind carries the database stream
    pub fn includes_database(&self) -> bool {
        !matches!(self, BackupKind::Config)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" => Ok(BackupKind::Full),
            "INCREMENTAL" => Ok(BackupKind::Incremental),
            "DATA" => Ok(BackupKind::Data),
            "CONFIG" => Ok(BackupKind::Config),
            other => Err(BackupError::InvalidConfiguration(format!(
                "unknown backup kind '{}'",
                other
            ))),
        }
    }
}

/// Which part of a backup a restore applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestoreScope {
    /// Everything in the archive except logs
    Full,
    /// Database and signature records
    Data,
    /// Config files and the config/code trees
    Config,
}

impl RestoreScope {
    /// Upper-case label
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreScope::Full => "FULL",
            RestoreScope::Data => "DATA",
            RestoreScope::Config => "CONFIG",
        }
    }

    /// Whether the database stream is applied under this scope
    pub fn includes_database(&self) -> bool {
        matches!(self, RestoreScope::Full | RestoreScope::Data)
    }
}

impl fmt::Display for RestoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreScope {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FULL" | "COMPLETE" => Ok(RestoreScope::Full),
            "DATA" => Ok(RestoreScope::Data),
            "CONFIG" => Ok(RestoreScope::Config),
            other => Err(BackupError::InvalidConfiguration(format!(
                "unknown restore scope '{}'",
                other
            ))),
        }
    }
}

/// Result of the last verification of an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum VerificationStatus {
    /// All checks passed
    Verified,
    /// A check failed
    Failed(String),
    /// Not verified in this listing
    Unchecked,
}

/// One archive in the backup directory
///
/// Built from the file itself and its embedded manifest. When the manifest
/// cannot be read the entry is still listed with `kind = None` and the file
/// modification time as `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    /// File name, unique inside the backup directory
    pub id: String,
    /// Absolute path of the archive
    pub path: PathBuf,
    /// Kind recorded in the manifest
    pub kind: Option<BackupKind>,
    /// Manifest timestamp (or file mtime for degraded entries)
    pub created_at: DateTime<Utc>,
    /// Archive size on disk
    pub size_bytes: u64,
    /// Whole-archive SHA-256 from the sidecar, if recorded
    pub checksum: Option<String>,
    /// Number of streams listed in the manifest
    pub stream_count: usize,
    /// Verification state for this listing
    pub verification: VerificationStatus,
}

impl BackupInfo {
    /// Kind label, `UNKNOWN` when the manifest was unreadable
    pub fn kind_label(&self) -> &'static str {
        self.kind.map(|k| k.as_str()).unwrap_or("UNKNOWN")
    }
}

/// Result of a successful `create_backup`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedBackup {
    /// The new archive
    pub info: BackupInfo,
    /// Kind the caller asked for
    pub requested_kind: BackupKind,
    /// Whether an INCREMENTAL request was performed as FULL
    pub fell_back_to_full: bool,
    /// Streams written, manifest excluded
    pub streams_written: usize,
    /// Uncompressed payload bytes
    pub bytes_captured: u64,
    /// Non-critical streams left out, with the reason
    pub skipped: Vec<String>,
    /// Archives removed by retention after this backup
    pub evicted: Vec<PathBuf>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

/// States a restore session passes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreState {
    /// Source accepted for restore
    Started,
    /// Pre-restore FULL backup written
    SafetySnapshotTaken,
    /// Streams being written over live state
    Applying,
    /// Restored database under consistency check
    Validating,
    /// Restore committed
    Succeeded,
    /// Live state put back from the journal
    RolledBack,
}

/// Terminal outcome of a restore session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestoreOutcome {
    /// Selected streams applied and validated
    Succeeded,
    /// Restored database failed its consistency check; live state rolled back
    FailedValidation,
    /// Apply failed part way; live state rolled back
    FailedRolledBack,
}

/// Report of a restore session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Archive restored from
    pub source: PathBuf,
    /// Scope requested
    pub scope: RestoreScope,
    /// Pre-restore safety archive (kept in every outcome)
    pub safety_backup: Option<PathBuf>,
    /// Terminal outcome
    pub outcome: RestoreOutcome,
    /// States visited, in order
    pub states: Vec<RestoreState>,
    /// Files written into live locations
    pub files_restored: usize,
    /// Bytes written into live locations
    pub bytes_written: u64,
    /// Whether signature records were handed back to the store
    pub signatures_imported: bool,
    /// Failure that triggered rollback
    pub failure: Option<String>,
    /// Problems met while rolling back
    pub rollback_errors: Vec<String>,
    /// Non-fatal problems
    pub warnings: Vec<String>,
    /// Time taken in milliseconds
    pub duration_ms: u64,
}

impl RestoreReport {
    /// Whether the restore committed
    pub fn is_success(&self) -> bool {
        self.outcome == RestoreOutcome::Succeeded
    }
}

/// Flat success/message pair for thin API layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
}

impl OperationReport {
    /// Successful report
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed report carrying the error's user message
    pub fn failed(error: &BackupError) -> Self {
        Self {
            success: false,
            message: error.user_message(),
        }
    }

    /// Build a report from any result
    pub fn from_result<T>(result: &Result<T>, describe: impl FnOnce(&T) -> String) -> Self {
        match result {
            Ok(value) => Self::ok(describe(value)),
            Err(e) => Self::failed(e),
        }
    }
}

impl From<&CreatedBackup> for OperationReport {
    fn from(created: &CreatedBackup) -> Self {
        Self::ok(format!("Backup created: {}", created.info.id))
    }
}

impl From<&RestoreReport> for OperationReport {
    fn from(report: &RestoreReport) -> Self {
        match report.outcome {
            RestoreOutcome::Succeeded => Self::ok(format!(
                "Restore completed: {} files from {}",
                report.files_restored,
                report.source.display()
            )),
            _ => Self {
                success: false,
                message: format!(
                    "Restore rolled back: {}",
                    report.failure.as_deref().unwrap_or("unknown failure")
                ),
            },
        }
    }
}

/// Shared cancellation flag
///
/// Checked between streams while an archive is written and while a restore
/// applies streams. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an un-cancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`BackupError::Cancelled`] once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BackupError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Aggregate numbers over the backup directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStatistics {
    /// Number of archives
    pub total_backups: usize,
    /// Sum of archive sizes
    pub total_size_bytes: u64,
    /// Archive count per kind label (`UNKNOWN` for unreadable manifests)
    pub by_kind: BTreeMap<String, usize>,
    /// Oldest archive timestamp
    pub oldest: Option<DateTime<Utc>>,
    /// Newest archive timestamp
    pub newest: Option<DateTime<Utc>>,
}

impl BackupStatistics {
    /// Compute statistics from a listing
    pub fn from_backups(backups: &[BackupInfo]) -> Self {
        let mut stats = Self::default();
        for backup in backups {
            stats.total_backups += 1;
            stats.total_size_bytes += backup.size_bytes;
            *stats.by_kind.entry(backup.kind_label().to_string()).or_insert(0) += 1;
            stats.oldest = Some(match stats.oldest {
                Some(t) if t <= backup.created_at => t,
                _ => backup.created_at,
            });
            stats.newest = Some(match stats.newest {
                Some(t) if t >= backup.created_at => t,
                _ => backup.created_at,
            });
        }
        stats
    }
}

/// Result of a health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// All checks passed
    pub healthy: bool,
    /// Backup directory exists
    pub backup_dir_exists: bool,
    /// A probe file could be created and removed in the backup directory
    pub backup_dir_writable: bool,
    /// Live database file exists
    pub database_present: bool,
    /// Configuration passed validation
    pub config_valid: bool,
    /// Free bytes on the backup directory's disk, when it could be read
    pub free_space_bytes: Option<u64>,
    /// Free space is at or above the configured minimum (or unknown)
    pub free_space_ok: bool,
    /// Archives currently in the directory
    pub backup_count: usize,
    /// One line per failed check
    pub issues: Vec<String>,
}

/// Hook trait for backup and restore operations
///
/// Allows extending the manager with custom behavior at key points of the
/// lifecycle. All methods have no-op defaults.
///
/// # Examples
///
/// ```rust
/// use backstop::types::{BackupHook, CreatedBackup};
/// use backstop::Result;
///
/// struct AuditHook;
///
/// impl BackupHook for AuditHook {
///     fn after_backup(&self, created: &CreatedBackup) -> Result<()> {
///         println!("backup {} written", created.info.id);
///         Ok(())
///     }
/// }
/// ```
pub trait BackupHook: Send + Sync {
    /// Called after an archive was written, verified and retention applied
    ///
    /// Errors are logged; the backup stands.
    fn after_backup(&self, _created: &CreatedBackup) -> Result<()> {
        Ok(())
    }

    /// Called before each stream is written over live state during a restore
    ///
    /// Returning an error aborts the apply and rolls the live state back.
    fn before_stream_apply(&self, _stream_name: &str) -> Result<()> {
        Ok(())
    }

    /// Called once a restore session reached its terminal outcome
    fn after_restore(&self, _report: &RestoreReport) -> Result<()> {
        Ok(())
    }
}

/// Default implementation of BackupHook that does nothing
#[derive(Debug)]
pub struct NoOpHook;

impl BackupHook for NoOpHook {}
