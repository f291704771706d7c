//! Error types for backstop
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants
//! follow the failure taxonomy operators care about: disk problems, corrupt
//! archives, an unavailable live database, a restored database that failed its
//! consistency check, and bad operator input (paths, names, configuration).
//!
//! Errors carry enough context to be shown verbatim; [`BackupError::user_message`]
//! adds a remediation hint for the common cases.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in backstop
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup and restore operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the zip container
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Errors raised by SQLite while snapshotting or validating the database
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Invalid glob pattern in the log selection
    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Archive failed its integrity checks
    #[error("Corrupt archive {path:?}: {reason}")]
    CorruptArchive {
        /// Archive that failed
        path: PathBuf,
        /// First failed check
        reason: String,
    },

    /// A restore was requested from an archive that did not verify
    #[error("Invalid backup {path:?}: {reason}")]
    InvalidBackup {
        /// Archive that was rejected
        path: PathBuf,
        /// Why verification failed
        reason: String,
    },

    /// The live database is missing or unreadable
    #[error("Database unavailable at {path:?}: {reason}")]
    DatabaseUnavailable {
        /// Configured database path
        path: PathBuf,
        /// Underlying cause
        reason: String,
    },

    /// Post-restore consistency check failed
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path does not name a managed backup
    #[error("Backup not found: {0:?}")]
    NotFound(PathBuf),

    /// Operator-supplied name or path is not acceptable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// An archive stream name is duplicated or reserved
    #[error("Invalid stream name: {0}")]
    InvalidStream(String),

    /// INCREMENTAL requested but no FULL backup exists to compare against
    #[error("No FULL backup available as incremental baseline")]
    NoBaseline,

    /// Another create/restore holds the backup directory
    #[error("Lock acquisition timeout")]
    LockTimeout,

    /// Caller cancelled the operation at a stream boundary
    #[error("Operation cancelled")]
    Cancelled,

    /// The pre-restore safety backup could not be created
    #[error("Safety snapshot failed: {0}")]
    SafetySnapshotFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Create a corrupt-archive error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        BackupError::CorruptArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is recoverable by retrying later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BackupError::LockTimeout | BackupError::Cancelled)
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            BackupError::CorruptArchive { .. }
                | BackupError::InvalidBackup { .. }
                | BackupError::ValidationFailed(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::NotFound(path) => {
                format!("Backup {:?} not found. Use 'list' to see available backups.", path)
            }
            BackupError::DatabaseUnavailable { path, .. } => {
                format!("Database {:?} is not available. Check the configured database path.", path)
            }
            BackupError::InvalidBackup { path, reason } => {
                format!("Backup {:?} cannot be restored ({}). Pick another backup or delete this one.", path, reason)
            }
            BackupError::LockTimeout => {
                "Another backup or restore is in progress. Try again later.".to_string()
            }
            BackupError::NoBaseline => {
                "No FULL backup exists yet. Create a FULL backup before an INCREMENTAL one.".to_string()
            }
            _ => self.to_string(),
        }
    }
}
