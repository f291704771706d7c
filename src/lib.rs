//! # Backstop - Backup and restore for application state
//!
//! Consistent, verifiable backups of an application's SQLite database,
//! configuration files and asset trees, with restores that never leave the
//! live state half-applied.
//!
//! ## Overview
//!
//! Backstop turns the state of one application into single-file archives and
//! back again. It lets you:
//! - Create FULL, INCREMENTAL, DATA or CONFIG backups as one ZIP archive each
//! - Verify an archive end to end (container, manifest, whole-file and
//!   per-stream SHA-256)
//! - Restore under a FULL, DATA or CONFIG scope, with a safety backup taken
//!   first and automatic rollback when anything fails
//! - Keep the newest N archives, never evicting one in use
//! - Run daily and periodic backups on a tokio timer
//!
//! ## Architecture
//!
//! - **SnapshotSource**: collects named byte streams from the live state. The
//!   database is copied through SQLite's online backup API so a writer in
//!   another connection cannot tear it.
//! - **ArchiveCodec**: writes streams plus a `backup_metadata.json` manifest
//!   into a temporary file, renames it into place and writes a `.sha256`
//!   sidecar.
//! - **IntegrityVerifier**: checks an archive without trusting it.
//! - **RestoreCoordinator**: journals every live file it replaces so the
//!   original bytes can be put back.
//! - **RetentionPolicy**: max-count eviction.
//! - **BackupManager**: the public surface; serializes operations per
//!   backup directory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backstop::{BackupKind, BackupManager, RestoreScope, SourceLayout};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = BackupManager::builder()
//!     .backup_dir("./backups")
//!     .layout(SourceLayout::new(".", "instance/app.db").with_config_file("config.json"))
//!     .build()?;
//!
//! let created = manager.create_backup(BackupKind::Full, None)?;
//! println!("Created backup: {}", created.info.id);
//!
//! for backup in manager.list_backups()? {
//!     println!("{} {} {}", backup.id, backup.kind_label(), backup.size_bytes);
//! }
//!
//! let report = manager.restore_backup(&created.info.path, RestoreScope::Full)?;
//! println!("Restored {} files", report.files_restored);
//! # Ok(())
//! # }
//! ```
//!
//! ### Verification
//!
//! ```rust,no_run
//! # use backstop::BackupManager;
//! # use std::path::Path;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let manager = BackupManager::builder().backup_dir("./backups").build()?;
//! let report = manager.verify_backup(Path::new("backup_full_20240310_020000.zip"))?;
//! if report.is_valid() {
//!     println!("Archive is valid");
//! } else {
//!     println!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```

// Public API modules
pub mod archive;
pub mod config;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::{ArchiveCodec, ArchiveReader, ArchiveSummary};
pub use config::{BackupConfig, ScheduleConfig, Settings, SourceLayout, TreeCategory, TreeRoot};
pub use error::{BackupError, Result};
pub use manager::{BackupManager, BackupManagerBuilder};
pub use manifest::{BackupManifest, StreamEntry};
pub use restore::{RestoreCoordinator, SafetySnapshot};
pub use retention::{RetentionPolicy, RetentionReport};
pub use scheduler::{next_daily_run, BackupScheduler, SchedulerState, SchedulerStatus};
pub use snapshot::{
    JsonFileSignatureStore, NoSignatureStore, SignatureRecord, SignatureStore, SnapshotSource, SnapshotStream,
};
pub use types::*;
pub use verification::{IntegrityVerifier, VerificationReport};
