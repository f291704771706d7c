//! Failure-safe restore
//!
//! A restore is a small state machine:
//!
//! ```text
//! STARTED ─► SAFETY_SNAPSHOT_TAKEN ─► APPLYING ─► VALIDATING ─► SUCCEEDED
//!                                        │             │
//!                                        └─────────────┴─► ROLLED_BACK
//! ```
//!
//! 1. **Started**: the source archive is verified. A failure returns
//!    [`BackupError::InvalidBackup`] before anything is touched.
//! 2. **Safety snapshot**: a FULL backup of the current live state is taken
//!    through [`SafetySnapshot`]. If it cannot be written the restore aborts.
//! 3. **Applying**: the streams selected by the scope are written over live
//!    state. Before a file is overwritten it is copied aside into the restore
//!    journal; files and directories that did not exist are recorded. Each
//!    file is extracted to a temp file next to its target and renamed into
//!    place. The database's `-wal`/`-shm` companions are stashed and removed
//!    so SQLite cannot replay a stale log over the restored file.
//! 4. **Validating**: `PRAGMA integrity_check` on the restored database.
//! 5. **Succeeded**: the journal is discarded and signature records are handed
//!    to the signature store. **Rolled back**: the journal is replayed in
//!    reverse, restoring every stashed file and removing created ones.
//!
//! The safety archive is kept whatever the outcome.

use crate::archive::ArchiveReader;
use crate::config::{SourceLayout, TreeCategory};
use crate::error::{BackupError, Result};
use crate::manifest::BackupManifest;
use crate::snapshot::{locate, SignatureDocument, SignatureRecord, SignatureStore, StreamCategory, StreamTarget};
use crate::types::{BackupHook, CancellationToken, RestoreOutcome, RestoreReport, RestoreScope, RestoreState};
use crate::utils;
use crate::verification::IntegrityVerifier;
use rusqlite::{Connection, OpenFlags};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

/// SQLite companion files that must not survive a database restore
const DATABASE_COMPANIONS: &[&str] = &["-wal", "-shm", "-journal"];

/// Takes the pre-restore FULL backup
pub trait SafetySnapshot {
    /// Write a FULL backup of the live state
    ///
    /// `restore_source` must survive any retention this triggers.
    fn take_safety_snapshot(&self, restore_source: &Path) -> Result<PathBuf>;
}

/// Whether a stream category is applied under a scope
pub fn in_scope(scope: RestoreScope, category: StreamCategory) -> bool {
    match scope {
        RestoreScope::Full => category != StreamCategory::Log,
        RestoreScope::Data => matches!(category, StreamCategory::Database | StreamCategory::Signatures),
        RestoreScope::Config => matches!(
            category,
            StreamCategory::ConfigFile | StreamCategory::Tree(TreeCategory::Config) | StreamCategory::Tree(TreeCategory::Code)
        ),
    }
}

/// Ephemeral state of one restore
#[derive(Debug)]
pub struct RestoreSession {
    /// Archive restored from
    pub source: PathBuf,
    /// Scope requested
    pub scope: RestoreScope,
    /// Pre-restore safety archive
    pub safety_backup: Option<PathBuf>,
    /// States visited
    pub states: Vec<RestoreState>,
    /// Non-fatal problems
    pub warnings: Vec<String>,
}

impl RestoreSession {
    fn new(source: &Path, scope: RestoreScope) -> Self {
        Self {
            source: source.to_path_buf(),
            scope,
            safety_backup: None,
            states: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn enter(&mut self, state: RestoreState) {
        debug!("Restore of {:?} entering {:?}", self.source, state);
        self.states.push(state);
    }
}

#[derive(Debug)]
enum JournalEntry {
    Replaced { target: PathBuf, stash: PathBuf },
    Created { target: PathBuf },
    Removed { target: PathBuf, stash: PathBuf },
    CreatedDir(PathBuf),
}

/// Undo log for the live files a restore touches
#[derive(Debug)]
struct RestoreJournal {
    staging: TempDir,
    entries: Vec<JournalEntry>,
    stashed: usize,
}

impl RestoreJournal {
    fn begin(dir: &Path) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(".restore-journal-")
            .tempdir_in(dir)?;
        Ok(Self {
            staging,
            entries: Vec::new(),
            stashed: 0,
        })
    }

    fn stash(&mut self, target: &Path) -> Result<PathBuf> {
        self.stashed += 1;
        let stash = self.staging.path().join(format!("{:06}", self.stashed));
        fs::copy(target, &stash)?;
        Ok(stash)
    }

    /// Record a file about to be written
    ///
    /// Only regular files are replaced. A directory, symlink or other
    /// special file at `target` fails the write before anything is recorded.
    fn before_write(&mut self, target: &Path) -> Result<()> {
        let existing = match fs::symlink_metadata(target) {
            Ok(metadata) if metadata.file_type().is_file() => true,
            Ok(metadata) => {
                return Err(BackupError::InvalidPath(format!(
                    "{:?} is not a regular file ({})",
                    target,
                    describe_file_type(&metadata.file_type())
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = target.parent() {
            self.create_parents(parent)?;
        }
        if existing {
            let stash = self.stash(target)?;
            self.entries.push(JournalEntry::Replaced {
                target: target.to_path_buf(),
                stash,
            });
        } else {
            self.entries.push(JournalEntry::Created {
                target: target.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Stash and delete a file
    fn remove(&mut self, target: &Path) -> Result<()> {
        if !target.is_file() {
            return Ok(());
        }
        let stash = self.stash(target)?;
        fs::remove_file(target)?;
        self.entries.push(JournalEntry::Removed {
            target: target.to_path_buf(),
            stash,
        });
        Ok(())
    }

    fn create_parents(&mut self, dir: &Path) -> Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(d) = current {
            if d.exists() {
                break;
            }
            missing.push(d.to_path_buf());
            current = d.parent();
        }
        for d in missing.into_iter().rev() {
            fs::create_dir(&d)?;
            self.entries.push(JournalEntry::CreatedDir(d));
        }
        Ok(())
    }

    /// Replay in reverse; returns the problems met
    fn rollback(self) -> Vec<String> {
        let mut problems = Vec::new();
        for entry in self.entries.iter().rev() {
            let result = match entry {
                JournalEntry::Replaced { target, stash } | JournalEntry::Removed { target, stash } => {
                    put_back(stash, target)
                }
                JournalEntry::Created { target } => utils::remove_file_if_exists(target).map(|_| ()),
                JournalEntry::CreatedDir(dir) => fs::remove_dir(dir).or_else(|e| match e.kind() {
                    io::ErrorKind::NotFound => Ok(()),
                    _ => Err(e),
                }).map_err(BackupError::from),
            };
            if let Err(e) = result {
                error!("Rollback step {:?} failed: {}", entry, e);
                problems.push(format!("{:?}: {}", entry, e));
            }
        }
        problems
    }
}

/// Copy a stashed file back over its target atomically
fn put_back(stash: &Path, target: &Path) -> Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| BackupError::InvalidPath(format!("{:?} has no parent", target)))?;
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::Builder::new().prefix(".restore-").tempfile_in(parent)?;
    io::copy(&mut File::open(stash)?, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Run SQLite's consistency check on a database file
///
/// # Errors
///
/// - [`BackupError::ValidationFailed`] if the file cannot be opened as a
///   database or the check reports problems
pub fn validate_database(path: &Path) -> Result<()> {
    let check = || -> rusqlite::Result<String> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.query_row("PRAGMA integrity_check", [], |r| r.get::<_, String>(0))
    };
    match check() {
        Ok(result) if result.eq_ignore_ascii_case("ok") => Ok(()),
        Ok(result) => Err(BackupError::ValidationFailed(result)),
        Err(e) => Err(BackupError::ValidationFailed(e.to_string())),
    }
}

/// What an apply wrote
#[derive(Debug, Default)]
struct Applied {
    files: usize,
    bytes: u64,
    database: Option<PathBuf>,
    signatures: Option<Vec<SignatureRecord>>,
}

/// Drives one restore from verification to commit or rollback
pub struct RestoreCoordinator<'a> {
    layout: &'a SourceLayout,
    verifier: &'a IntegrityVerifier,
    signatures: &'a dyn SignatureStore,
    hook: &'a dyn BackupHook,
    staging_dir: &'a Path,
    cancel: &'a CancellationToken,
}

impl<'a> RestoreCoordinator<'a> {
    /// Create a coordinator
    ///
    /// # Arguments
    ///
    /// * `layout` - Live locations to restore into
    /// * `verifier` - Verifier for the source archive
    /// * `signatures` - Receives restored signature records
    /// * `hook` - Called before each stream is applied
    /// * `staging_dir` - Directory for the restore journal
    /// * `cancel` - Checked before each stream
    pub fn new(
        layout: &'a SourceLayout,
        verifier: &'a IntegrityVerifier,
        signatures: &'a dyn SignatureStore,
        hook: &'a dyn BackupHook,
        staging_dir: &'a Path,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            layout,
            verifier,
            signatures,
            hook,
            staging_dir,
            cancel,
        }
    }

    /// Streams of a manifest applied under a scope, in archive order
    pub fn plan(&self, manifest: &BackupManifest, scope: RestoreScope) -> (Vec<(String, StreamTarget)>, Vec<String>) {
        let mut selected = Vec::new();
        let mut warnings = Vec::new();
        for entry in &manifest.streams {
            match locate(self.layout, &entry.name) {
                Some(target) if in_scope(scope, target.category) => selected.push((entry.name.clone(), target)),
                Some(_) => {}
                None => {
                    warn!("Stream {} has no live location, not restored", entry.name);
                    warnings.push(format!("stream '{}' has no live location", entry.name));
                }
            }
        }
        (selected, warnings)
    }

    /// Restore `source` under `scope`
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidBackup`] if the source fails verification
    /// - [`BackupError::SafetySnapshotFailed`] if the safety backup fails
    ///
    /// Failures after the safety snapshot are rolled back and reported in the
    /// returned report's outcome rather than as errors.
    pub fn restore(&self, source: &Path, scope: RestoreScope, safety: &dyn SafetySnapshot) -> Result<RestoreReport> {
        let start = Instant::now();
        let mut session = RestoreSession::new(source, scope);
        session.enter(RestoreState::Started);

        let verification = self.verifier.verify(source, false)?.into_result()?;
        let manifest = verification
            .manifest
            .ok_or_else(|| BackupError::internal("verified archive carries no manifest"))?;
        let (plan, warnings) = self.plan(&manifest, scope);
        session.warnings.extend(warnings);
        info!(
            "Restoring {} of {} streams from {:?} ({})",
            plan.len(),
            manifest.streams.len(),
            source,
            scope
        );

        let safety_path = safety
            .take_safety_snapshot(source)
            .map_err(|e| BackupError::SafetySnapshotFailed(e.to_string()))?;
        session.safety_backup = Some(safety_path);
        session.enter(RestoreState::SafetySnapshotTaken);

        let mut reader = ArchiveReader::open(source)?;
        let mut journal = RestoreJournal::begin(self.staging_dir)?;
        session.enter(RestoreState::Applying);

        let mut applied = Applied::default();
        let mut failure = None;
        let mut outcome = RestoreOutcome::Succeeded;

        if let Err(e) = self.apply(&mut reader, &plan, &mut journal, &mut applied) {
            error!("Restore apply failed: {}", e);
            failure = Some(e.to_string());
            outcome = RestoreOutcome::FailedRolledBack;
        } else if let Some(database) = &applied.database {
            session.enter(RestoreState::Validating);
            if let Err(e) = validate_database(database) {
                error!("Restored database failed validation: {}", e);
                failure = Some(e.to_string());
                outcome = RestoreOutcome::FailedValidation;
            }
        }

        let mut rollback_errors = Vec::new();
        let mut signatures_imported = false;
        if outcome == RestoreOutcome::Succeeded {
            drop(journal);
            session.enter(RestoreState::Succeeded);
            if let Some(records) = &applied.signatures {
                match self.signatures.import_signatures(records) {
                    Ok(count) => {
                        debug!("Imported {} signature records", count);
                        signatures_imported = true;
                    }
                    Err(e) => {
                        warn!("Signature records not imported: {}", e);
                        session.warnings.push(format!("signatures not imported: {}", e));
                    }
                }
            }
            info!("Restore from {:?} succeeded: {} files", source, applied.files);
        } else {
            rollback_errors = journal.rollback();
            session.enter(RestoreState::RolledBack);
            warn!(
                "Restore from {:?} rolled back ({} rollback problems)",
                source,
                rollback_errors.len()
            );
        }

        let report = RestoreReport {
            source: session.source,
            scope,
            safety_backup: session.safety_backup,
            outcome,
            states: session.states,
            files_restored: if outcome == RestoreOutcome::Succeeded { applied.files } else { 0 },
            bytes_written: applied.bytes,
            signatures_imported,
            failure,
            rollback_errors,
            warnings: session.warnings,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if let Err(e) = self.hook.after_restore(&report) {
            warn!("after_restore hook failed: {}", e);
        }
        Ok(report)
    }

    fn apply(
        &self,
        reader: &mut ArchiveReader,
        plan: &[(String, StreamTarget)],
        journal: &mut RestoreJournal,
        applied: &mut Applied,
    ) -> Result<()> {
        for (name, target) in plan {
            self.cancel.check()?;
            self.hook.before_stream_apply(name)?;

            if target.category == StreamCategory::Signatures {
                let data = reader.read_entry(name)?;
                let document: SignatureDocument = serde_json::from_slice(&data)?;
                applied.signatures = Some(document.signatures);
                continue;
            }
            let Some(path) = &target.path else {
                continue;
            };

            if target.category == StreamCategory::Database {
                for suffix in DATABASE_COMPANIONS {
                    let mut companion = path.clone().into_os_string();
                    companion.push(suffix);
                    journal.remove(Path::new(&companion))?;
                }
                applied.database = Some(path.clone());
            }

            journal.before_write(path)?;
            let written = write_entry(reader, name, path)?;
            debug!("Restored {} -> {:?} ({} bytes)", name, path, written);
            applied.files += 1;
            applied.bytes += written;
        }
        Ok(())
    }
}

fn describe_file_type(file_type: &fs::FileType) -> &'static str {
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else {
        "special file"
    }
}

/// Extract an entry next to its target and rename it into place
fn write_entry(reader: &mut ArchiveReader, name: &str, target: &Path) -> Result<u64> {
    let parent = target
        .parent()
        .ok_or_else(|| BackupError::InvalidPath(format!("{:?} has no parent", target)))?;
    let mut temp = tempfile::Builder::new().prefix(".restore-").tempfile_in(parent)?;
    let written = reader.copy_entry(name, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(written)
}
