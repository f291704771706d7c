//! Public surface of the backup subsystem
//!
//! [`BackupManager`] owns one backup directory. It is the only component that
//! writes or deletes archives there, and it serializes create, restore and
//! delete behind one lock so a scheduled backup can never interleave with an
//! operator's restore. Listing takes no lock.
//!
//! ## Example
//!
//! ```rust,no_run
//! use backstop::{BackupKind, BackupManager, RestoreScope, SourceLayout, TreeCategory};
//! use std::sync::Arc;
//!
//! # fn main() -> backstop::Result<()> {
//! let layout = SourceLayout::new("/srv/app", "instance/app.db")
//!     .with_config_file("config.json")
//!     .with_tree("templates", "templates", TreeCategory::Assets);
//!
//! let manager = Arc::new(
//!     BackupManager::builder()
//!         .backup_dir("/srv/app/backups")
//!         .layout(layout)
//!         .build()?,
//! );
//!
//! let created = manager.create_backup(BackupKind::Full, None)?;
//! println!("wrote {}", created.info.id);
//!
//! let report = manager.restore_backup(&created.info.path, RestoreScope::Data)?;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Archive names
//!
//! `backup_<kind>_<YYYYMMDD_HHMMSS>.zip` in local time, or
//! `<hint>_<YYYYMMDD_HHMMSS>.zip` when a name hint is given. A clash appends
//! `_<n>` before the extension. Pre-restore safety archives use the hint
//! `pre_restore_backup`.

use crate::archive::{read_sidecar, sidecar_path, ArchiveCodec};
use crate::config::{BackupConfig, Settings, SourceLayout};
use crate::error::{BackupError, Result};
use crate::manifest::{BackupManifest, BaselineRef};
use crate::restore::{RestoreCoordinator, SafetySnapshot};
use crate::retention::{newest_first, RetentionPolicy, RetentionReport};
use crate::snapshot::{CaptureRequest, JsonFileSignatureStore, NoSignatureStore, SignatureStore, SnapshotSource};
use crate::types::{
    BackupHook, BackupInfo, BackupKind, BackupStatistics, CancellationToken, CreatedBackup, HealthReport,
    NoOpHook, RestoreReport, RestoreScope, VerificationStatus,
};
use crate::utils;
use crate::verification::{IntegrityVerifier, VerificationReport};
use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Name hint of pre-restore safety archives
pub const SAFETY_NAME_HINT: &str = "pre_restore_backup";

/// Archive file extension
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Options for one archive creation
struct CreateRequest<'r> {
    kind: BackupKind,
    name_hint: Option<&'r str>,
    allow_missing_database: bool,
    protected: &'r [PathBuf],
    cancel: &'r CancellationToken,
}

/// Backup and restore manager for one application
pub struct BackupManager {
    backup_dir: PathBuf,
    layout: SourceLayout,
    config: BackupConfig,
    signatures: Arc<dyn SignatureStore>,
    hook: Arc<dyn BackupHook>,
    codec: ArchiveCodec,
    verifier: IntegrityVerifier,
    lock: Mutex<()>,
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("backup_dir", &self.backup_dir)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .finish()
    }
}

impl BackupManager {
    /// Start building a manager
    pub fn builder() -> BackupManagerBuilder {
        BackupManagerBuilder::new()
    }

    /// Build a manager from a settings file's contents
    ///
    /// A configured `signatures_file` becomes the signature store.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut builder = BackupManagerBuilder::new()
            .backup_dir(settings.layout.resolve(&settings.backup_dir))
            .layout(settings.layout.clone())
            .config(settings.backup.clone());
        if let Some(file) = &settings.signatures_file {
            builder = builder.signature_store(Arc::new(JsonFileSignatureStore::new(settings.layout.resolve(file))));
        }
        builder.build()
    }

    /// Managed backup directory
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Engine configuration
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Source layout
    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    fn acquire_lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .try_lock_for(self.config.lock_timeout())
            .ok_or(BackupError::LockTimeout)
    }

    /// Create a backup
    ///
    /// # Arguments
    ///
    /// * `kind` - What to capture
    /// * `name_hint` - Optional file name prefix (`[A-Za-z0-9_-]+`)
    ///
    /// # Returns
    ///
    /// The new archive, already verified, with the archives retention evicted.
    ///
    /// # Errors
    ///
    /// - [`BackupError::LockTimeout`] if another operation holds the directory
    /// - [`BackupError::DatabaseUnavailable`] if the database cannot be read
    /// - [`BackupError::NoBaseline`] for INCREMENTAL without a FULL backup when
    ///   fallback is disabled
    /// - [`BackupError::CorruptArchive`] if the written archive fails
    ///   verification (it is deleted)
    #[instrument(skip(self))]
    pub fn create_backup(&self, kind: BackupKind, name_hint: Option<&str>) -> Result<CreatedBackup> {
        self.create_backup_cancellable(kind, name_hint, &CancellationToken::new())
    }

    /// [`create_backup`](Self::create_backup) with a cancellation token
    pub fn create_backup_cancellable(
        &self,
        kind: BackupKind,
        name_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CreatedBackup> {
        let _guard = self.acquire_lock()?;
        let created = self
            .create_locked(CreateRequest {
                kind,
                name_hint,
                allow_missing_database: false,
                protected: &[],
                cancel,
            })
            .inspect_err(|e| error!("Backup ({}) failed: {}", kind, e))?;

        if let Err(e) = self.hook.after_backup(&created) {
            warn!("after_backup hook failed: {}", e);
        }
        Ok(created)
    }

    fn create_locked(&self, request: CreateRequest<'_>) -> Result<CreatedBackup> {
        let start = Instant::now();
        let now = Utc::now();

        let (kind, baseline, fell_back) = self.resolve_kind(request.kind)?;
        let dest = self.unique_archive_path(request.name_hint, kind, now)?;
        info!("Creating {} backup {:?}", kind, dest);

        let source = SnapshotSource::new(&self.layout, &self.config, self.signatures.as_ref(), &self.backup_dir);
        let captured = source.capture(CaptureRequest {
            kind,
            since: baseline.as_ref().map(|b| b.timestamp),
            allow_missing_database: request.allow_missing_database,
        })?;

        let mut manifest = BackupManifest::new(kind, now);
        if fell_back {
            manifest.requested_kind = Some(request.kind);
        }
        manifest.system = self.config.system_name.clone();
        manifest.baseline = baseline;
        manifest.skipped = captured.skipped;

        let summary = self.codec.write(&dest, captured.streams, manifest, request.cancel)?;

        let report = self.verifier.verify(&summary.path, true)?;
        if !report.is_valid() {
            let reason = report.reason.unwrap_or_else(|| "verification failed".to_string());
            error!("Fresh archive {:?} failed verification: {}", summary.path, reason);
            self.remove_archive(&summary.path)?;
            return Err(BackupError::corrupt(&summary.path, reason));
        }

        let mut protected = vec![summary.path.clone()];
        protected.extend(request.protected.iter().cloned());
        let retention = self.enforce_retention(self.list_backups(), &protected);

        let id = file_name_of(&summary.path);
        info!(
            "Backup {} complete: {} streams, {}",
            id,
            summary.manifest.streams.len(),
            utils::format_bytes(summary.size_bytes)
        );
        Ok(CreatedBackup {
            info: BackupInfo {
                id,
                path: summary.path.clone(),
                kind: Some(kind),
                created_at: now,
                size_bytes: summary.size_bytes,
                checksum: Some(summary.checksum.clone()),
                stream_count: summary.manifest.streams.len(),
                verification: VerificationStatus::Verified,
            },
            requested_kind: request.kind,
            fell_back_to_full: fell_back,
            streams_written: summary.manifest.streams.len(),
            bytes_captured: summary.manifest.payload_bytes(),
            skipped: summary.manifest.skipped.clone(),
            evicted: retention.deleted,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Retention after a write; the new archive stands even if the listing failed
    fn enforce_retention(&self, listing: Result<Vec<BackupInfo>>, protected: &[PathBuf]) -> RetentionReport {
        match listing {
            Ok(existing) => RetentionPolicy::new(self.config.max_backups).apply(&existing, protected),
            Err(e) => {
                warn!("Retention skipped, backups could not be listed: {}", e);
                RetentionReport::default()
            }
        }
    }

    /// Effective kind, incremental baseline, and whether fallback happened
    fn resolve_kind(&self, requested: BackupKind) -> Result<(BackupKind, Option<BaselineRef>, bool)> {
        if requested != BackupKind::Incremental {
            return Ok((requested, None, false));
        }
        match self.find_baseline()? {
            Some(base) => {
                debug!("Incremental baseline is {}", base.id);
                Ok((
                    BackupKind::Incremental,
                    Some(BaselineRef {
                        id: base.id,
                        timestamp: base.created_at,
                    }),
                    false,
                ))
            }
            None if self.config.incremental_fallback_to_full => {
                info!("No FULL backup to compare against, performing FULL instead of INCREMENTAL");
                Ok((BackupKind::Full, None, true))
            }
            None => Err(BackupError::NoBaseline),
        }
    }

    /// Newest FULL archive by manifest timestamp, ties by greatest name
    pub fn find_baseline(&self) -> Result<Option<BackupInfo>> {
        let mut fulls: Vec<BackupInfo> = self
            .list_backups()?
            .into_iter()
            .filter(|b| b.kind == Some(BackupKind::Full))
            .collect();
        fulls.sort_by(newest_first);
        Ok(fulls.into_iter().next())
    }

    fn unique_archive_path(&self, name_hint: Option<&str>, kind: BackupKind, now: DateTime<Utc>) -> Result<PathBuf> {
        let prefix = match name_hint {
            Some(hint) => {
                validate_name_hint(hint)?;
                hint.to_string()
            }
            None => format!("backup_{}", kind.file_tag()),
        };
        let stamp = now.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", prefix, stamp);

        let mut candidate = self.backup_dir.join(format!("{}.{}", base, ARCHIVE_EXTENSION));
        let mut n = 1;
        while candidate.exists() || sidecar_path(&candidate).exists() {
            candidate = self.backup_dir.join(format!("{}_{}.{}", base, n, ARCHIVE_EXTENSION));
            n += 1;
        }
        Ok(candidate)
    }

    /// Restore from an archive
    ///
    /// A FULL safety backup of the live state is taken first and kept in
    /// every outcome. Failures while applying are rolled back and reported in
    /// the returned report.
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the archive does not exist
    /// - [`BackupError::InvalidBackup`] if it fails verification; nothing is
    ///   touched
    /// - [`BackupError::SafetySnapshotFailed`] if the safety backup fails
    /// - [`BackupError::LockTimeout`] if another operation holds the directory
    #[instrument(skip(self))]
    pub fn restore_backup(&self, path: &Path, scope: RestoreScope) -> Result<RestoreReport> {
        self.restore_backup_cancellable(path, scope, &CancellationToken::new())
    }

    /// [`restore_backup`](Self::restore_backup) with a cancellation token
    pub fn restore_backup_cancellable(
        &self,
        path: &Path,
        scope: RestoreScope,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let source = self.resolve_archive(path)?;
        let _guard = self.acquire_lock()?;

        let coordinator = RestoreCoordinator::new(
            &self.layout,
            &self.verifier,
            self.signatures.as_ref(),
            self.hook.as_ref(),
            &self.backup_dir,
            cancel,
        );
        let safety = SafetyWriter { manager: self, cancel };
        coordinator
            .restore(&source, scope, &safety)
            .inspect_err(|e| error!("Restore from {:?} failed: {}", source, e))
    }

    /// Archives in the backup directory, newest first
    ///
    /// Takes no lock. Hidden and temporary files are ignored; archives whose
    /// manifest cannot be read are listed with `kind = None`.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !is_archive_name(&path) || !entry.file_type()?.is_file() {
                continue;
            }
            match self.describe(&path) {
                Ok(info) => backups.push(info),
                // Removed between read_dir and describe
                Err(BackupError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
        backups.sort_by(newest_first);
        Ok(backups)
    }

    /// Like [`list_backups`](Self::list_backups), with every archive verified
    pub fn list_backups_verified(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = self.list_backups()?;
        for backup in &mut backups {
            backup.verification = match self.verifier.verify(&backup.path, false) {
                Ok(report) => report.status(),
                Err(e) => VerificationStatus::Failed(e.to_string()),
            };
        }
        Ok(backups)
    }

    fn describe(&self, path: &Path) -> Result<BackupInfo> {
        let metadata = fs::metadata(path)?;
        let modified: DateTime<Utc> = metadata.modified()?.into();
        let checksum = read_sidecar(path).ok().flatten();

        let (kind, created_at, stream_count) = match ArchiveCodec::read_manifest(path) {
            Ok(manifest) => (
                manifest.kind,
                manifest.timestamp.unwrap_or(modified),
                manifest.streams.len(),
            ),
            Err(e) => {
                debug!("Manifest of {:?} unreadable: {}", path, e);
                (None, modified, 0)
            }
        };

        Ok(BackupInfo {
            id: file_name_of(path),
            path: path.to_path_buf(),
            kind,
            created_at,
            size_bytes: metadata.len(),
            checksum,
            stream_count,
            verification: VerificationStatus::Unchecked,
        })
    }

    /// Delete a managed archive and its sidecar
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the path is outside the backup
    ///   directory, is not an archive, or does not exist
    #[instrument(skip(self))]
    pub fn delete_backup(&self, path: &Path) -> Result<()> {
        let archive = self.resolve_managed(path)?;
        let _guard = self.acquire_lock()?;
        self.remove_archive(&archive)?;
        info!("Deleted backup {:?}", archive);
        Ok(())
    }

    fn remove_archive(&self, archive: &Path) -> Result<()> {
        fs::remove_file(archive)?;
        utils::remove_file_if_exists(&sidecar_path(archive))?;
        Ok(())
    }

    /// Verify one archive
    pub fn verify_backup(&self, path: &Path) -> Result<VerificationReport> {
        let archive = self.resolve_archive(path)?;
        self.verifier.verify(&archive, false)
    }

    /// Counts and sizes over the backup directory
    pub fn statistics(&self) -> Result<BackupStatistics> {
        Ok(BackupStatistics::from_backups(&self.list_backups()?))
    }

    /// Probe the backup directory, database and configuration
    pub fn health_check(&self) -> HealthReport {
        let mut issues = Vec::new();

        let backup_dir_exists = self.backup_dir.is_dir();
        if !backup_dir_exists {
            issues.push(format!("backup directory {:?} does not exist", self.backup_dir));
        }

        let backup_dir_writable = backup_dir_exists
            && match tempfile::Builder::new().prefix(".health-").tempfile_in(&self.backup_dir) {
                Ok(_probe) => true,
                Err(e) => {
                    issues.push(format!("backup directory is not writable: {}", e));
                    false
                }
            };

        let free_space_bytes = if backup_dir_exists {
            utils::available_space(&self.backup_dir)
        } else {
            None
        };
        if free_space_bytes.is_none() && backup_dir_exists {
            warn!("Free space of {:?} could not be determined", self.backup_dir);
        }
        let free_space_ok = match free_space_shortfall(free_space_bytes, self.config.min_free_space_bytes) {
            Some(issue) => {
                issues.push(issue);
                false
            }
            None => true,
        };

        let database = self.layout.database();
        let database_present = database.is_file();
        if !database_present {
            issues.push(format!("database {:?} not found", database));
        }

        let config_valid = match self.config.validate().and_then(|_| self.layout.validate()) {
            Ok(()) => true,
            Err(e) => {
                issues.push(e.to_string());
                false
            }
        };

        let backup_count = match self.list_backups() {
            Ok(backups) => backups.len(),
            Err(e) => {
                issues.push(format!("backups cannot be listed: {}", e));
                0
            }
        };

        HealthReport {
            healthy: issues.is_empty(),
            backup_dir_exists,
            backup_dir_writable,
            database_present,
            config_valid,
            free_space_bytes,
            free_space_ok,
            backup_count,
            issues,
        }
    }

    /// An existing archive path, trying the backup directory for bare names
    fn resolve_archive(&self, path: &Path) -> Result<PathBuf> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        let in_dir = self.backup_dir.join(path);
        if path.is_relative() && in_dir.is_file() {
            return Ok(in_dir);
        }
        Err(BackupError::NotFound(path.to_path_buf()))
    }

    /// An existing archive directly inside the backup directory
    fn resolve_managed(&self, path: &Path) -> Result<PathBuf> {
        let not_found = || BackupError::NotFound(path.to_path_buf());
        let candidate = if path.is_relative() && path.parent().map_or(true, |p| p.as_os_str().is_empty()) {
            self.backup_dir.join(path)
        } else {
            path.to_path_buf()
        };
        if !is_archive_name(&candidate) || !candidate.is_file() {
            return Err(not_found());
        }
        let canonical = candidate.canonicalize().map_err(|_| not_found())?;
        let dir = self.backup_dir.canonicalize().map_err(|_| not_found())?;
        if canonical.parent() != Some(dir.as_path()) {
            return Err(not_found());
        }
        Ok(canonical)
    }

    /// [`create_backup`](Self::create_backup) on tokio's blocking pool
    pub async fn create_backup_async(
        self: &Arc<Self>,
        kind: BackupKind,
        name_hint: Option<String>,
    ) -> Result<CreatedBackup> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.create_backup(kind, name_hint.as_deref()))
            .await
            .map_err(|e| BackupError::internal(format!("backup task failed: {}", e)))?
    }

    /// [`restore_backup`](Self::restore_backup) on tokio's blocking pool
    pub async fn restore_backup_async(self: &Arc<Self>, path: PathBuf, scope: RestoreScope) -> Result<RestoreReport> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.restore_backup(&path, scope))
            .await
            .map_err(|e| BackupError::internal(format!("restore task failed: {}", e)))?
    }
}

/// Writes the pre-restore FULL backup while the restore holds the lock
struct SafetyWriter<'m> {
    manager: &'m BackupManager,
    cancel: &'m CancellationToken,
}

impl SafetySnapshot for SafetyWriter<'_> {
    fn take_safety_snapshot(&self, restore_source: &Path) -> Result<PathBuf> {
        let protected = [restore_source.to_path_buf()];
        let created = self.manager.create_locked(CreateRequest {
            kind: BackupKind::Full,
            name_hint: Some(SAFETY_NAME_HINT),
            allow_missing_database: true,
            protected: &protected,
            cancel: self.cancel,
        })?;
        info!("Safety backup {} written", created.info.id);
        Ok(created.info.path)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Issue line when `available` is known and below `minimum`
fn free_space_shortfall(available: Option<u64>, minimum: u64) -> Option<String> {
    match available {
        Some(free) if free < minimum => Some(format!(
            "only {} free on the backup disk, {} required",
            utils::format_bytes(free),
            utils::format_bytes(minimum)
        )),
        _ => None,
    }
}

/// Visible `.zip` file name
fn is_archive_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.') && path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

/// Name hints become file names, so only `[A-Za-z0-9_-]` is accepted
fn validate_name_hint(hint: &str) -> Result<()> {
    if hint.is_empty() || !hint.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(BackupError::InvalidPath(format!(
            "name hint '{}' may only contain letters, digits, '_' and '-'",
            hint
        )));
    }
    Ok(())
}

/// Fluent builder for [`BackupManager`]
pub struct BackupManagerBuilder {
    backup_dir: Option<PathBuf>,
    layout: SourceLayout,
    config: BackupConfig,
    signatures: Arc<dyn SignatureStore>,
    hook: Arc<dyn BackupHook>,
}

impl Default for BackupManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupManagerBuilder {
    /// Create a new builder with default settings
    ///
    /// # Examples
    ///
    /// ```rust
    /// use backstop::BackupManagerBuilder;
    ///
    /// let builder = BackupManagerBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            backup_dir: None,
            layout: SourceLayout::default(),
            config: BackupConfig::default(),
            signatures: Arc::new(NoSignatureStore),
            hook: Arc::new(NoOpHook),
        }
    }

    /// Set the backup directory (created on build)
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    /// Set where the application state lives
    pub fn layout(mut self, layout: SourceLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set engine tunables
    pub fn config(mut self, config: BackupConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signature record collaborator
    pub fn signature_store(mut self, store: Arc<dyn SignatureStore>) -> Self {
        self.signatures = store;
        self
    }

    /// Set lifecycle hooks
    pub fn hook(mut self, hook: Arc<dyn BackupHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidConfiguration`] for bad settings or a missing
    ///   backup directory setting
    /// - [`BackupError::Io`] if the backup directory cannot be created
    pub fn build(self) -> Result<BackupManager> {
        self.config.validate()?;
        self.layout.validate()?;
        let backup_dir = self
            .backup_dir
            .ok_or_else(|| BackupError::InvalidConfiguration("backup_dir must be set".to_string()))?;
        fs::create_dir_all(&backup_dir)?;
        debug!("Backup manager ready at {:?}", backup_dir);

        Ok(BackupManager {
            codec: ArchiveCodec::new(self.config.compression_level),
            verifier: IntegrityVerifier::new(self.config.deep_verify),
            backup_dir,
            layout: self.layout,
            config: self.config,
            signatures: self.signatures,
            hook: self.hook,
            lock: Mutex::new(()),
        })
    }
}
