//! Chaos tests for backstop
//!
//! Corrupts archives, feeds restores a database that is not one, and makes
//! restores fail part way, then checks that the live state was never left
//! half-applied.

use ::backstop::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

/// Application plus manager under test
pub struct ChaosApp {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub backup_dir: PathBuf,
}

impl ChaosApp {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("app");
        fs::create_dir_all(root.join("instance")).unwrap();
        fs::create_dir_all(root.join("templates")).unwrap();

        let conn = Connection::open(root.join("instance/app.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE exams (id INTEGER PRIMARY KEY, result TEXT);
             INSERT INTO exams (result) VALUES ('negative');",
        )
        .unwrap();
        drop(conn);
        fs::write(root.join("config.json"), br#"{"mode": "production"}"#).unwrap();
        fs::write(root.join("templates/base.html"), b"<html></html>").unwrap();

        let backup_dir = temp_dir.path().join("backups");
        Self {
            temp_dir,
            root,
            backup_dir,
        }
    }

    pub fn layout(&self) -> SourceLayout {
        SourceLayout::new(&self.root, "instance/app.db")
            .with_config_file("config.json")
            .with_tree("templates", "templates", TreeCategory::Assets)
    }

    pub fn manager(&self) -> BackupManager {
        self.manager_with_hook(Arc::new(NoOpHook))
    }

    pub fn manager_with_hook(&self, hook: Arc<dyn BackupHook>) -> BackupManager {
        BackupManager::builder()
            .backup_dir(&self.backup_dir)
            .layout(self.layout())
            .hook(hook)
            .build()
            .unwrap()
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("instance/app.db")
    }

    pub fn db_checksum(&self) -> String {
        utils::hash_file_content(&self.db_path()).unwrap()
    }

    pub fn mutate_database(&self) {
        let conn = Connection::open(self.db_path()).unwrap();
        conn.execute("UPDATE exams SET result = 'positive' WHERE id = 1", [])
            .unwrap();
    }
}

/// Overwrite `count` consecutive bytes in the middle of a file with noise
fn corrupt_bytes(path: &Path, count: usize, rng: &mut StdRng) {
    let mut data = fs::read(path).unwrap();
    let start = data.len() / 2 - count / 2;
    for byte in &mut data[start..start + count] {
        *byte ^= rng.random_range(1..=255u8);
    }
    fs::write(path, data).unwrap();
}

/// Hook failing on the first stream whose name starts with a prefix
struct FailOnStream {
    prefix: &'static str,
}

impl BackupHook for FailOnStream {
    fn before_stream_apply(&self, name: &str) -> Result<()> {
        if name.starts_with(self.prefix) {
            return Err(BackupError::internal(format!("injected failure on {}", name)));
        }
        Ok(())
    }
}

#[test]
fn test_corrupted_archive_is_rejected_untouched() {
    let app = ChaosApp::new();
    let manager = app.manager();
    let created = manager.create_backup(BackupKind::Full, None).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    corrupt_bytes(&created.info.path, 10, &mut rng);

    let report = manager.verify_backup(&created.info.path).unwrap();
    assert!(!report.is_valid());
    info!("Corruption detected: {}", report.summary());

    app.mutate_database();
    fs::write(app.root.join("config.json"), br#"{"mode": "debug"}"#).unwrap();
    let db_before = app.db_checksum();

    let result = manager.restore_backup(&created.info.path, RestoreScope::Full);
    assert!(matches!(result, Err(BackupError::InvalidBackup { .. })));

    // No safety archive, no live change
    assert_eq!(manager.list_backups().unwrap().len(), 1);
    assert_eq!(app.db_checksum(), db_before);
    assert_eq!(fs::read(app.root.join("config.json")).unwrap(), br#"{"mode": "debug"}"#);
}

#[test]
fn test_truncated_archive_fails_verification() {
    let app = ChaosApp::new();
    let manager = app.manager();
    let created = manager.create_backup(BackupKind::Full, None).unwrap();

    let data = fs::read(&created.info.path).unwrap();
    fs::write(&created.info.path, &data[..data.len() / 3]).unwrap();

    let listed = manager.list_backups_verified().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(matches!(listed[0].verification, VerificationStatus::Failed(_)));
}

#[test]
fn test_garbage_database_stream_rolls_back() {
    let app = ChaosApp::new();
    let manager = app.manager();

    let mut manifest = BackupManifest::new(BackupKind::Full, chrono::Utc::now());
    manifest.system = Some("chaos".to_string());
    let garbage = b"this is not a sqlite database ".repeat(200);
    let archive_path = app.backup_dir.join("backup_full_garbage.zip");
    ArchiveCodec::default()
        .write(
            &archive_path,
            vec![
                SnapshotStream::bytes("database/app.db", garbage),
                SnapshotStream::bytes("config/config.json", br#"{"mode": "restored"}"#.to_vec()),
            ],
            manifest,
            &CancellationToken::new(),
        )
        .unwrap();

    // The archive itself is intact
    assert!(manager.verify_backup(&archive_path).unwrap().is_valid());

    let db_before = app.db_checksum();
    let report = manager.restore_backup(&archive_path, RestoreScope::Full).unwrap();

    assert_eq!(report.outcome, RestoreOutcome::FailedValidation);
    assert!(report.failure.is_some());
    assert_eq!(report.states.last(), Some(&RestoreState::RolledBack));
    assert!(report.states.contains(&RestoreState::Validating));
    assert_eq!(report.files_restored, 0);

    assert_eq!(app.db_checksum(), db_before);
    assert_eq!(
        fs::read(app.root.join("config.json")).unwrap(),
        br#"{"mode": "production"}"#
    );
    assert!(report.safety_backup.unwrap().exists());
}

#[test]
fn test_hook_failure_mid_apply_rolls_back() {
    let app = ChaosApp::new();
    let manager = app.manager_with_hook(Arc::new(FailOnStream { prefix: "templates/" }));
    let created = manager.create_backup(BackupKind::Full, None).unwrap();

    app.mutate_database();
    fs::write(app.root.join("config.json"), br#"{"mode": "debug"}"#).unwrap();
    fs::write(app.root.join("templates/new.html"), b"<p>new</p>").unwrap();
    let db_before = app.db_checksum();

    let report = manager
        .restore_backup(&created.info.path, RestoreScope::Full)
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::FailedRolledBack);
    assert!(report.rollback_errors.is_empty(), "{:?}", report.rollback_errors);
    assert!(report.failure.unwrap().contains("injected failure"));

    // Database and config were written before the failing stream; both are back
    assert_eq!(app.db_checksum(), db_before);
    assert_eq!(fs::read(app.root.join("config.json")).unwrap(), br#"{"mode": "debug"}"#);
    assert!(app.root.join("templates/new.html").exists());
}

#[test]
fn test_cancelled_backup_leaves_nothing() {
    let app = ChaosApp::new();
    let manager = app.manager();
    let token = CancellationToken::new();
    token.cancel();

    let result = manager.create_backup_cancellable(BackupKind::Full, None, &token);
    assert!(matches!(result, Err(BackupError::Cancelled)));

    let leftovers: Vec<_> = fs::read_dir(&app.backup_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[test]
fn test_deleted_sidecar_still_verifies_with_warning() {
    let app = ChaosApp::new();
    let manager = app.manager();
    let created = manager.create_backup(BackupKind::Data, None).unwrap();
    fs::remove_file(archive::sidecar_path(&created.info.path)).unwrap();

    let report = manager.verify_backup(&created.info.path).unwrap();
    assert!(report.is_valid());
    assert!(!report.warnings.is_empty());

    let listed = manager.list_backups().unwrap();
    assert_eq!(listed[0].checksum, None);
}

/// Hook that trips a cancellation token when a stream is reached
struct CancelAtStream {
    prefix: &'static str,
    token: CancellationToken,
}

impl BackupHook for CancelAtStream {
    fn before_stream_apply(&self, name: &str) -> Result<()> {
        if name.starts_with(self.prefix) {
            self.token.cancel();
        }
        Ok(())
    }
}

#[test]
fn test_cancelled_restore_rolls_back() {
    let app = ChaosApp::new();
    let token = CancellationToken::new();
    let manager = app.manager_with_hook(Arc::new(CancelAtStream {
        prefix: "config/",
        token: token.clone(),
    }));
    let created = manager.create_backup(BackupKind::Full, None).unwrap();

    app.mutate_database();
    fs::write(app.root.join("config.json"), br#"{"mode": "debug"}"#).unwrap();
    let db_before = app.db_checksum();

    // The database and config streams are applied, then the token is seen
    let report = manager
        .restore_backup_cancellable(&created.info.path, RestoreScope::Full, &token)
        .unwrap();

    assert!(token.is_cancelled());
    assert_eq!(report.outcome, RestoreOutcome::FailedRolledBack);
    assert_eq!(report.states.last(), Some(&RestoreState::RolledBack));
    assert!(report.states.contains(&RestoreState::Applying));
    assert!(report.rollback_errors.is_empty(), "{:?}", report.rollback_errors);
    assert!(report.failure.unwrap().to_lowercase().contains("cancel"));
    assert_eq!(report.files_restored, 0);

    assert_eq!(app.db_checksum(), db_before);
    assert_eq!(fs::read(app.root.join("config.json")).unwrap(), br#"{"mode": "debug"}"#);
    assert!(report.safety_backup.unwrap().exists());
}

#[test]
fn test_directory_in_place_of_file_rolls_back_cleanly() {
    let app = ChaosApp::new();
    let manager = app.manager();
    let created = manager.create_backup(BackupKind::Full, None).unwrap();

    app.mutate_database();
    let db_before = app.db_checksum();
    fs::remove_file(app.root.join("config.json")).unwrap();
    fs::create_dir(app.root.join("config.json")).unwrap();
    fs::write(app.root.join("config.json/keep"), b"x").unwrap();

    let report = manager
        .restore_backup(&created.info.path, RestoreScope::Full)
        .unwrap();

    assert_eq!(report.outcome, RestoreOutcome::FailedRolledBack);
    assert!(report.rollback_errors.is_empty(), "{:?}", report.rollback_errors);
    assert!(report.failure.unwrap().contains("not a regular file"));

    assert_eq!(app.db_checksum(), db_before);
    assert!(app.root.join("config.json").is_dir());
    assert_eq!(fs::read(app.root.join("config.json/keep")).unwrap(), b"x");
}
