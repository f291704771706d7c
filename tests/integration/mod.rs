//! End-to-end integration tests for backstop
//!
//! Tests realistic application layouts: several config files next to a
//! multi-megabyte database, incremental chains, retention while restoring,
//! and concurrent callers.

use ::backstop::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::info;

/// Test harness for an application with a database and config files
pub struct BackupTestHarness {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    pub backup_dir: PathBuf,
    pub rng: StdRng,
}

impl BackupTestHarness {
    pub fn new(seed: u64) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("app");
        fs::create_dir_all(root.join("instance")).unwrap();
        fs::create_dir_all(root.join("static/img")).unwrap();
        let backup_dir = temp_dir.path().join("backups");
        Self {
            temp_dir,
            root,
            backup_dir,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config_files() -> [&'static str; 3] {
        ["config.json", "gunicorn.conf", "security.ini"]
    }

    pub fn layout(&self) -> SourceLayout {
        let mut layout = SourceLayout::new(&self.root, "instance/app.db")
            .with_tree("static", "static", TreeCategory::Assets);
        for file in Self::config_files() {
            layout = layout.with_config_file(file);
        }
        layout
    }

    pub fn manager(&self, config: BackupConfig) -> BackupManager {
        BackupManager::builder()
            .backup_dir(&self.backup_dir)
            .layout(self.layout())
            .config(config)
            .build()
            .unwrap()
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("instance/app.db")
    }

    /// Database with `megabytes` of random blobs
    pub fn create_database(&mut self, megabytes: usize) {
        let conn = Connection::open(self.db_path()).unwrap();
        conn.execute_batch("CREATE TABLE documents (id INTEGER PRIMARY KEY, body BLOB NOT NULL);")
            .unwrap();
        for _ in 0..megabytes {
            let mut blob = vec![0u8; 1024 * 1024];
            self.rng.fill(&mut blob[..]);
            conn.execute("INSERT INTO documents (body) VALUES (?1)", [&blob])
                .unwrap();
        }
    }

    pub fn write_config_files(&mut self) {
        for file in Self::config_files() {
            let value: u32 = self.rng.random();
            fs::write(self.root.join(file), format!("# {}\nvalue = {}\n", file, value)).unwrap();
        }
        fs::write(self.root.join("static/img/logo.png"), b"\x89PNG fake").unwrap();
    }

    /// Push every file's mtime an hour into the past
    pub fn age_all_files(&self) {
        let past = FileTime::from_system_time(SystemTime::now() - Duration::from_secs(3600));
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                filetime::set_file_mtime(entry.path(), past).unwrap();
            }
        }
    }

    /// Rewrite a file and give it an mtime safely after any baseline
    pub fn touch_future(&self, relative: &str, content: &[u8]) {
        let path = self.root.join(relative);
        fs::write(&path, content).unwrap();
        let future = FileTime::from_system_time(SystemTime::now() + Duration::from_secs(60));
        filetime::set_file_mtime(&path, future).unwrap();
    }

    pub fn document_count(&self) -> i64 {
        let conn = Connection::open(self.db_path()).unwrap();
        conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))
            .unwrap()
    }
}

fn entry_names(path: &Path) -> Vec<String> {
    ArchiveCodec::list_entries(path)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[test]
fn test_full_backup_of_three_configs_and_large_database() {
    let mut harness = BackupTestHarness::new(7);
    harness.create_database(10);
    harness.write_config_files();
    let manager = harness.manager(BackupConfig::default());

    let created = manager.create_backup(BackupKind::Full, None).unwrap();
    info!("Full backup: {} bytes", created.info.size_bytes);

    let manifest = ArchiveCodec::read_manifest(&created.info.path).unwrap();
    assert_eq!(manifest.kind, Some(BackupKind::Full));
    assert!(manifest.timestamp.is_some());
    assert!(manifest.has_database());
    for file in BackupTestHarness::config_files() {
        let name = format!("config/{}", file);
        let entry = manifest.stream(&name).unwrap();
        let live = utils::hash_file_content(&harness.root.join(file)).unwrap();
        assert_eq!(entry.sha256, live, "{}", name);
    }
    let db_entry = manifest.stream("database/app.db").unwrap();
    assert!(db_entry.size >= 10 * 1024 * 1024);

    let sidecar = fs::read_to_string(archive::sidecar_path(&created.info.path)).unwrap();
    assert!(sidecar.starts_with(created.info.checksum.as_deref().unwrap()));

    let report = manager.verify_backup(&created.info.path).unwrap();
    assert!(report.is_valid(), "{}", report.summary());
}

#[test]
fn test_database_snapshot_is_consistent_while_open() {
    let mut harness = BackupTestHarness::new(11);
    harness.create_database(1);
    harness.write_config_files();
    let manager = harness.manager(BackupConfig::default());

    // A second connection holding the database open does not tear the copy
    let writer = Connection::open(harness.db_path()).unwrap();
    writer
        .execute("INSERT INTO documents (body) VALUES (x'00')", [])
        .unwrap();

    let created = manager.create_backup(BackupKind::Data, None).unwrap();
    drop(writer);

    let extract_dir = harness.temp_dir.path().join("extract");
    fs::create_dir_all(&extract_dir).unwrap();
    let db_copy = extract_dir.join("app.db");
    ArchiveCodec::extract(&created.info.path, "database/app.db", &db_copy).unwrap();

    let conn = Connection::open(&db_copy).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 2);
    restore::validate_database(&db_copy).unwrap();
}

#[test]
fn test_incremental_contains_only_changed_files() {
    let mut harness = BackupTestHarness::new(3);
    harness.create_database(1);
    harness.write_config_files();
    harness.age_all_files();
    let manager = harness.manager(BackupConfig::default());

    let full = manager.create_backup(BackupKind::Full, None).unwrap();
    harness.touch_future("security.ini", b"[auth]\nrounds = 12\n");

    let incremental = manager.create_backup(BackupKind::Incremental, None).unwrap();
    assert!(!incremental.fell_back_to_full);
    assert!(incremental.info.id.starts_with("backup_incremental_"));

    let names = entry_names(&incremental.info.path);
    assert!(names.contains(&"database/app.db".to_string()));
    assert!(names.contains(&"config/security.ini".to_string()));
    assert!(!names.contains(&"config/config.json".to_string()));
    assert!(!names.contains(&"static/img/logo.png".to_string()));

    let manifest = ArchiveCodec::read_manifest(&incremental.info.path).unwrap();
    assert_eq!(manifest.kind, Some(BackupKind::Incremental));
    assert_eq!(manifest.baseline.unwrap().id, full.info.id);
}

#[test]
fn test_incremental_without_full_falls_back() {
    let mut harness = BackupTestHarness::new(5);
    harness.create_database(1);
    harness.write_config_files();
    let manager = harness.manager(BackupConfig::default());

    // DATA archives are not baselines
    manager.create_backup(BackupKind::Data, None).unwrap();
    let created = manager.create_backup(BackupKind::Incremental, None).unwrap();

    assert!(created.fell_back_to_full);
    let manifest = ArchiveCodec::read_manifest(&created.info.path).unwrap();
    assert_eq!(manifest.kind, Some(BackupKind::Full));
    assert_eq!(manifest.requested_kind, Some(BackupKind::Incremental));
    assert!(manifest.contains("config/config.json"));
}

#[test]
fn test_restore_source_and_safety_survive_retention() {
    let mut harness = BackupTestHarness::new(9);
    harness.create_database(1);
    harness.write_config_files();
    let manager = harness.manager(BackupConfig {
        max_backups: 1,
        ..Default::default()
    });

    let source = manager.create_backup(BackupKind::Full, None).unwrap();
    let conn = Connection::open(harness.db_path()).unwrap();
    conn.execute("DELETE FROM documents", []).unwrap();
    drop(conn);

    let report = manager
        .restore_backup(&source.info.path, RestoreScope::Full)
        .unwrap();
    assert!(report.is_success(), "{:?}", report.failure);
    assert_eq!(harness.document_count(), 1);

    let safety = report.safety_backup.unwrap();
    assert!(source.info.path.exists());
    assert!(safety.exists());

    // The next backup is free to evict both
    let next = manager.create_backup(BackupKind::Full, None).unwrap();
    let remaining = manager.list_backups().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, next.info.id);
}

#[test]
fn test_concurrent_backups_are_serialized() {
    let mut harness = BackupTestHarness::new(13);
    harness.create_database(1);
    harness.write_config_files();
    let manager = Arc::new(harness.manager(BackupConfig::default()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || manager.create_backup(BackupKind::Data, Some(&format!("worker{}", i))))
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.join().unwrap().unwrap().info.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);

    for backup in manager.list_backups_verified().unwrap() {
        assert_eq!(backup.verification, VerificationStatus::Verified, "{}", backup.id);
    }
}

#[test]
fn test_settings_round_trip_drives_manager() {
    let mut harness = BackupTestHarness::new(17);
    harness.create_database(1);
    harness.write_config_files();

    let settings = Settings {
        backup_dir: harness.backup_dir.clone(),
        layout: harness.layout(),
        schedule: Some(ScheduleConfig::default()),
        ..Default::default()
    };
    let path = harness.temp_dir.path().join("backstop.json");
    settings.save(&path).unwrap();

    let loaded = Settings::load(&path).unwrap();
    assert_eq!(loaded, settings);

    let manager = BackupManager::from_settings(&loaded).unwrap();
    let created = manager.create_backup(BackupKind::Config, None).unwrap();
    assert_eq!(created.streams_written, 3);
}

#[test]
fn test_restore_recreates_deleted_config_files() {
    let mut harness = BackupTestHarness::new(21);
    harness.create_database(10);
    harness.write_config_files();
    let manager = harness.manager(BackupConfig::default());

    let created = manager.create_backup(BackupKind::Full, None).unwrap();
    let listed = manager.list_backups().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].kind, Some(BackupKind::Full));
    assert_eq!(listed[0].size_bytes, fs::metadata(&created.info.path).unwrap().len());

    let originals: Vec<Vec<u8>> = BackupTestHarness::config_files()
        .iter()
        .map(|f| fs::read(harness.root.join(f)).unwrap())
        .collect();
    for file in BackupTestHarness::config_files() {
        fs::remove_file(harness.root.join(file)).unwrap();
    }

    let report = manager
        .restore_backup(&created.info.path, RestoreScope::Full)
        .unwrap();
    assert!(report.is_success(), "{:?}", report.failure);

    for (file, original) in BackupTestHarness::config_files().iter().zip(&originals) {
        assert_eq!(&fs::read(harness.root.join(file)).unwrap(), original, "{}", file);
    }
    restore::validate_database(&harness.db_path()).unwrap();
    assert_eq!(harness.document_count(), 10);
}
