//! Main test module for backstop
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end backup and restore scenarios
//! - Chaos tests for corrupted archives and failing restores
//! - Property-based tests for retention and hashing invariants

pub mod integration;
pub mod chaos;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::backstop::*;
    use tempfile::TempDir;
    use std::fs;
    use std::path::Path;

    fn manager_for(temp: &TempDir) -> BackupManager {
        BackupManager::builder()
            .backup_dir(temp.path().join("backups"))
            .layout(SourceLayout::new(temp.path().join("app"), "instance/app.db"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_missing_database_fails_backup() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("app")).unwrap();
        let manager = manager_for(&temp);

        let result = manager.create_backup(BackupKind::Full, None);
        assert!(matches!(result, Err(BackupError::DatabaseUnavailable { .. })));
        assert!(manager.list_backups().unwrap().is_empty());

        // Nothing half-written is left behind
        let leftovers: Vec<_> = fs::read_dir(manager.backup_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_config_backup_without_database() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("app")).unwrap();
        fs::write(temp.path().join("app/settings.ini"), "[main]\n").unwrap();
        let manager = BackupManager::builder()
            .backup_dir(temp.path().join("backups"))
            .layout(SourceLayout::new(temp.path().join("app"), "instance/app.db").with_config_file("settings.ini"))
            .build()
            .unwrap();

        let created = manager.create_backup(BackupKind::Config, None).unwrap();
        let manifest = ArchiveCodec::read_manifest(&created.info.path).unwrap();
        assert!(!manifest.has_database());
        assert_eq!(manifest.included_streams, vec!["config/settings.ini".to_string()]);
    }

    #[test]
    fn test_restore_missing_archive() {
        let temp = TempDir::new().unwrap();
        let manager = manager_for(&temp);
        let result = manager.restore_backup(Path::new("nope.zip"), RestoreScope::Full);
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_empty_backup_dir_listing() {
        let temp = TempDir::new().unwrap();
        let manager = manager_for(&temp);
        assert!(manager.list_backups().unwrap().is_empty());

        let stats = manager.statistics().unwrap();
        assert_eq!(stats.total_backups, 0);
        assert!(stats.oldest.is_none());
    }

    #[test]
    fn test_verify_non_zip_file() {
        let temp = TempDir::new().unwrap();
        let manager = manager_for(&temp);
        let bogus = manager.backup_dir().join("bogus.zip");
        fs::write(&bogus, b"definitely not a zip archive").unwrap();

        let report = manager.verify_backup(&bogus).unwrap();
        assert!(!report.is_valid());
        assert!(report.reason.is_some());
    }
}
