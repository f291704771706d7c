//! Max-count retention of archives
//!
//! Archives are ordered newest first by manifest timestamp, ties broken by
//! file name (greatest first). The first `max_backups` are kept; everything
//! after them is evicted unless it is protected. Protected archives (the one
//! just written, a pre-restore safety archive, the source of a running
//! restore) are never candidates.
//!
//! [`RetentionPolicy::plan`] is pure; [`RetentionPolicy::apply`] deletes the
//! planned archives and their checksum sidecars, carrying on past individual
//! failures.

use crate::archive::sidecar_path;
use crate::types::BackupInfo;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info};

/// Outcome of applying retention
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionReport {
    /// Archives deleted
    pub deleted: Vec<PathBuf>,
    /// Archives that could not be deleted, with the error
    pub failures: Vec<(PathBuf, String)>,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
}

/// Keeps the newest N archives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    max_backups: usize,
}

/// Newest first; equal timestamps by file name, greatest first
pub fn newest_first(a: &BackupInfo, b: &BackupInfo) -> Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id))
}

impl RetentionPolicy {
    /// Policy keeping `max_backups` archives (at least one)
    pub fn new(max_backups: usize) -> Self {
        Self {
            max_backups: max_backups.max(1),
        }
    }

    /// Number of archives kept
    pub fn max_backups(&self) -> usize {
        self.max_backups
    }

    fn is_protected(info: &BackupInfo, protected: &[PathBuf]) -> bool {
        protected
            .iter()
            .any(|p| p == &info.path || p.file_name() == Some(OsStr::new(&info.id)))
    }

    /// Archives to evict, oldest last
    pub fn plan(&self, existing: &[BackupInfo], protected: &[PathBuf]) -> Vec<BackupInfo> {
        let mut ordered: Vec<&BackupInfo> = existing.iter().collect();
        ordered.sort_by(|a, b| newest_first(a, b));
        ordered
            .into_iter()
            .skip(self.max_backups)
            .filter(|info| !Self::is_protected(info, protected))
            .cloned()
            .collect()
    }

    /// Delete the planned archives and their sidecars
    pub fn apply(&self, existing: &[BackupInfo], protected: &[PathBuf]) -> RetentionReport {
        let mut report = RetentionReport::default();
        for info in self.plan(existing, protected) {
            match fs::remove_file(&info.path) {
                Ok(()) => {
                    if let Err(e) = utils::remove_file_if_exists(&sidecar_path(&info.path)) {
                        error!("Failed to remove sidecar of {}: {}", info.id, e);
                    }
                    info!("Retention removed {}", info.id);
                    report.bytes_reclaimed += info.size_bytes;
                    report.deleted.push(info.path);
                }
                Err(e) => {
                    error!("Retention failed to remove {}: {}", info.id, e);
                    report.failures.push((info.path, e.to_string()));
                }
            }
        }
        report
    }
}
