//! Archive verification and integrity checking
//!
//! ## Overview
//!
//! Verification of one archive runs these checks in order and stops at the
//! first failure:
//!
//! 1. **Container**: the zip opens and every entry reads to its end with a
//!    matching CRC-32 (catches truncation and bit flips)
//! 2. **Manifest**: `backup_metadata.json` is present and parses
//! 3. **Archive checksum** (deep): the archive bytes hash to the digest in the
//!    `.sha256` sidecar
//! 4. **Streams**: every stream the manifest lists is present; in deep mode
//!    each one is re-hashed and compared with its manifest entry
//!
//! A missing sidecar fails the archive only when the caller requires a
//! recorded checksum (always the case right after writing one); otherwise it
//! is reported as a warning.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use backstop::verification::IntegrityVerifier;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = IntegrityVerifier::new(true);
//! let report = verifier.verify(Path::new("backups/backup_full_20240101_020000.zip"), false)?;
//! if report.is_valid() {
//!     println!("{}", report.summary());
//! } else {
//!     eprintln!("Corrupt: {}", report.reason.unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Performance
//!
//! Deep verification decompresses every entry twice (CRC pass and hash pass)
//! and hashes the archive once. Shallow verification skips the hashing.

use crate::archive::{read_sidecar, ArchiveReader};
use crate::error::{BackupError, Result};
use crate::manifest::BackupManifest;
use crate::types::VerificationStatus;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of one named check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether it passed
    pub passed: bool,
    /// Failure detail
    pub detail: Option<String>,
}

/// Verification report for one archive
///
/// # Examples
///
/// ```rust,no_run
/// # use backstop::verification::IntegrityVerifier;
/// # use std::path::Path;
/// # fn example() -> backstop::Result<()> {
/// let report = IntegrityVerifier::new(true).verify(Path::new("a.zip"), true)?;
/// for check in &report.checks {
///     println!("{}: {}", check.name, if check.passed { "ok" } else { "FAILED" });
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Archive verified
    pub path: PathBuf,
    /// Whether every check passed
    pub ok: bool,
    /// First failed check
    pub reason: Option<String>,
    /// Checks run, in order
    pub checks: Vec<CheckResult>,
    /// Non-fatal findings
    pub warnings: Vec<String>,
    /// Parsed manifest, when readable
    pub manifest: Option<BackupManifest>,
    /// Archive checksum computed during deep verification
    pub archive_checksum: Option<String>,
    /// Streams checked against the manifest
    pub streams_checked: usize,
    /// Time taken for verification in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ok: false,
            reason: None,
            checks: Vec::new(),
            warnings: Vec::new(),
            manifest: None,
            archive_checksum: None,
            streams_checked: 0,
            verification_time_ms: 0,
        }
    }

    fn pass(&mut self, name: &str) {
        self.checks.push(CheckResult {
            name: name.to_string(),
            passed: true,
            detail: None,
        });
    }

    fn fail(&mut self, name: &str, detail: String) {
        self.checks.push(CheckResult {
            name: name.to_string(),
            passed: false,
            detail: Some(detail.clone()),
        });
        self.ok = false;
        self.reason = Some(detail);
    }

    /// Check if the archive is fully valid
    pub fn is_valid(&self) -> bool {
        self.ok && self.checks.iter().all(|c| c.passed)
    }

    /// Verification state for listings
    pub fn status(&self) -> VerificationStatus {
        if self.is_valid() {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Failed(self.reason.clone().unwrap_or_else(|| "unknown".to_string()))
        }
    }

    /// Convert a failed report into an error
    pub fn into_result(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(BackupError::InvalidBackup {
                path: self.path,
                reason: self.reason.unwrap_or_else(|| "verification failed".to_string()),
            })
        }
    }

    /// Get a summary of the verification
    pub fn summary(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.is_valid() {
            format!(
                "{} is valid ({} streams verified in {}ms)",
                name, self.streams_checked, self.verification_time_ms
            )
        } else {
            format!(
                "{} is invalid: {}",
                name,
                self.reason.as_deref().unwrap_or("unknown failure")
            )
        }
    }
}

/// Verifier for backup archives
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    deep: bool,
}

impl IntegrityVerifier {
    /// Create a verifier
    ///
    /// # Arguments
    ///
    /// * `deep` - Re-hash the archive and every stream
    pub fn new(deep: bool) -> Self {
        Self { deep }
    }

    /// Verify one archive
    ///
    /// # Arguments
    ///
    /// * `path` - Archive to verify
    /// * `require_recorded_checksum` - Fail when the sidecar is missing
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the archive does not exist
    ///
    /// Verification failures are reported in the result, not as errors.
    pub fn verify(&self, path: &Path, require_recorded_checksum: bool) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut report = VerificationReport::new(path);
        self.run_checks(path, require_recorded_checksum, &mut report)?;
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        if report.reason.is_none() {
            report.ok = true;
            debug!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    fn run_checks(&self, path: &Path, require_recorded_checksum: bool, report: &mut VerificationReport) -> Result<()> {
        // 1. Container
        let mut reader = match ArchiveReader::open(path) {
            Ok(reader) => reader,
            Err(BackupError::NotFound(p)) => return Err(BackupError::NotFound(p)),
            Err(e) => {
                report.fail("container", e.to_string());
                return Ok(());
            }
        };
        if let Err(e) = reader.test_all() {
            report.fail("container", e.to_string());
            return Ok(());
        }
        report.pass("container");

        // 2. Manifest
        let manifest = match reader.read_manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                report.fail("manifest", e.to_string());
                return Ok(());
            }
        };
        report.pass("manifest");

        // 3. Archive checksum
        if self.deep {
            match read_sidecar(path) {
                Ok(Some(recorded)) => {
                    let actual = utils::hash_file_content(path)?;
                    if actual != recorded {
                        report.fail(
                            "archive_checksum",
                            format!("archive checksum mismatch: recorded {}, computed {}", recorded, actual),
                        );
                        report.manifest = Some(manifest);
                        return Ok(());
                    }
                    report.archive_checksum = Some(actual);
                    report.pass("archive_checksum");
                }
                Ok(None) if require_recorded_checksum => {
                    report.fail("archive_checksum", "checksum sidecar missing".to_string());
                    report.manifest = Some(manifest);
                    return Ok(());
                }
                Ok(None) => {
                    report.warnings.push("checksum sidecar missing".to_string());
                    report.archive_checksum = Some(utils::hash_file_content(path)?);
                }
                Err(e) => {
                    report.fail("archive_checksum", e.to_string());
                    report.manifest = Some(manifest);
                    return Ok(());
                }
            }
        }

        // 4. Streams
        for entry in &manifest.streams {
            if !reader.contains(&entry.name) {
                report.fail("streams", format!("stream '{}' listed in manifest but missing", entry.name));
                break;
            }
            if self.deep {
                let (digest, size) = match reader.hash_entry(&entry.name) {
                    Ok(result) => result,
                    Err(e) => {
                        report.fail("streams", e.to_string());
                        break;
                    }
                };
                if size != entry.size {
                    report.fail(
                        "streams",
                        format!("stream '{}' size mismatch: expected {}, got {}", entry.name, entry.size, size),
                    );
                    break;
                }
                if digest != entry.sha256 {
                    report.fail("streams", format!("stream '{}' checksum mismatch", entry.name));
                    break;
                }
            }
            report.streams_checked += 1;
        }
        if report.reason.is_none() {
            report.pass("streams");
        }
        report.manifest = Some(manifest);
        Ok(())
    }
}
