//! Self-describing manifest embedded in every archive
//!
//! The manifest is stored under the reserved entry name
//! [`MANIFEST_ENTRY`] and is always the last entry written. It records what the
//! archive contains and the SHA-256 of every stream so an archive can be
//! verified without any external index.
//!
//! Parsing is defensive: unknown keys are ignored, missing optional keys take
//! defaults, and an unrecognised kind is read as `None` rather than failing.

use crate::types::BackupKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Reserved archive entry holding the manifest
pub const MANIFEST_ENTRY: &str = "backup_metadata.json";

/// Archive format version written by this crate
pub const FORMAT_VERSION: &str = "2.1.0";

/// Generator string recorded in manifests
pub const GENERATOR: &str = concat!("backstop/", env!("CARGO_PKG_VERSION"));

/// Information about the host system
///
/// Captured at creation time for auditing; never used for decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Architecture
    pub arch: String,
    /// Username (if available)
    pub username: Option<String>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            os: String::new(),
            arch: String::new(),
            username: None,
        }
    }
}

impl HostInfo {
    /// Describe the current host
    pub fn current() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }
}

/// One stream recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Archive entry name
    pub name: String,
    /// Uncompressed size in bytes
    pub size: u64,
    /// SHA-256 of the uncompressed bytes
    pub sha256: String,
}

/// The FULL backup an INCREMENTAL was taken against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaselineRef {
    /// Archive file name
    pub id: String,
    /// Its manifest timestamp, the modification cutoff
    pub timestamp: DateTime<Utc>,
}

/// Manifest document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    /// Archive format version
    #[serde(default)]
    pub version: String,
    /// Kind actually performed
    #[serde(default, deserialize_with = "lenient_kind")]
    pub kind: Option<BackupKind>,
    /// Kind the caller asked for, when different
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_kind")]
    pub requested_kind: Option<BackupKind>,
    /// Creation time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Entry names of all streams, in write order
    #[serde(default)]
    pub included_streams: Vec<String>,
    /// Per-stream size and checksum
    #[serde(default)]
    pub streams: Vec<StreamEntry>,
    /// Host the backup was taken on
    #[serde(default)]
    pub host: HostInfo,
    /// Producer of the archive
    #[serde(default)]
    pub generator: String,
    /// Application name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Baseline of an INCREMENTAL backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineRef>,
    /// Non-critical streams left out
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

fn lenient_kind<'de, D>(deserializer: D) -> std::result::Result<Option<BackupKind>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

impl BackupManifest {
    /// Start a manifest for a new archive
    pub fn new(kind: BackupKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            kind: Some(kind),
            requested_kind: None,
            timestamp: Some(timestamp),
            included_streams: Vec::new(),
            streams: Vec::new(),
            host: HostInfo::current(),
            generator: GENERATOR.to_string(),
            system: None,
            baseline: None,
            skipped: Vec::new(),
        }
    }

    /// Record a written stream
    pub fn record_stream(&mut self, name: &str, size: u64, sha256: String) {
        self.included_streams.push(name.to_string());
        self.streams.push(StreamEntry {
            name: name.to_string(),
            size,
            sha256,
        });
    }

    /// Look up a stream entry by name
    pub fn stream(&self, name: &str) -> Option<&StreamEntry> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Whether a stream is present
    pub fn contains(&self, name: &str) -> bool {
        self.stream(name).is_some() || self.included_streams.iter().any(|s| s == name)
    }

    /// Sum of stream sizes
    pub fn payload_bytes(&self) -> u64 {
        self.streams.iter().map(|s| s.size).sum()
    }

    /// Whether the archive carries a database stream
    pub fn has_database(&self) -> bool {
        self.streams.iter().any(|s| s.name.starts_with("database/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json_uses_camel_case() {
        let mut manifest = BackupManifest::new(BackupKind::Full, Utc::now());
        manifest.record_stream("database/app.db", 4096, "ab".repeat(32));
        let json = serde_json::to_value(&manifest).unwrap();

        assert_eq!(json["kind"], "FULL");
        assert_eq!(json["version"], FORMAT_VERSION);
        assert_eq!(json["includedStreams"][0], "database/app.db");
        assert_eq!(json["streams"][0]["size"], 4096);
        assert!(json.get("baseline").is_none());
        assert!(json["host"]["hostname"].is_string());
    }

    #[test]
    fn test_parse_is_defensive() {
        let manifest: BackupManifest = serde_json::from_str(
            r#"{"kind": "WEEKLY", "somethingNew": 1, "streams": [{"name": "config/a.conf", "size": 3, "sha256": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.kind, None);
        assert!(manifest.timestamp.is_none());
        assert_eq!(manifest.host.hostname, "unknown");
        assert!(manifest.contains("config/a.conf"));
        assert!(!manifest.has_database());
    }

    #[test]
    fn test_baseline_round_trip_fields() {
        let now = Utc::now();
        let mut manifest = BackupManifest::new(BackupKind::Incremental, now);
        manifest.baseline = Some(BaselineRef {
            id: "backup_full_20240101_020000.zip".to_string(),
            timestamp: now,
        });
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: BackupManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.baseline.unwrap().id, "backup_full_20240101_020000.zip");
        assert_eq!(parsed.kind, Some(BackupKind::Incremental));
    }
}
