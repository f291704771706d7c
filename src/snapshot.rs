//! Capturing application state as named streams
//!
//! A [`SnapshotSource`] turns the categories described by a
//! [`SourceLayout`] into [`SnapshotStream`]s ready for the archive writer:
//!
//! | Stream name | Content |
//! |---|---|
//! | `database/<file>` | consistent copy of the live SQLite database |
//! | `config/<path>` | individual configuration files |
//! | `<tree>/<path>` | every regular file below a named tree |
//! | `signatures/signatures.json` | exported signature records |
//! | `artifacts/<path>` | generated documents (optional) |
//! | `logs/<file>` | log files matched by glob (optional) |
//!
//! The database is never copied raw. SQLite's online backup API copies it page
//! by page into a scratch file, so writers in the host application never
//! produce a torn snapshot.
//!
//! [`locate`] maps a stream name back to its live location and category; the
//! restore coordinator uses it to decide what a scope applies and where.

use crate::config::{BackupConfig, SourceLayout, TreeCategory, TreeRoot};
use crate::error::{BackupError, Result};
use crate::types::BackupKind;
use crate::utils::{self, logical_name, safe_relative_path};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSetBuilder};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Entry name of the exported signature records
pub const SIGNATURES_ENTRY: &str = "signatures/signatures.json";

/// Pages copied per online-backup step
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 256;

/// Where a stream's bytes come from
#[derive(Debug)]
pub enum StreamSource {
    /// A live file, read when the archive is written
    File(PathBuf),
    /// An in-memory buffer
    Bytes(Vec<u8>),
    /// A scratch file removed once the stream is dropped
    TempFile(NamedTempFile),
}

/// One named payload bound for an archive
#[derive(Debug)]
pub struct SnapshotStream {
    /// Archive entry name
    pub name: String,
    /// Payload
    pub source: StreamSource,
    /// Whether failing to read it aborts the backup
    pub critical: bool,
}

impl SnapshotStream {
    /// Stream backed by a live file
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: StreamSource::File(path.into()),
            critical: false,
        }
    }

    /// Stream backed by a buffer
    pub fn bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source: StreamSource::Bytes(data),
            critical: false,
        }
    }

    /// Stream backed by a scratch file
    pub fn temp_file(name: impl Into<String>, file: NamedTempFile) -> Self {
        Self {
            name: name.into(),
            source: StreamSource::TempFile(file),
            critical: false,
        }
    }

    /// Mark the stream as critical
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Open the payload for reading from the start
    pub fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        match &self.source {
            StreamSource::File(path) => Ok(Box::new(File::open(path)?)),
            StreamSource::Bytes(data) => Ok(Box::new(&data[..])),
            StreamSource::TempFile(file) => Ok(Box::new(File::open(file.path())?)),
        }
    }
}

/// Category of a stream, which decides restore scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCategory {
    /// The SQLite database
    Database,
    /// An individual config file
    ConfigFile,
    /// A file from a named tree
    Tree(TreeCategory),
    /// Exported signature records
    Signatures,
    /// A generated document
    Artifact,
    /// A log file
    Log,
}

/// Live location of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    /// Stream category
    pub category: StreamCategory,
    /// File the stream restores to; `None` for signatures and logs
    pub path: Option<PathBuf>,
}

/// Entry name of a configured config file
pub fn config_entry_name(layout: &SourceLayout, file: &Path) -> Option<String> {
    if file.is_relative() {
        return logical_name("config", file);
    }
    match file.strip_prefix(&layout.app_root) {
        Ok(relative) => logical_name("config", relative),
        Err(_) => logical_name("config", Path::new(file.file_name()?)),
    }
}

/// Map an archive entry name to its live location
///
/// Returns `None` for names the layout does not know, including any name
/// whose remainder would escape its destination directory.
pub fn locate(layout: &SourceLayout, name: &str) -> Option<StreamTarget> {
    if name == SIGNATURES_ENTRY {
        return Some(StreamTarget {
            category: StreamCategory::Signatures,
            path: None,
        });
    }
    let (prefix, rest) = name.split_once('/')?;
    let relative = safe_relative_path(rest)?;
    match prefix {
        "database" => Some(StreamTarget {
            category: StreamCategory::Database,
            path: Some(layout.database()),
        }),
        "config" => {
            let configured = layout
                .config_files
                .iter()
                .find(|f| config_entry_name(layout, f).as_deref() == Some(name))
                .map(|f| layout.resolve(f));
            Some(StreamTarget {
                category: StreamCategory::ConfigFile,
                path: Some(configured.unwrap_or_else(|| layout.app_root.join(&relative))),
            })
        }
        "artifacts" => {
            let dir = layout.artifacts_dir.as_ref()?;
            Some(StreamTarget {
                category: StreamCategory::Artifact,
                path: Some(layout.resolve(dir).join(relative)),
            })
        }
        "logs" => Some(StreamTarget {
            category: StreamCategory::Log,
            path: None,
        }),
        "signatures" => None,
        tree_name => {
            let tree = layout.tree(tree_name)?;
            Some(StreamTarget {
                category: StreamCategory::Tree(tree.category),
                path: Some(layout.resolve(&tree.path).join(relative)),
            })
        }
    }
}

/// One exported signature record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    /// Owning entity id
    pub id: i64,
    /// Display name of the signer
    pub name: String,
    /// Professional registration number
    #[serde(default)]
    pub registration: Option<String>,
    /// Encoded signature image or data
    pub signature_data: String,
}

/// JSON document stored under [`SIGNATURES_ENTRY`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDocument {
    /// Document version
    #[serde(default)]
    pub version: u32,
    /// When the records were exported
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    /// Records
    #[serde(default)]
    pub signatures: Vec<SignatureRecord>,
}

impl SignatureDocument {
    /// Wrap records exported now
    pub fn new(signatures: Vec<SignatureRecord>) -> Self {
        Self {
            version: 1,
            exported_at: Some(Utc::now()),
            signatures,
        }
    }
}

/// Collaborator owning the per-entity signature records
pub trait SignatureStore: Send + Sync {
    /// Export every record with signature data
    fn export_signatures(&self) -> Result<Vec<SignatureRecord>>;

    /// Hand restored records back; returns how many were applied
    fn import_signatures(&self, records: &[SignatureRecord]) -> Result<usize>;
}

/// Store for hosts without signature records
#[derive(Debug, Default)]
pub struct NoSignatureStore;

impl SignatureStore for NoSignatureStore {
    fn export_signatures(&self) -> Result<Vec<SignatureRecord>> {
        Ok(Vec::new())
    }

    fn import_signatures(&self, _records: &[SignatureRecord]) -> Result<usize> {
        Ok(0)
    }
}

/// Signature records kept in a JSON file
///
/// Import merges by id: existing records are replaced, unknown ids are added.
#[derive(Debug, Clone)]
pub struct JsonFileSignatureStore {
    path: PathBuf,
}

impl JsonFileSignatureStore {
    /// Store backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Vec<SignatureRecord>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice::<SignatureDocument>(&data)?.signatures),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SignatureStore for JsonFileSignatureStore {
    fn export_signatures(&self) -> Result<Vec<SignatureRecord>> {
        self.load()
    }

    fn import_signatures(&self, records: &[SignatureRecord]) -> Result<usize> {
        let mut current = self.load()?;
        for record in records {
            match current.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => current.push(record.clone()),
            }
        }
        let data = serde_json::to_vec_pretty(&SignatureDocument::new(current))?;
        utils::atomic_write(&self.path, &data)?;
        Ok(records.len())
    }
}

/// What to capture
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    /// Kind whose content rules apply
    pub kind: BackupKind,
    /// Modification cutoff, required for INCREMENTAL
    pub since: Option<DateTime<Utc>>,
    /// Record a missing database as skipped instead of failing
    pub allow_missing_database: bool,
}

/// Streams gathered for one archive
#[derive(Debug, Default)]
pub struct CapturedStreams {
    /// Streams in write order
    pub streams: Vec<SnapshotStream>,
    /// Non-critical content left out, one line each
    pub skipped: Vec<String>,
}

/// Enumerates the capturable categories of a [`SourceLayout`]
pub struct SnapshotSource<'a> {
    layout: &'a SourceLayout,
    config: &'a BackupConfig,
    signatures: &'a dyn SignatureStore,
    scratch_dir: &'a Path,
    excluded: Vec<PathBuf>,
}

impl<'a> SnapshotSource<'a> {
    /// Create a source
    ///
    /// # Arguments
    ///
    /// * `layout` - Where the state lives
    /// * `config` - Optional stream switches
    /// * `signatures` - Signature record collaborator
    /// * `scratch_dir` - Directory for the database snapshot file; also
    ///   excluded from tree walks
    pub fn new(
        layout: &'a SourceLayout,
        config: &'a BackupConfig,
        signatures: &'a dyn SignatureStore,
        scratch_dir: &'a Path,
    ) -> Self {
        let database = layout.database();
        let mut excluded = vec![scratch_dir.to_path_buf()];
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut name = database.clone().into_os_string();
            name.push(suffix);
            excluded.push(PathBuf::from(name));
        }
        Self {
            layout,
            config,
            signatures,
            scratch_dir,
            excluded,
        }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|e| path.starts_with(e))
    }

    /// Gather every stream a request calls for
    pub fn capture(&self, request: CaptureRequest) -> Result<CapturedStreams> {
        let mut captured = CapturedStreams::default();

        if request.kind.includes_database() {
            match self.database_stream() {
                Ok(stream) => captured.streams.push(stream),
                Err(BackupError::DatabaseUnavailable { path, reason }) if request.allow_missing_database => {
                    warn!("Database {:?} not captured: {}", path, reason);
                    captured.skipped.push(format!("database: {}", reason));
                }
                Err(e) => return Err(e),
            }
        }

        match request.kind {
            BackupKind::Full => {
                captured.streams.extend(self.config_streams()?);
                captured.streams.extend(self.tree_streams(|_| true)?);
                self.push_signatures(&mut captured);
                if self.config.include_generated_artifacts {
                    self.push_optional(&mut captured, "artifacts", self.artifact_streams());
                }
                if self.config.include_logs {
                    self.push_optional(&mut captured, "logs", self.log_streams());
                }
            }
            BackupKind::Incremental => {
                let since = request.since.ok_or(BackupError::NoBaseline)?;
                captured.streams.extend(self.modified_since(since)?);
            }
            BackupKind::Data => {
                self.push_signatures(&mut captured);
            }
            BackupKind::Config => {
                captured.streams.extend(self.config_streams()?);
                captured.streams.extend(
                    self.tree_streams(|t| matches!(t.category, TreeCategory::Config | TreeCategory::Code))?,
                );
            }
        }

        debug!(
            "Captured {} streams for {} ({} skipped)",
            captured.streams.len(),
            request.kind,
            captured.skipped.len()
        );
        Ok(captured)
    }

    fn push_signatures(&self, captured: &mut CapturedStreams) {
        match self.signature_stream() {
            Ok(Some(stream)) => captured.streams.push(stream),
            Ok(None) => {}
            Err(e) => {
                warn!("Signature records not captured: {}", e);
                captured.skipped.push(format!("signatures: {}", e));
            }
        }
    }

    fn push_optional(&self, captured: &mut CapturedStreams, what: &str, result: Result<Vec<SnapshotStream>>) {
        match result {
            Ok(streams) => captured.streams.extend(streams),
            Err(e) => {
                warn!("{} not captured: {}", what, e);
                captured.skipped.push(format!("{}: {}", what, e));
            }
        }
    }

    /// Consistent copy of the live database
    ///
    /// # Errors
    ///
    /// - [`BackupError::DatabaseUnavailable`] if the file is missing or SQLite
    ///   cannot read it
    pub fn database_stream(&self) -> Result<SnapshotStream> {
        let source = self.layout.database();
        let unavailable = |reason: String| BackupError::DatabaseUnavailable {
            path: source.clone(),
            reason,
        };

        if !source.is_file() {
            return Err(unavailable("file not found".to_string()));
        }
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| unavailable("file name is not valid UTF-8".to_string()))?;
        let name = format!("database/{}", file_name);

        let scratch = tempfile::Builder::new()
            .prefix(".db-snapshot-")
            .suffix(".tmp")
            .tempfile_in(self.scratch_dir)?;

        let src = Connection::open_with_flags(&source, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| unavailable(e.to_string()))?;
        {
            let mut dst = Connection::open(scratch.path())?;
            let backup = Backup::new(&src, &mut dst).map_err(|e| unavailable(e.to_string()))?;
            backup
                .run_to_completion(BACKUP_PAGES_PER_STEP, Duration::from_millis(50), None)
                .map_err(|e| unavailable(e.to_string()))?;
        }

        let size = scratch.as_file().metadata()?.len();
        debug!("Database snapshot of {:?}: {}", source, utils::format_bytes(size));
        Ok(SnapshotStream::temp_file(name, scratch).critical())
    }

    /// The configured individual config files
    ///
    /// Files that do not exist are skipped.
    pub fn config_streams(&self) -> Result<Vec<SnapshotStream>> {
        self.config_streams_filtered(None)
    }

    fn config_streams_filtered(&self, since: Option<DateTime<Utc>>) -> Result<Vec<SnapshotStream>> {
        let mut streams = Vec::new();
        let mut seen = HashSet::new();
        for file in &self.layout.config_files {
            let path = self.layout.resolve(file);
            if !path.is_file() {
                debug!("Config file {:?} not present, skipping", path);
                continue;
            }
            if let Some(cutoff) = since {
                if utils::modified_at(&path)? <= cutoff {
                    continue;
                }
            }
            let Some(name) = config_entry_name(self.layout, file) else {
                warn!("Config file {:?} has no usable entry name, skipping", file);
                continue;
            };
            if seen.insert(name.clone()) {
                streams.push(SnapshotStream::file(name, path));
            }
        }
        Ok(streams)
    }

    /// Every regular file below the trees accepted by `filter`
    ///
    /// Symlinks are not followed and not captured. Missing tree roots are
    /// skipped.
    pub fn tree_streams(&self, filter: impl Fn(&TreeRoot) -> bool) -> Result<Vec<SnapshotStream>> {
        let mut streams = Vec::new();
        for tree in self.layout.trees.iter().filter(|t| filter(t)) {
            streams.extend(self.walk(&tree.name, &self.layout.resolve(&tree.path), None)?);
        }
        Ok(streams)
    }

    /// Config files and tree files modified strictly after `cutoff`
    ///
    /// Includes generated artifacts when they are enabled.
    pub fn modified_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SnapshotStream>> {
        let mut streams = self.config_streams_filtered(Some(cutoff))?;
        for tree in &self.layout.trees {
            streams.extend(self.walk(&tree.name, &self.layout.resolve(&tree.path), Some(cutoff))?);
        }
        if self.config.include_generated_artifacts {
            if let Some(dir) = &self.layout.artifacts_dir {
                streams.extend(self.walk("artifacts", &self.layout.resolve(dir), Some(cutoff))?);
            }
        }
        trace!("{} files modified since {}", streams.len(), cutoff);
        Ok(streams)
    }

    /// Generated documents
    pub fn artifact_streams(&self) -> Result<Vec<SnapshotStream>> {
        match &self.layout.artifacts_dir {
            Some(dir) => self.walk("artifacts", &self.layout.resolve(dir), None),
            None => Ok(Vec::new()),
        }
    }

    /// Log files matching the layout's glob patterns
    ///
    /// Stored flat under `logs/<file name>`; when two logs share a file name
    /// only the first is kept.
    pub fn log_streams(&self) -> Result<Vec<SnapshotStream>> {
        if self.layout.log_patterns.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = GlobSetBuilder::new();
        let mut bases = Vec::new();
        for pattern in &self.layout.log_patterns {
            builder.add(Glob::new(pattern)?);
            bases.push(glob_base(pattern));
        }
        let globs = builder.build()?;

        let root = &self.layout.app_root;
        let mut streams = Vec::new();
        let mut seen_dirs = HashSet::new();
        let mut seen_names = HashSet::new();
        for base in bases {
            let dir = root.join(&base);
            if !dir.is_dir() || !seen_dirs.insert(dir.clone()) {
                continue;
            }
            for entry in WalkDir::new(&dir).follow_links(false).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() || self.is_excluded(entry.path()) {
                    continue;
                }
                let relative = utils::make_relative(entry.path(), root)?;
                if !globs.is_match(&relative) {
                    continue;
                }
                let Some(file_name) = entry.file_name().to_str() else {
                    continue;
                };
                if !seen_names.insert(file_name.to_string()) {
                    warn!("Log {:?} shares a file name with another log, skipping", entry.path());
                    continue;
                }
                streams.push(SnapshotStream::file(format!("logs/{}", file_name), entry.path()));
            }
        }
        Ok(streams)
    }

    /// Exported signature records as one JSON stream
    ///
    /// Returns `None` when the store has no records.
    pub fn signature_stream(&self) -> Result<Option<SnapshotStream>> {
        let records = self.signatures.export_signatures()?;
        if records.is_empty() {
            debug!("No signature records to capture");
            return Ok(None);
        }
        let count = records.len();
        let data = serde_json::to_vec_pretty(&SignatureDocument::new(records))?;
        debug!("Captured {} signature records", count);
        Ok(Some(SnapshotStream::bytes(SIGNATURES_ENTRY, data)))
    }

    fn walk(&self, prefix: &str, root: &Path, since: Option<DateTime<Utc>>) -> Result<Vec<SnapshotStream>> {
        let mut streams = Vec::new();
        if !root.is_dir() {
            debug!("Tree {:?} not present, skipping", root);
            return Ok(streams);
        }
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e.path()));
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                if entry.file_type().is_symlink() {
                    trace!("Skipping symlink {:?}", entry.path());
                }
                continue;
            }
            if let Some(cutoff) = since {
                let modified: DateTime<Utc> = entry.metadata()?.modified()?.into();
                if modified <= cutoff {
                    continue;
                }
            }
            let relative = utils::make_relative(entry.path(), root)?;
            match logical_name(prefix, &relative) {
                Some(name) => streams.push(SnapshotStream::file(name, entry.path())),
                None => warn!("Skipping {:?}: path is not valid UTF-8", entry.path()),
            }
        }
        Ok(streams)
    }
}

/// Literal directory prefix of a glob, before its first wildcard component
fn glob_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    let components: Vec<&str> = pattern.split('/').collect();
    for (i, part) in components.iter().enumerate() {
        let is_last = i + 1 == components.len();
        if is_last || part.contains(['*', '?', '[', '{']) {
            break;
        }
        base.push(part);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceLayout;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FailingStore;

    impl SignatureStore for FailingStore {
        fn export_signatures(&self) -> Result<Vec<SignatureRecord>> {
            Err(BackupError::internal("store offline"))
        }

        fn import_signatures(&self, _records: &[SignatureRecord]) -> Result<usize> {
            Err(BackupError::internal("store offline"))
        }
    }

    struct MemoryStore(Mutex<Vec<SignatureRecord>>);

    impl SignatureStore for MemoryStore {
        fn export_signatures(&self) -> Result<Vec<SignatureRecord>> {
            Ok(self.0.lock().clone())
        }

        fn import_signatures(&self, records: &[SignatureRecord]) -> Result<usize> {
            *self.0.lock() = records.to_vec();
            Ok(records.len())
        }
    }

    fn record(id: i64) -> SignatureRecord {
        SignatureRecord {
            id,
            name: format!("Dr. {}", id),
            registration: Some(format!("CRM-{}", id)),
            signature_data: "data:image/png;base64,AAAA".to_string(),
        }
    }

    fn setup() -> (TempDir, SourceLayout) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("instance")).unwrap();
        fs::create_dir_all(root.join("templates/reports")).unwrap();
        fs::create_dir_all(root.join("utils")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::create_dir_all(root.join("backups")).unwrap();

        let conn = Connection::open(root.join("instance/app.db")).unwrap();
        conn.execute_batch(
            "CREATE TABLE patients (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO patients (name) VALUES ('Ana'), ('Bruno');",
        )
        .unwrap();
        drop(conn);

        fs::write(root.join("config.json"), b"{\"debug\": false}").unwrap();
        fs::write(root.join("templates/base.html"), b"<html>").unwrap();
        fs::write(root.join("templates/reports/exam.html"), b"<div>").unwrap();
        fs::write(root.join("utils/formulas.py"), b"def bsa(): pass").unwrap();
        fs::write(root.join("logs/app.log"), b"started").unwrap();
        fs::write(root.join("logs/notes.txt"), b"not a log").unwrap();

        let layout = SourceLayout::new(root, "instance/app.db")
            .with_config_file("config.json")
            .with_config_file("missing.env")
            .with_tree("templates", "templates", TreeCategory::Assets)
            .with_tree("utils", "utils", TreeCategory::Code)
            .with_log_pattern("logs/*.log");
        (temp_dir, layout)
    }

    fn names(streams: &[SnapshotStream]) -> Vec<&str> {
        streams.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_database_stream_is_consistent_copy() {
        let (temp_dir, layout) = setup();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        let stream = source.database_stream().unwrap();
        assert_eq!(stream.name, "database/app.db");
        assert!(stream.critical);

        let StreamSource::TempFile(file) = &stream.source else {
            panic!("database stream should be a scratch file");
        };
        let copy = Connection::open(file.path()).unwrap();
        let count: i64 = copy.query_row("SELECT COUNT(*) FROM patients", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_missing_database_is_unavailable() {
        let (temp_dir, mut layout) = setup();
        layout.database_path = PathBuf::from("instance/absent.db");
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        assert!(matches!(
            source.database_stream(),
            Err(BackupError::DatabaseUnavailable { .. })
        ));

        let captured = source
            .capture(CaptureRequest {
                kind: BackupKind::Full,
                since: None,
                allow_missing_database: true,
            })
            .unwrap();
        assert!(captured.skipped.iter().any(|s| s.starts_with("database")));
    }

    #[test]
    fn test_full_capture_contents() {
        let (temp_dir, layout) = setup();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let store = MemoryStore(Mutex::new(vec![record(1)]));
        let source = SnapshotSource::new(&layout, &config, &store, &scratch);

        let captured = source
            .capture(CaptureRequest {
                kind: BackupKind::Full,
                since: None,
                allow_missing_database: false,
            })
            .unwrap();
        let names = names(&captured.streams);
        assert_eq!(
            names,
            vec![
                "database/app.db",
                "config/config.json",
                "templates/base.html",
                "templates/reports/exam.html",
                "utils/formulas.py",
                SIGNATURES_ENTRY,
                "logs/app.log",
            ]
        );
    }

    #[test]
    fn test_config_capture_skips_assets() {
        let (temp_dir, layout) = setup();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        let captured = source
            .capture(CaptureRequest {
                kind: BackupKind::Config,
                since: None,
                allow_missing_database: false,
            })
            .unwrap();
        assert_eq!(names(&captured.streams), vec!["config/config.json", "utils/formulas.py"]);
    }

    #[test]
    fn test_signature_errors_are_skipped() {
        let (temp_dir, layout) = setup();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &FailingStore, &scratch);

        let captured = source
            .capture(CaptureRequest {
                kind: BackupKind::Data,
                since: None,
                allow_missing_database: false,
            })
            .unwrap();
        assert_eq!(names(&captured.streams), vec!["database/app.db"]);
        assert_eq!(captured.skipped.len(), 1);
    }

    #[test]
    fn test_modified_since_is_strict() {
        let (temp_dir, layout) = setup();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        let new = filetime::FileTime::from_unix_time(2_000_000, 0);
        for path in ["config.json", "templates/base.html", "templates/reports/exam.html", "utils/formulas.py"] {
            filetime::set_file_mtime(temp_dir.path().join(path), old).unwrap();
        }
        filetime::set_file_mtime(temp_dir.path().join("utils/formulas.py"), new).unwrap();

        let cutoff = DateTime::from_timestamp(1_000_000, 0).unwrap();
        let streams = source.modified_since(cutoff).unwrap();
        assert_eq!(names(&streams), vec!["utils/formulas.py"]);
    }

    #[test]
    fn test_scratch_dir_excluded_from_trees() {
        let (temp_dir, mut layout) = setup();
        layout.trees.push(TreeRoot {
            name: "instance".to_string(),
            path: PathBuf::from("."),
            category: TreeCategory::Assets,
        });
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        fs::write(scratch.join("old.zip"), b"zip").unwrap();
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        let streams = source.tree_streams(|t| t.name == "instance").unwrap();
        let names = names(&streams);
        assert!(!names.iter().any(|n| n.contains("backups/")));
        assert!(!names.iter().any(|n| n.ends_with("app.db")));
        assert!(names.contains(&"instance/config.json"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_captured() {
        let (temp_dir, layout) = setup();
        std::os::unix::fs::symlink(
            temp_dir.path().join("config.json"),
            temp_dir.path().join("templates/link.json"),
        )
        .unwrap();
        let config = BackupConfig::default();
        let scratch = temp_dir.path().join("backups");
        let source = SnapshotSource::new(&layout, &config, &NoSignatureStore, &scratch);

        let streams = source.tree_streams(|t| t.name == "templates").unwrap();
        assert!(!names(&streams).contains(&"templates/link.json"));
    }

    #[test]
    fn test_locate() {
        let layout = SourceLayout::new("/srv/app", "instance/app.db")
            .with_config_file("config.json")
            .with_tree("templates", "web/templates", TreeCategory::Assets)
            .with_artifacts_dir("pdfs");

        let db = locate(&layout, "database/app.db").unwrap();
        assert_eq!(db.category, StreamCategory::Database);
        assert_eq!(db.path, Some(PathBuf::from("/srv/app/instance/app.db")));

        let tree = locate(&layout, "templates/a/b.html").unwrap();
        assert_eq!(tree.category, StreamCategory::Tree(TreeCategory::Assets));
        assert_eq!(tree.path, Some(PathBuf::from("/srv/app/web/templates/a/b.html")));

        assert_eq!(
            locate(&layout, "config/config.json").unwrap().path,
            Some(PathBuf::from("/srv/app/config.json"))
        );
        assert_eq!(locate(&layout, SIGNATURES_ENTRY).unwrap().category, StreamCategory::Signatures);
        assert_eq!(locate(&layout, "logs/app.log").unwrap().category, StreamCategory::Log);
        assert!(locate(&layout, "templates/../../etc/passwd").is_none());
        assert!(locate(&layout, "unknown/file").is_none());
    }

    #[test]
    fn test_json_file_signature_store_merges() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileSignatureStore::new(temp_dir.path().join("signatures.json"));
        assert!(store.export_signatures().unwrap().is_empty());

        store.import_signatures(&[record(1), record(2)]).unwrap();
        let mut updated = record(2);
        updated.signature_data = "new".to_string();
        store.import_signatures(&[updated]).unwrap();

        let records = store.export_signatures().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].signature_data, "new");
    }

    #[test]
    fn test_glob_base() {
        assert_eq!(glob_base("logs/*.log"), PathBuf::from("logs"));
        assert_eq!(glob_base("var/log/app-*.log"), PathBuf::from("var/log"));
        assert_eq!(glob_base("*.log"), PathBuf::new());
        assert_eq!(glob_base("logs/**/*.log"), PathBuf::from("logs"));
    }
}
