//! Zip container for backups
//!
//! Every backup is a single zip archive (deflate) holding one entry per
//! snapshot stream plus the manifest under [`MANIFEST_ENTRY`], written last.
//! Next to each archive sits a sidecar `<archive>.sha256` in `sha256sum`
//! format recording the checksum of the finished archive bytes.
//!
//! ## Write protocol
//!
//! 1. A hidden temp file (`.backup-*.zip.tmp`) is created in the destination
//!    directory.
//! 2. Streams are copied in with `io::copy`, hashed in the same pass.
//! 3. The manifest is filled with per-stream sizes and checksums and written.
//! 4. The file is fsynced, hashed, and renamed into place without clobbering.
//! 5. The sidecar is written.
//!
//! Any failure before the rename drops the temp file, so a partial archive is
//! never visible under a backup name.
//!
//! ## Reading
//!
//! [`ArchiveReader`] wraps an open archive for repeated entry access.
//! Reading an entry to its end checks the entry's CRC-32, which is what
//! [`ArchiveCodec::verify_container`] relies on.

use crate::error::{BackupError, Result};
use crate::manifest::{BackupManifest, MANIFEST_ENTRY};
use crate::snapshot::{SnapshotStream, StreamSource};
use crate::types::CancellationToken;
use crate::utils::{self, safe_relative_path, HashingReader};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Extension of the checksum sidecar
pub const SIDECAR_EXTENSION: &str = "sha256";

/// Prefix of in-progress archive files
pub const TEMP_PREFIX: &str = ".backup-";

/// Entry sizes at or above this need zip64 records
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// One entry of an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry name
    pub name: String,
    /// Uncompressed size
    pub size: u64,
    /// Stored size
    pub compressed_size: u64,
}

/// Result of writing an archive
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    /// Final archive path
    pub path: PathBuf,
    /// Archive size on disk
    pub size_bytes: u64,
    /// SHA-256 of the archive bytes
    pub checksum: String,
    /// Manifest as written
    pub manifest: BackupManifest,
}

/// Path of the checksum sidecar for an archive
pub fn sidecar_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Record an archive checksum in its sidecar
pub fn write_sidecar(archive: &Path, checksum: &str) -> Result<()> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BackupError::InvalidPath(format!("{:?} has no file name", archive)))?;
    let line = format!("{}  {}\n", checksum, file_name);
    utils::atomic_write(&sidecar_path(archive), line.as_bytes())
}

/// Read the recorded checksum of an archive
///
/// Returns `None` when there is no sidecar.
///
/// # Errors
///
/// - [`BackupError::CorruptArchive`] if the sidecar does not start with a
///   64-character hex digest
pub fn read_sidecar(archive: &Path) -> Result<Option<String>> {
    let content = match fs::read_to_string(sidecar_path(archive)) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let digest = content.split_whitespace().next().unwrap_or_default();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BackupError::corrupt(archive, "checksum sidecar is malformed"));
    }
    Ok(Some(digest.to_ascii_lowercase()))
}

/// Whether an entry name is acceptable for a stream
fn validate_stream_name(name: &str) -> Result<()> {
    if name == MANIFEST_ENTRY {
        return Err(BackupError::InvalidStream(format!("'{}' is reserved", name)));
    }
    if name.starts_with('/') || name.ends_with('/') || safe_relative_path(name).is_none() {
        return Err(BackupError::InvalidStream(format!("'{}' is not a safe entry name", name)));
    }
    Ok(())
}

/// An open archive
pub struct ArchiveReader {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl ArchiveReader {
    /// Open an archive
    ///
    /// # Errors
    ///
    /// - [`BackupError::NotFound`] if the file does not exist
    /// - [`BackupError::CorruptArchive`] if it is not a readable zip
    pub fn open(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let archive = ZipArchive::new(file)
            .map_err(|e| BackupError::corrupt(path, format!("not a readable archive: {}", e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
        })
    }

    /// Archive path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries, manifest included
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    /// Whether the archive has no entries at all
    pub fn is_empty(&self) -> bool {
        self.archive.is_empty()
    }

    /// Whether an entry exists
    pub fn contains(&self, name: &str) -> bool {
        self.archive.file_names().any(|n| n == name)
    }

    /// Names and sizes of all entries, without decompressing
    pub fn entries(&mut self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let file = self.archive.by_index_raw(i)?;
            entries.push(ArchiveEntry {
                name: file.name().to_string(),
                size: file.size(),
                compressed_size: file.compressed_size(),
            });
        }
        Ok(entries)
    }

    /// Parse the embedded manifest
    ///
    /// # Errors
    ///
    /// - [`BackupError::CorruptArchive`] if the manifest is missing,
    ///   unreadable, or not valid JSON
    pub fn read_manifest(&mut self) -> Result<BackupManifest> {
        let path = self.path.clone();
        let mut entry = match self.archive.by_name(MANIFEST_ENTRY) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(BackupError::corrupt(&path, "manifest missing"))
            }
            Err(e) => return Err(BackupError::corrupt(&path, format!("manifest unreadable: {}", e))),
        };
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| BackupError::corrupt(&path, format!("manifest unreadable: {}", e)))?;
        serde_json::from_slice(&data)
            .map_err(|e| BackupError::corrupt(&path, format!("manifest is not valid JSON: {}", e)))
    }

    /// Copy an entry's bytes into a writer, returning the byte count
    pub fn copy_entry(&mut self, name: &str, writer: &mut dyn Write) -> Result<u64> {
        let path = self.path.clone();
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(BackupError::corrupt(&path, format!("entry '{}' missing", name)))
            }
            Err(e) => return Err(e.into()),
        };
        io::copy(&mut entry, writer)
            .map_err(|e| BackupError::corrupt(&path, format!("entry '{}' unreadable: {}", name, e)))
    }

    /// Read a whole entry into memory
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.copy_entry(name, &mut data)?;
        Ok(data)
    }

    /// SHA-256 and size of an entry's bytes
    pub fn hash_entry(&mut self, name: &str) -> Result<(String, u64)> {
        let path = self.path.clone();
        let entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => {
                return Err(BackupError::corrupt(&path, format!("entry '{}' missing", name)))
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = HashingReader::new(entry);
        io::copy(&mut reader, &mut io::sink())
            .map_err(|e| BackupError::corrupt(&path, format!("entry '{}' unreadable: {}", name, e)))?;
        Ok(reader.finish())
    }

    /// Read every entry to its end so each CRC-32 is checked
    pub fn test_all(&mut self) -> Result<()> {
        let path = self.path.clone();
        for i in 0..self.archive.len() {
            let mut entry = self
                .archive
                .by_index(i)
                .map_err(|e| BackupError::corrupt(&path, format!("entry #{} unreadable: {}", i, e)))?;
            let name = entry.name().to_string();
            io::copy(&mut entry, &mut io::sink())
                .map_err(|e| BackupError::corrupt(&path, format!("entry '{}' failed its CRC check: {}", name, e)))?;
            trace!("Entry {} ok", name);
        }
        Ok(())
    }
}

/// Writes and reads backup archives
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    compression_level: u32,
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArchiveCodec {
    /// Codec writing at a deflate level (0 stores uncompressed)
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
        }
    }

    fn options(&self, large: bool) -> SimpleFileOptions {
        let options = SimpleFileOptions::default()
            .unix_permissions(0o644)
            .large_file(large);
        if self.compression_level == 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.compression_level)))
        }
    }

    /// Write streams and manifest into a new archive at `dest`
    ///
    /// # Arguments
    ///
    /// * `dest` - Final archive path; must not exist
    /// * `streams` - Payloads in write order
    /// * `manifest` - Manifest to complete with stream sizes and checksums
    /// * `cancel` - Checked before each stream
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidStream`] for duplicate, reserved or unsafe names
    /// - [`BackupError::Cancelled`] if cancellation was requested
    /// - [`BackupError::Io`] if a critical stream or the destination fails
    ///
    /// On error no file is left at `dest` and no temp file remains.
    pub fn write(
        &self,
        dest: &Path,
        streams: Vec<SnapshotStream>,
        mut manifest: BackupManifest,
        cancel: &CancellationToken,
    ) -> Result<ArchiveSummary> {
        let dir = dest
            .parent()
            .ok_or_else(|| BackupError::InvalidPath(format!("{:?} has no parent directory", dest)))?;
        if dest.exists() {
            return Err(BackupError::InvalidPath(format!("{:?} already exists", dest)));
        }

        let mut seen = HashSet::new();
        for stream in &streams {
            validate_stream_name(&stream.name)?;
            if !seen.insert(stream.name.as_str()) {
                return Err(BackupError::InvalidStream(format!("'{}' appears twice", stream.name)));
            }
        }

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".zip.tmp")
            .tempfile_in(dir)?;
        debug!("Writing {} streams to {:?}", streams.len(), temp.path());

        {
            let mut zip = ZipWriter::new(temp.as_file());
            for stream in &streams {
                cancel.check()?;

                let reader = match stream.open() {
                    Ok(reader) => reader,
                    Err(e) if !stream.critical && e.kind() == io::ErrorKind::NotFound => {
                        warn!("Stream {} vanished before it was written, skipping", stream.name);
                        manifest.skipped.push(format!("{}: {}", stream.name, e));
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                zip.start_file(stream.name.as_str(), self.options(stream_len(stream) >= ZIP64_THRESHOLD))?;
                let mut hashing = HashingReader::new(reader);
                io::copy(&mut hashing, &mut zip)?;
                let (digest, size) = hashing.finish();
                trace!("Stream {} ({} bytes) {}", stream.name, size, digest);
                manifest.record_stream(&stream.name, size, digest);
            }

            cancel.check()?;
            let manifest_json = serde_json::to_vec_pretty(&manifest)?;
            zip.start_file(MANIFEST_ENTRY, self.options(false))?;
            zip.write_all(&manifest_json)?;
            zip.finish()?.sync_all()?;
        }

        let checksum = utils::hash_file_content(temp.path())?;
        let size_bytes = temp.as_file().metadata()?.len();
        temp.persist_noclobber(dest).map_err(|e| e.error)?;

        if let Err(e) = write_sidecar(dest, &checksum) {
            fs::remove_file(dest).ok();
            return Err(e);
        }

        info!(
            "Archive {:?} written: {} streams, {}",
            dest,
            manifest.streams.len(),
            utils::format_bytes(size_bytes)
        );
        Ok(ArchiveSummary {
            path: dest.to_path_buf(),
            size_bytes,
            checksum,
            manifest,
        })
    }

    /// Entry names and sizes without extracting
    pub fn list_entries(path: &Path) -> Result<Vec<ArchiveEntry>> {
        ArchiveReader::open(path)?.entries()
    }

    /// Parse an archive's manifest
    pub fn read_manifest(path: &Path) -> Result<BackupManifest> {
        ArchiveReader::open(path)?.read_manifest()
    }

    /// Extract one entry to `dest`, creating parent directories
    pub fn extract(path: &Path, name: &str, dest: &Path) -> Result<u64> {
        let mut reader = ArchiveReader::open(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(dest)?;
        let written = reader.copy_entry(name, &mut file)?;
        file.sync_all()?;
        Ok(written)
    }

    /// Extract every entry below `dest_dir`
    ///
    /// # Errors
    ///
    /// - [`BackupError::InvalidPath`] if an entry name would escape `dest_dir`
    pub fn extract_all(path: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let reader = ArchiveReader::open(path)?;
        let mut archive = reader.archive;
        let mut written = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let relative = safe_relative_path(entry.name()).ok_or_else(|| {
                BackupError::InvalidPath(format!("entry '{}' escapes the destination", entry.name()))
            })?;
            let target = dest_dir.join(relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&target)?;
            io::copy(&mut entry, &mut file)
                .map_err(|e| BackupError::corrupt(path, format!("entry '{}' unreadable: {}", entry.name(), e)))?;
            written.push(target);
        }
        Ok(written)
    }

    /// Check every entry's CRC-32 by reading it to the end
    pub fn verify_container(path: &Path) -> Result<()> {
        ArchiveReader::open(path)?.test_all()
    }
}

fn stream_len(stream: &SnapshotStream) -> u64 {
    match &stream.source {
        StreamSource::File(path) => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        StreamSource::Bytes(data) => data.len() as u64,
        StreamSource::TempFile(file) => file.as_file().metadata().map(|m| m.len()).unwrap_or(0),
    }
}
