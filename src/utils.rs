//! Utility functions for backstop
//!
//! Checksumming, path helpers and small file operations shared by the archive
//! codec, the snapshot sources and the restore journal.
//!
//! ## Checksums
//!
//! All digests are SHA-256 rendered as 64 lowercase hex characters. Files are
//! always hashed in fixed-size chunks; nothing here loads a whole file into
//! memory.
//!
//! ```rust,ignore
//! use crate::utils::{hash_file_content, hash_data};
//! use std::path::Path;
//!
//! let file_hash = hash_file_content(Path::new("instance/app.db"))?;
//! assert_eq!(file_hash.len(), 64);
//! assert_eq!(hash_data(b"abc"), hash_data(b"abc"));
//! ```
//!
//! ## Logical names
//!
//! Archive entry names always use `/` separators regardless of platform.
//! [`logical_name`] builds them from a relative path and [`safe_relative_path`]
//! turns an entry name back into a relative path, refusing anything that could
//! escape the destination directory.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use sysinfo::Disks;

/// Chunk size used for streaming reads
pub const HASH_CHUNK_SIZE: usize = 8192;

/// Hash a file's content using SHA-256
///
/// Reads the file in 8KB chunks and returns the digest as a 64-character
/// hexadecimal string.
///
/// # Errors
///
/// - [`BackupError::Io`] if the file cannot be opened or read
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Reader adapter that hashes and counts every byte read through it
///
/// Lets the archive writer compute a stream's checksum in the same pass that
/// copies it into the container.
pub struct HashingReader<R: Read> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Consume the adapter, returning (hex digest, bytes read)
    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Last modification time of a path as UTC, without following symlinks
pub fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = fs::symlink_metadata(path)?;
    Ok(metadata.modified()?.into())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symlinked paths keep their spelling, and
/// falls back to canonicalising both sides.
///
/// # Errors
///
/// - [`BackupError::InvalidPath`] if the path is not under the base path
/// - [`BackupError::Io`] if canonicalization fails (fallback case only)
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            BackupError::InvalidPath(format!(
                "{:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Build an archive entry name from a prefix and a relative path
///
/// Components are joined with `/`. Returns `None` for paths containing
/// anything but normal components.
pub fn logical_name(prefix: &str, relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    if !prefix.is_empty() {
        parts.push(prefix.to_string());
    }
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.len() <= usize::from(!prefix.is_empty()) {
        return None;
    }
    Some(parts.join("/"))
}

/// Turn the remainder of an entry name into a relative path
///
/// Rejects empty names, absolute paths, `..` and platform prefixes.
pub fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part if part.contains('\\') || part.contains(':') => return None,
            part => path.push(part),
        }
    }
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Format bytes in human-readable form (1024-based units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Atomic file write (write to temp file then rename)
///
/// The target is either fully written or untouched.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        fs::remove_file(&temp_path).ok();
        return Err(e.into());
    }

    Ok(())
}

/// Bytes available on the disk holding `path`
///
/// Picks the mounted disk with the longest mount point containing the
/// canonical path. Returns `None` when the path does not exist or no listed
/// disk contains it (pseudo file systems such as tmpfs are not listed).
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
