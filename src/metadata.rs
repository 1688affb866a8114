//! Content-addressed metadata for mirrored files.
//!
//! Every file the mirror writes is hashed and described by a
//! [`FileMetadata`] record. Records are kept in a [`MetadataIndex`] keyed by
//! the SHA-256 of the file bytes and saved as pretty JSON next to the
//! mirror, so the loader can recover each file's Drive id and URL.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use crate::drive_tree::DriveFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Local path of the file as written.
    pub source: String,
    pub filename: String,
    /// Lower-cased, with the leading dot; empty when there is none.
    pub extension: String,
    pub created_date: String,
    pub modified_date: String,
    pub relative_path: String,
    /// `.` for files at the top of the mirror.
    pub parent_directory: String,
    pub file_hash: String,
    pub mime_type: String,
    pub processing_date: String,
    pub google_drive_url: String,
    pub google_drive_id: String,
}

/// Streaming SHA-256 of a file, lower-case hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `/`-joined path of `path` below `base`.
pub fn relative_to(path: &Path, base: &Path) -> Result<String> {
    let rel = path.strip_prefix(base).with_context(|| {
        format!("{} is outside {}", path.display(), base.display())
    })?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Describe the file at `path`, which was fetched from `file` into the
/// mirror rooted at `base`.
pub fn extract_metadata(path: &Path, base: &Path, file: &DriveFile) -> Result<FileMetadata> {
    let stat = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let modified = stat.modified()?;
    let created = stat.created().unwrap_or(modified);

    let relative_path = relative_to(path, base)?;
    let parent_directory = match relative_path.rsplit_once('/') {
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    };
    let extension = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    let mime_type = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("unknown")
        .to_string();

    Ok(FileMetadata {
        source: path.display().to_string(),
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        extension,
        created_date: rfc3339(created),
        modified_date: rfc3339(modified),
        relative_path,
        parent_directory,
        file_hash: hash_file(path)?,
        mime_type,
        processing_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        google_drive_url: file.google_drive_url.clone(),
        google_drive_id: file.id.clone(),
    })
}

/// `file_hash → FileMetadata`, ordered by hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataIndex {
    entries: BTreeMap<String, FileMetadata>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the record's own hash. A record with the same content
    /// replaces the earlier one.
    pub fn insert(&mut self, meta: FileMetadata) -> Option<FileMetadata> {
        self.entries.insert(meta.file_hash.clone(), meta)
    }

    pub fn get(&self, file_hash: &str) -> Option<&FileMetadata> {
        self.entries.get(file_hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileMetadata> {
        self.entries.values()
    }

    /// Pretty JSON with four-space indentation.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        std::fs::write(path, buf)
            .with_context(|| format!("failed to write metadata index {}", path.display()))
    }

    /// Load an index; a missing file is an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("invalid metadata index {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Delete a saved index, if there is one.
    pub fn remove_file(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}
