//! Resumable upload records.
//!
//! A record remembers which blocks of a file the backend already acknowledged,
//! so an interrupted chunked upload picks up where it stopped.

use crate::domains::write_atomically;
use crate::error::{ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Identity of the local data a record was written for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time, epoch milliseconds
    pub modified: i64,
    pub block_size: u64,
}

impl Fingerprint {
    pub fn of_file(path: &Path, block_size: u64) -> Result<Self> {
        let metadata = fs::metadata(path).context("Failed to stat upload source")?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |since| since.as_millis() as i64);
        Ok(Self {
            size: metadata.len(),
            modified,
            block_size,
        })
    }
}

/// A block the backend acknowledged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    /// URL-safe base64 SHA-1 of the block
    pub checksum: String,
    pub ctx: String,
    pub host: String,
    /// Epoch seconds
    pub expired_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSessionRecord {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub blocks: Vec<Block>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSessionRecord {
    pub fn new(id: impl Into<String>, fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            fingerprint,
            blocks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_block(&self, index: usize) -> bool {
        self.blocks.iter().any(|block| block.index == index)
    }

    /// Replaces any earlier acknowledgement of the same block
    pub fn push_block(&mut self, block: Block, now: DateTime<Utc>) {
        self.blocks.retain(|existing| existing.index != block.index);
        self.blocks.push(block);
        self.updated_at = now;
    }

    /// Removes blocks whose context is no longer valid, returns how many went
    pub fn drop_expired(&mut self, now_secs: i64) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|block| block.expired_at > now_secs);
        before - self.blocks.len()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.blocks.iter().map(|block| block.size).sum()
    }
}

/// Record id for a file and object key: hex SHA-256 of the canonical path and the key
pub fn record_id(path: &Path, key: Option<&str>) -> String {
    let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Storage for upload records. `save` must replace the record atomically.
pub trait RecordStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<UploadSessionRecord>>;
    fn save(&self, record: &UploadSessionRecord) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// One JSON file per record under a root directory
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

impl RecordStore for FileRecordStore {
    fn load(&self, id: &str) -> Result<Option<UploadSessionRecord>> {
        let path = self.path_for(id);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read upload record"),
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable upload record");
                Ok(None)
            }
        }
    }

    fn save(&self, record: &UploadSessionRecord) -> Result<()> {
        fs::create_dir_all(&self.root).context("Failed to create record directory")?;
        let content = serde_json::to_vec(record)?;
        write_atomically(&self.path_for(&record.id), &content)
    }

    fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete upload record"),
        }
    }
}
