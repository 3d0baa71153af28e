//! File metadata and the store committed log entries are applied to.

use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type FileInfoMap = BTreeMap<String, FileMetadata>;

/// Metadata for one file in the replicated index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileMetadata {
    pub filename: String,
    pub version: u64,
    pub block_hash_list: Vec<String>,
    pub tombstone: bool,
}

impl FileMetadata {
    pub fn new(filename: impl Into<String>, version: u64, block_hash_list: Vec<String>) -> Self {
        FileMetadata {
            filename: filename.into(),
            version,
            block_hash_list,
            tombstone: false,
        }
    }

    pub fn tombstone(filename: impl Into<String>, version: u64) -> Self {
        FileMetadata {
            filename: filename.into(),
            version,
            block_hash_list: Vec::new(),
            tombstone: true,
        }
    }

    /// The record standing in for a file the store has never seen.
    pub fn absent(filename: impl Into<String>) -> Self {
        Self::tombstone(filename, 0)
    }
}

/// Durable filename -> metadata mapping with single-key compare-and-set.
pub trait MetaStore: Send + Sync {
    fn get(&self, filename: &str) -> Option<FileMetadata>;

    /// Stores `meta` only if its version is exactly one past the stored version
    /// (a missing file counts as version 0). On mismatch the current record is returned.
    fn compare_and_set(&mut self, meta: FileMetadata) -> Result<(), FileMetadata>;

    fn snapshot(&self) -> FileInfoMap;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryMetaStore {
    files: FileInfoMap,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaStore for InMemoryMetaStore {
    fn get(&self, filename: &str) -> Option<FileMetadata> {
        self.files.get(filename).cloned()
    }

    fn compare_and_set(&mut self, meta: FileMetadata) -> Result<(), FileMetadata> {
        let current = self
            .files
            .get(&meta.filename)
            .cloned()
            .unwrap_or_else(|| FileMetadata::absent(meta.filename.clone()));
        if meta.version != current.version + 1 {
            return Err(current);
        }
        self.files.insert(meta.filename.clone(), meta);
        Ok(())
    }

    fn snapshot(&self) -> FileInfoMap {
        self.files.clone()
    }
}
