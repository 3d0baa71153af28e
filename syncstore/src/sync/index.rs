//! The client's record of what each file looked like at its last successful sync.

use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Result;
use crate::metadata::{FileInfoMap, FileMetadata};

pub const INDEX_FILENAME: &str = "index.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalIndex {
    files: FileInfoMap,
}

impl LocalIndex {
    /// A missing index file is an empty index.
    pub fn load<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let path = base_dir.as_ref().join(INDEX_FILENAME);
        match fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the index file atomically.
    pub fn save<P: AsRef<Path>>(&self, base_dir: P) -> Result<()> {
        let base_dir = base_dir.as_ref();
        let data = serde_json::to_vec_pretty(self)?;
        let temp_path = base_dir.join(format!("{}.tmp", INDEX_FILENAME));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&temp_path, base_dir.join(INDEX_FILENAME))?;
        Ok(())
    }

    pub fn get(&self, filename: &str) -> Option<&FileMetadata> {
        self.files.get(filename)
    }

    pub fn insert(&mut self, meta: FileMetadata) {
        self.files.insert(meta.filename.clone(), meta);
    }

    pub fn files(&self) -> &FileInfoMap {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Reads the index of `base_dir` as a plain map.
pub fn load_index<P: AsRef<Path>>(base_dir: P) -> Result<FileInfoMap> {
    Ok(LocalIndex::load(base_dir)?.files)
}

pub(crate) fn is_index_file(name: &str) -> bool {
    name == INDEX_FILENAME || name == format!("{}.tmp", INDEX_FILENAME)
}
