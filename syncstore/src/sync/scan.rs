use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::block::hash_block;
use crate::error::{Error, Result};
use crate::sync::index::is_index_file;

pub(crate) const DOWNLOAD_SUFFIX: &str = ".sync-tmp";

/// A regular file of the synced directory and the hashes of its blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub path: PathBuf,
    pub block_hash_list: Vec<String>,
}

/// Splits `data` into `block_size` chunks; the last one may be shorter. Empty
/// input has no blocks.
pub fn split_blocks(data: &[u8], block_size: usize) -> Vec<&[u8]> {
    data.chunks(block_size).collect()
}

pub fn read_blocks(path: &Path, block_size: usize) -> Result<Vec<Vec<u8>>> {
    let data = fs::read(path)?;
    Ok(split_blocks(&data, block_size)
        .into_iter()
        .map(<[u8]>::to_vec)
        .collect())
}

/// Names the synchronizer is willing to create inside the base directory.
pub fn valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !is_index_file(name)
        && !name.ends_with(DOWNLOAD_SUFFIX)
}

/// Hashes every top-level regular file of `base_dir`.
pub fn scan_dir(base_dir: &Path, block_size: usize) -> Result<BTreeMap<String, LocalFile>> {
    if block_size == 0 {
        return Err(Error::Config("block size must be positive".to_string()));
    }
    let mut files = BTreeMap::new();
    for dir_entry in fs::read_dir(base_dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = dir_entry.file_name().to_str().map(str::to_string) else {
            log::warn!("skipping non UTF-8 file name {:?}", dir_entry.file_name());
            continue;
        };
        if !valid_filename(&name) {
            continue;
        }
        let path = dir_entry.path();
        let data = fs::read(&path)?;
        let block_hash_list = split_blocks(&data, block_size)
            .into_iter()
            .map(hash_block)
            .collect();
        files.insert(
            name.clone(),
            LocalFile {
                name,
                path,
                block_hash_list,
            },
        );
    }
    Ok(files)
}
