//! Client synchronizer
//!
//! One pass reconciles a local directory with the replicated index: local edits
//! and deletions are proposed to the leader, remote changes are pulled, and a
//! rejected proposal is resolved by taking the committed version.

pub mod index;
pub mod scan;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::block::{hash_block, BlockStore};
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::metadata::{FileInfoMap, FileMetadata};
use crate::raft_client::RemoteNode;
use crate::raft_service::RaftService;

pub use index::{load_index, LocalIndex, INDEX_FILENAME};
pub use scan::{scan_dir, split_blocks, LocalFile};

/// What one pass did, by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Local creations, edits and deletions committed by the cluster.
    pub uploaded: Vec<String>,
    /// Remote versions written into the directory.
    pub downloaded: Vec<String>,
    /// Local files removed because the cluster holds a tombstone.
    pub deleted: Vec<String>,
    /// Local changes that lost to an already committed version.
    pub conflicts: Vec<String>,
    /// Files left as they were, with the reason.
    pub failed: Vec<(String, String)>,
}

pub struct Synchronizer {
    servers: Vec<Arc<dyn RaftService>>,
    blocks: Arc<dyn BlockStore>,
    base_dir: PathBuf,
    block_size: usize,
}

impl Synchronizer {
    pub fn new(
        servers: Vec<Arc<dyn RaftService>>,
        blocks: Arc<dyn BlockStore>,
        base_dir: impl Into<PathBuf>,
        block_size: usize,
    ) -> Self {
        Synchronizer {
            servers,
            blocks,
            base_dir: base_dir.into(),
            block_size,
        }
    }

    /// Runs one reconciliation pass
    ///
    /// This method:
    /// 1. Loads the local index and scans the directory
    /// 2. Fetches the committed file map from the first server that leads
    /// 3. Proposes local creations, edits and deletions at cached version + 1
    /// 4. Pulls remote versions newer than the index
    /// 5. Saves the index
    ///
    /// # Returns
    ///
    /// What happened to each touched file. Fails only if no leader answers or
    /// the directory cannot be read or written; per-file failures are reported.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut index = LocalIndex::load(&self.base_dir)?;
        let local = scan_dir(&self.base_dir, self.block_size)?;
        let (leader, remote) = self.find_leader().await?;
        let mut report = SyncReport::default();

        for (name, file) in &local {
            let cached = index.get(name).cloned();
            let remote_meta = remote.get(name);
            let unchanged = cached
                .as_ref()
                .map_or(false, |c| !c.tombstone && c.block_hash_list == file.block_hash_list);
            if unchanged {
                if let Some(r) = remote_meta {
                    if cached.as_ref().map_or(true, |c| r.version > c.version) {
                        self.pull(r.clone(), &mut index, &mut report).await;
                    }
                }
                continue;
            }
            if let Some(r) = remote_meta {
                if !r.tombstone && r.block_hash_list == file.block_hash_list {
                    log::debug!("{} already matches remote v{}", name, r.version);
                    index.insert(r.clone());
                    continue;
                }
            }
            // a file never seen here builds on the remote tombstone, if any
            let base = match (&cached, remote_meta) {
                (Some(c), _) => c.version,
                (None, Some(r)) if r.tombstone => r.version,
                (None, _) => 0,
            };
            let version = base + 1;
            let meta = FileMetadata::new(name.clone(), version, file.block_hash_list.clone());
            self.push(leader.as_ref(), meta, Some(file), &mut index, &mut report)
                .await;
        }

        let removed: Vec<FileMetadata> = index
            .files()
            .values()
            .filter(|c| !c.tombstone && !local.contains_key(&c.filename))
            .cloned()
            .collect();
        for cached in removed {
            let meta = FileMetadata::tombstone(cached.filename.clone(), cached.version + 1);
            self.push(leader.as_ref(), meta, None, &mut index, &mut report)
                .await;
        }

        for (name, r) in &remote {
            if local.contains_key(name) || !scan::valid_filename(name) {
                continue;
            }
            let cached = index.get(name);
            if r.tombstone && cached.is_none() {
                // deleted before this directory ever held it
                index.insert(r.clone());
                continue;
            }
            if cached.map_or(true, |c| r.version > c.version) {
                self.pull(r.clone(), &mut index, &mut report).await;
            }
        }

        index.save(&self.base_dir)?;
        log::info!(
            "sync of {} done: {} uploaded, {} downloaded, {} deleted, {} conflicts, {} failed",
            self.base_dir.display(),
            report.uploaded.len(),
            report.downloaded.len(),
            report.deleted.len(),
            report.conflicts.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// First configured server that serves the file map; used for the whole pass.
    async fn find_leader(&self) -> Result<(Arc<dyn RaftService>, FileInfoMap)> {
        let mut last_error = Error::Unavailable("no servers configured".to_string());
        for (id, server) in self.servers.iter().enumerate() {
            match server.get_file_info_map().await {
                Ok(map) => {
                    log::debug!("node {} answers as leader with {} files", id, map.len());
                    return Ok((server.clone(), map));
                }
                Err(e) => {
                    log::debug!("node {} cannot serve the file map: {}", id, e);
                    last_error = e;
                }
            }
        }
        Err(Error::Unavailable(format!(
            "no leader reachable, last error: {}",
            last_error
        )))
    }

    async fn push(
        &self,
        leader: &dyn RaftService,
        meta: FileMetadata,
        file: Option<&LocalFile>,
        index: &mut LocalIndex,
        report: &mut SyncReport,
    ) {
        let name = meta.filename.clone();
        let result: Result<u64> = async {
            if let Some(file) = file {
                self.upload_blocks(file).await?;
            }
            leader.update_file(meta.clone()).await
        }
        .await;
        match result {
            Ok(version) => {
                log::info!("{} committed as v{}", name, version);
                index.insert(FileMetadata { version, ..meta });
                report.uploaded.push(name);
            }
            Err(Error::VersionConflict(current)) => {
                log::info!("{} lost to committed v{}", name, current.version);
                report.conflicts.push(name);
                self.pull(*current, index, report).await;
            }
            Err(e) if e.is_retryable() => {
                log::info!("{} not synced, will retry next pass: {}", name, e);
                report.failed.push((name, e.to_string()));
            }
            Err(e) => {
                log::warn!("cannot sync {}: {}", name, e);
                report.failed.push((name, e.to_string()));
            }
        }
    }

    async fn upload_blocks(&self, file: &LocalFile) -> Result<()> {
        let present: HashSet<String> = self
            .blocks
            .has_blocks(&file.block_hash_list)
            .await?
            .into_iter()
            .collect();
        let blocks = scan::read_blocks(&file.path, self.block_size)?;
        if blocks.len() != file.block_hash_list.len() {
            return Err(Error::Io(format!("{} changed during sync", file.name)));
        }
        let mut sent = HashSet::new();
        for (expected, data) in file.block_hash_list.iter().zip(blocks) {
            if present.contains(expected) || sent.contains(expected) {
                continue;
            }
            let stored = self.blocks.put_block(data).await?;
            if stored != *expected {
                return Err(Error::Io(format!("{} changed during sync", file.name)));
            }
            sent.insert(stored);
        }
        log::debug!("{}: uploaded {} new blocks", file.name, sent.len());
        Ok(())
    }

    /// Makes the local copy match `meta` and records it in the index.
    async fn pull(&self, meta: FileMetadata, index: &mut LocalIndex, report: &mut SyncReport) {
        let name = meta.filename.clone();
        match self.materialize(&meta).await {
            Ok(()) => {
                if meta.tombstone {
                    report.deleted.push(name);
                } else {
                    report.downloaded.push(name);
                }
                index.insert(meta);
            }
            Err(e) => {
                log::warn!("cannot fetch {} v{}: {}", name, meta.version, e);
                report.failed.push((name, e.to_string()));
            }
        }
    }

    async fn materialize(&self, meta: &FileMetadata) -> Result<()> {
        if !scan::valid_filename(&meta.filename) {
            return Err(Error::Io(format!("refusing file name {:?}", meta.filename)));
        }
        let path = self.base_dir.join(&meta.filename);
        if meta.tombstone {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let mut content = Vec::new();
        for hash in &meta.block_hash_list {
            let block = self.blocks.get_block(hash).await?;
            if hash_block(&block) != *hash {
                return Err(Error::MissingBlock(hash.clone()));
            }
            content.extend_from_slice(&block);
        }
        write_atomically(&self.base_dir, &meta.filename, &content)
    }
}

fn write_atomically(base_dir: &Path, filename: &str, content: &[u8]) -> Result<()> {
    let temp_path = base_dir.join(format!("{}{}", filename, scan::DOWNLOAD_SUFFIX));
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, base_dir.join(filename))?;
    Ok(())
}

/// One reconciliation pass of `base_dir` against the cluster described by `config`
///
/// # Arguments
///
/// * `block_addr` - Address of the block server
/// * `base_dir` - Directory to reconcile; holds the local index
/// * `block_size` - Chunk size in bytes used to split files
/// * `config` - Node addresses and the client timeout
pub async fn sync_client<P: AsRef<Path>>(
    block_addr: &str,
    base_dir: P,
    block_size: usize,
    config: &ClusterConfig,
) -> Result<SyncReport> {
    let blocks = Arc::new(RemoteNode::new(block_addr, config.client_timeout()));
    Synchronizer::new(
        config.remote_services(),
        blocks,
        base_dir.as_ref(),
        block_size,
    )
    .sync()
    .await
}
