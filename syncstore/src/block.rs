//! Content-addressed block storage.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Lowercase hex SHA-256 of a block.
pub fn hash_block(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Returns the subset of `hashes` the store holds, in request order.
    async fn has_blocks(&self, hashes: &[String]) -> Result<Vec<String>>;

    async fn get_block(&self, hash: &str) -> Result<Vec<u8>>;

    /// Stores the block and returns the hash it is addressed by.
    async fn put_block(&self, data: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct MemBlockStore {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::Unavailable("block store lock poisoned".to_string())
}

#[async_trait]
impl BlockStore for MemBlockStore {
    async fn has_blocks(&self, hashes: &[String]) -> Result<Vec<String>> {
        let blocks = self.blocks.lock().map_err(poisoned)?;
        Ok(hashes
            .iter()
            .filter(|h| blocks.contains_key(*h))
            .cloned()
            .collect())
    }

    async fn get_block(&self, hash: &str) -> Result<Vec<u8>> {
        let blocks = self.blocks.lock().map_err(poisoned)?;
        blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::MissingBlock(hash.to_string()))
    }

    async fn put_block(&self, data: Vec<u8>) -> Result<String> {
        let hash = hash_block(&data);
        log::debug!("put block {} ({} bytes)", hash, data.len());
        self.blocks
            .lock()
            .map_err(poisoned)?
            .insert(hash.clone(), data);
        Ok(hash)
    }
}
