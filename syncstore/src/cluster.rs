//! In-process cluster: nodes talk through direct calls instead of gRPC.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::block::{BlockStore, MemBlockStore};
use crate::error::{Error, Result};
use crate::metadata::{FileInfoMap, FileMetadata};
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest,
    InternalState, LogEntry, MemStorage, PeerSet, RaftConfig, RaftNode,
};
use crate::raft_service::RaftService;

#[derive(Default)]
struct Registry {
    nodes: RwLock<HashMap<u64, RaftNode>>,
}

impl Registry {
    fn get(&self, id: u64) -> Result<RaftNode> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| Error::Unavailable("cluster registry poisoned".to_string()))?;
        nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("node {} is not registered", id)))
    }
}

/// Handle to one node of a [`LocalCluster`]. Holds the registry weakly so the
/// cluster can be dropped while handles are still around.
#[derive(Clone)]
pub struct LocalPeer {
    id: u64,
    registry: Weak<Registry>,
}

impl LocalPeer {
    fn node(&self) -> Result<RaftNode> {
        self.registry
            .upgrade()
            .ok_or_else(|| Error::Unavailable("cluster shut down".to_string()))?
            .get(self.id)
    }
}

#[async_trait]
impl RaftService for LocalPeer {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        self.node()?.append_entries(req).await
    }

    async fn claim_leadership(&self, req: ClaimRequest) -> Result<ClaimReply> {
        self.node()?.claim_leadership(req).await
    }

    async fn fetch_entries(&self, req: FetchRequest) -> Result<Vec<LogEntry>> {
        self.node()?.fetch_entries(req).await
    }

    async fn update_file(&self, meta: FileMetadata) -> Result<u64> {
        self.node()?.update_file(meta).await
    }

    async fn get_file_info_map(&self) -> Result<FileInfoMap> {
        self.node()?.get_file_info_map().await
    }

    async fn assign_leader(&self) -> Result<()> {
        self.node()?.assign_leader().await
    }

    async fn heartbeat(&self) -> Result<()> {
        self.node()?.heartbeat().await
    }

    async fn crash(&self) -> Result<()> {
        self.node()?.crash().await;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        self.node()?.restore().await;
        Ok(())
    }

    async fn internal_state(&self) -> Result<InternalState> {
        Ok(self.node()?.internal_state().await)
    }
}

/// A whole cluster in one process, sharing one in-memory block store. Node ids
/// run from 0 to `size - 1`.
pub struct LocalCluster {
    registry: Arc<Registry>,
    nodes: Vec<RaftNode>,
    blocks: Arc<MemBlockStore>,
}

impl LocalCluster {
    pub fn new(size: usize) -> Result<Self> {
        Self::with_config(size, RaftConfig::default())
    }

    pub fn with_config(size: usize, config: RaftConfig) -> Result<Self> {
        let registry = Arc::new(Registry::default());
        let blocks = Arc::new(MemBlockStore::new());
        let mut nodes = Vec::with_capacity(size);
        for id in 0..size as u64 {
            let peers: PeerSet = (0..size as u64)
                .filter(|p| *p != id)
                .map(|p| {
                    let peer: Arc<dyn RaftService> = Arc::new(LocalPeer {
                        id: p,
                        registry: Arc::downgrade(&registry),
                    });
                    (p, peer)
                })
                .collect();
            let node = RaftNode::new(
                id,
                peers,
                Box::new(MemStorage::new()),
                Some(blocks.clone() as Arc<dyn BlockStore>),
                config,
            )?;
            nodes.push(node);
        }
        {
            let mut registered = registry
                .nodes
                .write()
                .map_err(|_| Error::Unavailable("cluster registry poisoned".to_string()))?;
            for node in &nodes {
                registered.insert(node.id(), node.clone());
            }
        }
        Ok(LocalCluster {
            registry,
            nodes,
            blocks,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node of this cluster
    ///
    /// # Arguments
    ///
    /// * `id` - Node id, from 0 to `len() - 1`
    ///
    /// # Returns
    ///
    /// The node, or `Unavailable` for an id the cluster never created
    pub fn node(&self, id: u64) -> Result<&RaftNode> {
        usize::try_from(id)
            .ok()
            .and_then(|idx| self.nodes.get(idx))
            .ok_or_else(|| Error::Unavailable(format!("node {} is not registered", id)))
    }

    /// Service handle for every node, in id order, the way a client sees them.
    pub fn services(&self) -> Vec<Arc<dyn RaftService>> {
        self.nodes
            .iter()
            .map(|n| {
                Arc::new(LocalPeer {
                    id: n.id(),
                    registry: Arc::downgrade(&self.registry),
                }) as Arc<dyn RaftService>
            })
            .collect()
    }

    pub fn block_store(&self) -> Arc<MemBlockStore> {
        self.blocks.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let cluster = LocalCluster::new(2).unwrap();
        assert_eq!(cluster.node(1).unwrap().id(), 1);
        assert_eq!(
            cluster.node(2).err(),
            Some(Error::Unavailable("node 2 is not registered".to_string()))
        );
    }
}
