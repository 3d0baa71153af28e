//! Replicated file-metadata service and the client that synchronises a
//! directory against it.

pub mod block;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod raft;
pub mod raft_client;
pub mod raft_service;
pub mod rpc;
pub mod server;
pub mod sync;

pub use block::{hash_block, BlockStore, MemBlockStore};
pub use cluster::LocalCluster;
pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use metadata::{FileInfoMap, FileMetadata};
pub use raft::RaftNode;
pub use raft_client::RemoteNode;
pub use raft_service::RaftService;
pub use sync::{sync_client, SyncReport, Synchronizer};
