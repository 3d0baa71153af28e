//! Raft client implementation
//!
//! `RemoteNode` stands in for a server reached over gRPC. It speaks both the
//! metadata service and the block store, and bounds every call by one timeout.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tonic::{Response, Status};

use crate::block::BlockStore;
use crate::error::{Error, Result};
use crate::metadata::{FileInfoMap, FileMetadata};
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest,
    InternalState, LogEntry,
};
use crate::raft_service::RaftService;
use crate::rpc::pb::blocks_client::BlocksClient;
use crate::rpc::pb::raft_client::RaftClient;
use crate::rpc::{BlockData, BlockHash, Empty, HashList, MAX_MESSAGE_SIZE};

#[derive(Debug, Clone)]
pub struct RemoteNode {
    addr: String,
    timeout: Duration,
}

fn raft_client(channel: Channel) -> RaftClient<Channel> {
    RaftClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE)
}

fn blocks_client(channel: Channel) -> BlocksClient<Channel> {
    BlocksClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE)
}

impl RemoteNode {
    /// Creates a handle to the server at `addr`
    ///
    /// # Arguments
    ///
    /// * `addr` - `host:port` of the server
    /// * `timeout` - Budget for a whole call, connecting included
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        RemoteNode {
            addr: addr.into(),
            timeout,
        }
    }

    async fn connect(&self) -> Result<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{}", self.addr))
            .map_err(|e| Error::Config(format!("bad address {}: {}", self.addr, e)))?
            .connect_timeout(self.timeout);
        endpoint
            .connect()
            .await
            .map_err(|e| Error::Unavailable(format!("{}: {}", self.addr, e)))
    }

    /// Connects and runs one request
    ///
    /// Transport failures and timeouts surface as `Unavailable`; a failure
    /// raised by the remote handler comes back as-is.
    ///
    /// # Arguments
    ///
    /// * `method` - Name used in the timeout message
    /// * `request` - Sends the request over a fresh channel
    async fn call<T, F, Fut>(&self, method: &str, request: F) -> Result<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = std::result::Result<Response<T>, Status>>,
    {
        let exchange = async {
            let channel = self.connect().await?;
            let response = request(channel).await?;
            Ok::<T, Error>(response.into_inner())
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Unavailable(format!("{} to {} timed out", method, self.addr)))?
    }
}

#[async_trait]
impl RaftService for RemoteNode {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        self.call("append_entries", |ch| async move {
            raft_client(ch).append_entries(req).await
        })
        .await
    }

    async fn claim_leadership(&self, req: ClaimRequest) -> Result<ClaimReply> {
        self.call("claim_leadership", |ch| async move {
            raft_client(ch).claim_leadership(req).await
        })
        .await
    }

    async fn fetch_entries(&self, req: FetchRequest) -> Result<Vec<LogEntry>> {
        let reply = self
            .call("fetch_entries", |ch| async move {
                raft_client(ch).fetch_entries(req).await
            })
            .await?;
        Ok(reply.entries)
    }

    async fn update_file(&self, meta: FileMetadata) -> Result<u64> {
        let reply = self
            .call("update_file", |ch| async move {
                raft_client(ch).update_file(meta).await
            })
            .await?;
        Ok(reply.version)
    }

    async fn get_file_info_map(&self) -> Result<FileInfoMap> {
        let reply = self
            .call("get_file_info_map", |ch| async move {
                raft_client(ch).get_file_info_map(Empty {}).await
            })
            .await?;
        Ok(reply.files)
    }

    async fn assign_leader(&self) -> Result<()> {
        self.call("assign_leader", |ch| async move {
            raft_client(ch).assign_leader(Empty {}).await
        })
        .await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<()> {
        self.call("heartbeat", |ch| async move {
            raft_client(ch).heartbeat(Empty {}).await
        })
        .await?;
        Ok(())
    }

    async fn crash(&self) -> Result<()> {
        self.call("crash", |ch| async move { raft_client(ch).crash(Empty {}).await })
            .await?;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        self.call("restore", |ch| async move {
            raft_client(ch).restore(Empty {}).await
        })
        .await?;
        Ok(())
    }

    async fn internal_state(&self) -> Result<InternalState> {
        self.call("get_internal_state", |ch| async move {
            raft_client(ch).get_internal_state(Empty {}).await
        })
        .await
    }
}

#[async_trait]
impl BlockStore for RemoteNode {
    async fn has_blocks(&self, hashes: &[String]) -> Result<Vec<String>> {
        let req = HashList {
            hashes: hashes.to_vec(),
        };
        let reply = self
            .call("has_blocks", |ch| async move {
                blocks_client(ch).has_blocks(req).await
            })
            .await?;
        Ok(reply.hashes)
    }

    async fn get_block(&self, hash: &str) -> Result<Vec<u8>> {
        let req = BlockHash {
            hash: hash.to_string(),
        };
        let reply = self
            .call("get_block", |ch| async move {
                blocks_client(ch).get_block(req).await
            })
            .await?;
        Ok(reply.data)
    }

    async fn put_block(&self, data: Vec<u8>) -> Result<String> {
        let reply = self
            .call("put_block", |ch| async move {
                blocks_client(ch).put_block(BlockData { data }).await
            })
            .await?;
        Ok(reply.hash)
    }
}
