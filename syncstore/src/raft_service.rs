use async_trait::async_trait;

use crate::error::Result;
use crate::metadata::{FileInfoMap, FileMetadata};
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest,
    InternalState, LogEntry, RaftNode,
};

/// Everything a metadata server answers: consensus traffic between servers,
/// client operations, and the operator controls used to drive a cluster.
///
/// Implemented by [`RaftNode`] in-process, by `LocalPeer` inside a test cluster,
/// and by `RemoteNode` over gRPC.
#[async_trait]
pub trait RaftService: Send + Sync {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply>;

    async fn claim_leadership(&self, req: ClaimRequest) -> Result<ClaimReply>;

    async fn fetch_entries(&self, req: FetchRequest) -> Result<Vec<LogEntry>>;

    /// Returns the version now stored for the file.
    async fn update_file(&self, meta: FileMetadata) -> Result<u64>;

    async fn get_file_info_map(&self) -> Result<FileInfoMap>;

    async fn assign_leader(&self) -> Result<()>;

    async fn heartbeat(&self) -> Result<()>;

    async fn crash(&self) -> Result<()>;

    async fn restore(&self) -> Result<()>;

    async fn internal_state(&self) -> Result<InternalState>;
}

#[async_trait]
impl RaftService for RaftNode {
    async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesReply> {
        RaftNode::append_entries(self, req).await
    }

    async fn claim_leadership(&self, req: ClaimRequest) -> Result<ClaimReply> {
        RaftNode::claim_leadership(self, req).await
    }

    async fn fetch_entries(&self, req: FetchRequest) -> Result<Vec<LogEntry>> {
        RaftNode::fetch_entries(self, req).await
    }

    async fn update_file(&self, meta: FileMetadata) -> Result<u64> {
        RaftNode::update_file(self, meta).await
    }

    async fn get_file_info_map(&self) -> Result<FileInfoMap> {
        RaftNode::get_file_info_map(self).await
    }

    async fn assign_leader(&self) -> Result<()> {
        RaftNode::assign_leader(self).await
    }

    async fn heartbeat(&self) -> Result<()> {
        RaftNode::heartbeat(self).await
    }

    async fn crash(&self) -> Result<()> {
        RaftNode::crash(self).await;
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        RaftNode::restore(self).await;
        Ok(())
    }

    async fn internal_state(&self) -> Result<InternalState> {
        Ok(RaftNode::internal_state(self).await)
    }
}
