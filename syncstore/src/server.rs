use crate::block::BlockStore;
use crate::config::ClusterConfig;
use crate::metadata::FileMetadata;
use crate::metrics;
use crate::raft::{
    AppendEntriesReply, AppendEntriesRequest, ClaimReply, ClaimRequest, FetchRequest,
    FileStorage, InternalState, PeerSet, RaftNode,
};
use crate::raft_client::RemoteNode;
use crate::raft_service::RaftService;
use crate::rpc::pb::blocks_server::{Blocks, BlocksServer};
use crate::rpc::pb::raft_server::{Raft, RaftServer};
use crate::rpc::{
    BlockData, BlockHash, Empty, EntriesReply, FileInfoMapReply, HashList, VersionReply,
    MAX_MESSAGE_SIZE,
};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response as HttpResponse};
use prometheus::{Encoder, TextEncoder};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

/// Runs `handler` under the request metrics and turns its outcome into a gRPC
/// reply.
async fn serve<F, Fut, T>(method: &'static str, handler: F) -> Result<Response<T>, Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = crate::error::Result<T>> + Send,
{
    metrics::record_metrics(method, handler)
        .await
        .map(Response::new)
        .map_err(Status::from)
}

/// gRPC face of a metadata node.
pub struct RaftSvc {
    node: RaftNode,
}

#[tonic::async_trait]
impl Raft for RaftSvc {
    async fn append_entries(
        &self,
        request: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesReply>, Status> {
        let req = request.into_inner();
        serve("append_entries", || self.node.append_entries(req)).await
    }

    async fn claim_leadership(
        &self,
        request: Request<ClaimRequest>,
    ) -> Result<Response<ClaimReply>, Status> {
        let req = request.into_inner();
        serve("claim_leadership", || self.node.claim_leadership(req)).await
    }

    async fn fetch_entries(
        &self,
        request: Request<FetchRequest>,
    ) -> Result<Response<EntriesReply>, Status> {
        let req = request.into_inner();
        serve("fetch_entries", || async move {
            let entries = self.node.fetch_entries(req).await?;
            Ok(EntriesReply { entries })
        })
        .await
    }

    async fn update_file(
        &self,
        request: Request<FileMetadata>,
    ) -> Result<Response<VersionReply>, Status> {
        let meta = request.into_inner();
        serve("update_file", || async move {
            let version = self.node.update_file(meta).await?;
            Ok(VersionReply { version })
        })
        .await
    }

    async fn get_file_info_map(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<FileInfoMapReply>, Status> {
        serve("get_file_info_map", || async move {
            let files = self.node.get_file_info_map().await?;
            Ok(FileInfoMapReply { files })
        })
        .await
    }

    async fn assign_leader(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        serve("assign_leader", || async move {
            self.node.assign_leader().await?;
            Ok(Empty {})
        })
        .await
    }

    async fn heartbeat(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        serve("heartbeat", || async move {
            self.node.heartbeat().await?;
            Ok(Empty {})
        })
        .await
    }

    async fn crash(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        serve("crash", || async move {
            self.node.crash().await;
            Ok(Empty {})
        })
        .await
    }

    async fn restore(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        serve("restore", || async move {
            self.node.restore().await;
            Ok(Empty {})
        })
        .await
    }

    async fn get_internal_state(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<InternalState>, Status> {
        serve("get_internal_state", || async move {
            Ok(self.node.internal_state().await)
        })
        .await
    }
}

/// gRPC face of a block store.
pub struct BlocksSvc {
    store: Arc<dyn BlockStore>,
}

#[tonic::async_trait]
impl Blocks for BlocksSvc {
    async fn has_blocks(&self, request: Request<HashList>) -> Result<Response<HashList>, Status> {
        let HashList { hashes } = request.into_inner();
        serve("has_blocks", || async move {
            let hashes = self.store.has_blocks(&hashes).await?;
            Ok(HashList { hashes })
        })
        .await
    }

    async fn get_block(&self, request: Request<BlockHash>) -> Result<Response<BlockData>, Status> {
        let BlockHash { hash } = request.into_inner();
        serve("get_block", || async move {
            let data = self.store.get_block(&hash).await?;
            Ok(BlockData { data })
        })
        .await
    }

    async fn put_block(&self, request: Request<BlockData>) -> Result<Response<BlockHash>, Status> {
        let BlockData { data } = request.into_inner();
        serve("put_block", || async move {
            let hash = self.store.put_block(data).await?;
            Ok(BlockHash { hash })
        })
        .await
    }
}

/// gRPC front end for a metadata node, a block store, or both.
pub struct Server {
    raft: Option<RaftNode>,
    blocks: Option<Arc<dyn BlockStore>>,
}

impl Server {
    pub fn builder() -> Self {
        Server {
            raft: None,
            blocks: None,
        }
    }

    pub fn with_raft(mut self, node: RaftNode) -> Self {
        self.raft = Some(node);
        self
    }

    pub fn with_blocks(mut self, blocks: Arc<dyn BlockStore>) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Starts the gRPC server in the background
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to listen on; port 0 picks a free port
    ///
    /// # Returns
    ///
    /// The address actually bound
    pub async fn start(self, addr: &str) -> crate::error::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let raft_service = self.raft.map(|node| {
            RaftServer::new(RaftSvc { node })
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE)
        });
        let blocks_service = self.blocks.map(|store| {
            BlocksServer::new(BlocksSvc { store })
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE)
        });
        let mut server = tonic::transport::Server::builder();
        let grpc_server = server
            .add_optional_service(raft_service)
            .add_optional_service(blocks_service)
            .serve_with_incoming(TcpListenerStream::new(listener));
        tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server on {} failed: {}", local_addr, e);
            }
        });
        log::info!("grpc server started on {}", local_addr);
        Ok(local_addr)
    }
}

/// Builds node `id` of `config` with file-backed storage and gRPC peers
///
/// # Arguments
///
/// * `config` - Cluster layout
/// * `id` - Node to build
/// * `blocks` - Block store to check proposals against; the configured block
///   server when `None`
pub fn build_node(
    config: &ClusterConfig,
    id: u64,
    blocks: Option<Arc<dyn BlockStore>>,
) -> crate::error::Result<RaftNode> {
    config.node(id)?;
    let peers: PeerSet = config
        .node_list
        .iter()
        .filter(|n| n.id != id)
        .map(|n| {
            let peer: Arc<dyn RaftService> =
                Arc::new(RemoteNode::new(&n.addr, config.rpc_timeout()));
            (n.id, peer)
        })
        .collect();
    let blocks = blocks.unwrap_or_else(|| {
        Arc::new(RemoteNode::new(&config.block_addr, config.rpc_timeout())) as Arc<dyn BlockStore>
    });
    let storage = FileStorage::new(config.data_path(id))?;
    RaftNode::new(
        id,
        peers,
        Box::new(storage),
        Some(blocks),
        config.raft_config(),
    )
}

pub fn start_metrics_server(addr: SocketAddr) {
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: hyper::Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        log::warn!("cannot encode metrics: {}", e);
                    }
                    Ok::<_, hyper::Error>(HttpResponse::new(Body::from(buffer)))
                }
            }))
        }
    });
    metrics::init_registry();
    let server = hyper::Server::bind(&addr).serve(make_svc);
    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("metrics server failed: {}", e);
        }
    });
    log::info!("metrics server started on {}", addr);
}
