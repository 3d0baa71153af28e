use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use syncstore::block::{BlockStore, MemBlockStore};
use syncstore::config::ClusterConfig;
use syncstore::server::{build_node, start_metrics_server, Server};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(about = "Metadata and block server")]
struct Args {
    /// Cluster config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Host metadata node <ID>
    #[arg(short, long)]
    id: Option<u64>,

    /// Host the block store
    #[arg(short, long)]
    block: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = ClusterConfig::from_toml(&args.config)?;

    let blocks: Option<Arc<dyn BlockStore>> = if args.block {
        Some(Arc::new(MemBlockStore::new()))
    } else {
        None
    };

    let mut server = Server::builder();
    let addr = match args.id {
        Some(id) => {
            let node = build_node(&config, id, blocks.clone())
                .with_context(|| format!("cannot start node {}", id))?;
            server = server.with_raft(node);
            let node_config = config.node(id)?;
            if let Some(metrics_addr) = &node_config.metrics_addr {
                start_metrics_server(metrics_addr.parse()?);
            }
            node_config.addr.clone()
        }
        None if args.block => config.block_addr.clone(),
        None => bail!("nothing to serve, pass --id and/or --block"),
    };
    if let Some(blocks) = blocks {
        server = server.with_blocks(blocks);
    }
    server.start(&addr).await?;

    shutdown_signal().await;
    log::info!("server stop");
    Ok(())
}
