use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use syncstore::config::ClusterConfig;
use syncstore::sync_client;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile a directory with the cluster once
    Sync {
        /// Directory to synchronise
        dir: PathBuf,

        /// Chunk size in bytes
        #[arg(short, long, default_value = "4096")]
        block_size: usize,

        /// Block store address, defaults to the configured one
        #[arg(long)]
        block_addr: Option<String>,
    },
    /// Make a node leader of a new term
    AssignLeader { node: u64 },
    /// Run one replication round from a node
    Heartbeat { node: u64 },
    /// Make a node refuse all traffic
    Crash { node: u64 },
    /// Bring a crashed node back
    Restore { node: u64 },
    /// Print a node's internal state as JSON
    State { node: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = ClusterConfig::from_toml(&args.config)?;

    match args.command {
        Command::Sync {
            dir,
            block_size,
            block_addr,
        } => {
            let block_addr = block_addr.unwrap_or_else(|| config.block_addr.clone());
            let report = sync_client(&block_addr, &dir, block_size, &config)
                .await
                .with_context(|| format!("sync of {} failed", dir.display()))?;
            println!(
                "uploaded {:?}, downloaded {:?}, deleted {:?}, conflicts {:?}",
                report.uploaded, report.downloaded, report.deleted, report.conflicts
            );
            for (name, reason) in &report.failed {
                eprintln!("{}: {}", name, reason);
            }
        }
        Command::AssignLeader { node } => {
            config.remote_service(node)?.assign_leader().await?;
            println!("node {} is leader", node);
        }
        Command::Heartbeat { node } => {
            config.remote_service(node)?.heartbeat().await?;
            println!("heartbeat sent from node {}", node);
        }
        Command::Crash { node } => {
            config.remote_service(node)?.crash().await?;
            println!("node {} crashed", node);
        }
        Command::Restore { node } => {
            config.remote_service(node)?.restore().await?;
            println!("node {} restored", node);
        }
        Command::State { node } => {
            let state = config.remote_service(node)?.internal_state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }
    Ok(())
}
