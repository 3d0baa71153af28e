use serde_derive::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::raft::RaftConfig;
use crate::raft_client::RemoteNode;
use crate::raft_service::RaftService;

fn default_rpc_timeout_ms() -> u64 {
    500
}

fn default_client_timeout_ms() -> u64 {
    5000
}

fn default_data_dir() -> String {
    "data".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: u64,
    pub addr: String,
    #[serde(default)]
    pub metrics_addr: Option<String>,
}

/// Cluster layout shared by servers and clients.
///
/// ```toml
/// block_addr = "127.0.0.1:5000"
///
/// [[node_list]]
/// id = 0
/// addr = "127.0.0.1:5001"
/// ```
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    pub block_addr: String,
    /// Bound on one server-to-server call.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Bound on one client or operator call. A single call may fan out to
    /// several server-to-server rounds, so this must exceed `rpc_timeout_ms`.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub node_list: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&contents)?;
        log::info!(
            "loaded cluster config from {}: {} nodes",
            path.display(),
            config.node_list.len()
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: ClusterConfig =
            toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    // Node ids double as positions in node_list.
    fn validate(&self) -> Result<()> {
        if self.node_list.is_empty() {
            return Err(Error::Config("node_list is empty".to_string()));
        }
        if self.client_timeout_ms <= self.rpc_timeout_ms {
            return Err(Error::Config(format!(
                "client_timeout_ms ({}) must exceed rpc_timeout_ms ({})",
                self.client_timeout_ms, self.rpc_timeout_ms
            )));
        }
        for (pos, node) in self.node_list.iter().enumerate() {
            if node.id != pos as u64 {
                return Err(Error::Config(format!(
                    "node at position {} has id {}",
                    pos, node.id
                )));
            }
        }
        Ok(())
    }

    pub fn node(&self, id: u64) -> Result<&NodeConfig> {
        self.node_list
            .get(id as usize)
            .ok_or_else(|| Error::Config(format!("no node with id {}", id)))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            rpc_timeout: self.rpc_timeout(),
        }
    }

    pub fn data_path(&self, id: u64) -> PathBuf {
        Path::new(&self.data_dir).join(format!("node_{}", id))
    }

    /// Every metadata server, in id order, as a client reaches them.
    pub fn remote_services(&self) -> Vec<Arc<dyn RaftService>> {
        self.node_list
            .iter()
            .map(|n| {
                Arc::new(RemoteNode::new(&n.addr, self.client_timeout())) as Arc<dyn RaftService>
            })
            .collect()
    }

    /// Client handle to node `id`
    ///
    /// # Returns
    ///
    /// A `Config` error when no such node is configured
    pub fn remote_service(&self, id: u64) -> Result<Arc<dyn RaftService>> {
        let node = self.node(id)?;
        Ok(Arc::new(RemoteNode::new(&node.addr, self.client_timeout())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"
        block_addr = "127.0.0.1:5000"
        rpc_timeout_ms = 200

        [[node_list]]
        id = 0
        addr = "127.0.0.1:5001"
        metrics_addr = "127.0.0.1:5011"

        [[node_list]]
        id = 1
        addr = "127.0.0.1:5002"

        [[node_list]]
        id = 2
        addr = "127.0.0.1:5003"
    "#;

    #[test]
    fn parses_cluster_layout() {
        let config = ClusterConfig::parse(THREE_NODES).unwrap();
        assert_eq!(config.node_list.len(), 3);
        assert_eq!(config.rpc_timeout(), Duration::from_millis(200));
        assert_eq!(config.client_timeout(), Duration::from_millis(5000));
        assert_eq!(config.data_dir, "data");
        assert_eq!(
            config.node(0).unwrap().metrics_addr.as_deref(),
            Some("127.0.0.1:5011")
        );
        assert!(config.node(1).unwrap().metrics_addr.is_none());
        assert!(config.node(3).is_err());
    }

    #[test]
    fn rejects_ids_out_of_order() {
        let err = ClusterConfig::parse(
            r#"
            block_addr = "127.0.0.1:5000"
            [[node_list]]
            id = 1
            addr = "127.0.0.1:5001"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn client_timeout_must_cover_server_rounds() {
        let err = ClusterConfig::parse(
            r#"
            block_addr = "127.0.0.1:5000"
            rpc_timeout_ms = 1000
            client_timeout_ms = 1000
            [[node_list]]
            id = 0
            addr = "127.0.0.1:5001"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ClusterConfig::from_toml("/nonexistent/config.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
