//! Server configuration file.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! max-upload-bytes = 1073741824
//! upload-timeout-secs = 3600
//!
//! [node]
//! id = "origin-a"
//! storage = { local = { path = "/var/lib/registry" } }
//!
//! [cluster]
//! replication-factor = 3
//!
//! [[peers]]
//! id = "origin-b"
//! url = "http://origin-b:5000"
//!
//! [[peers]]
//! id = "origin-c"
//! url = "http://origin-c:5000"
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8Path;
use origin::ClusterConfig;
use serde::Deserialize;
use storage::StorageConfig;

use crate::api::DEFAULT_BODY_LIMIT;
use crate::upload::DEFAULT_UPLOAD_TIMEOUT;

/// Why the configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Read {
        /// The configuration path.
        path: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The file is not valid configuration.
    #[error("parsing configuration: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// A peer shares the local node's id.
    #[error("peer {0} has the same id as this node")]
    DuplicatePeer(String),
}

/// The node this process serves.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Cluster-unique node id.
    pub id: String,

    /// Where this node keeps its objects.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Another origin in the cluster, reached over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    /// The peer's node id.
    pub id: String,
    /// Base URL of the peer's HTTP listener.
    pub url: String,
}

/// Everything `registry-server` reads from its configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Largest accepted request body.
    #[serde(default = "default_body_limit")]
    pub max_upload_bytes: usize,

    /// Seconds an upload session may sit idle before it is discarded.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,

    /// This node.
    pub node: NodeConfig,

    /// Replication settings shared by every node.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// The other nodes.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_body_limit() -> usize {
    DEFAULT_BODY_LIMIT
}

fn default_upload_timeout() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT.as_secs()
}

impl ServerConfig {
    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigFileError> {
        let config: ServerConfig = toml_edit::de::from_str(text)?;
        if let Some(peer) = config.peers.iter().find(|peer| peer.id == config.node.id) {
            return Err(ConfigFileError::DuplicatePeer(peer.id.clone()));
        }
        Ok(config)
    }

    /// Read configuration from `path`.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigFileError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigFileError::Read {
                path: path.to_string(),
                source,
            })?;
        Self::parse(&text)
    }

    /// Idle timeout for upload sessions.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// A single in-memory node, used when no file is given.
    pub fn standalone() -> Self {
        Self {
            listen: default_listen(),
            max_upload_bytes: default_body_limit(),
            upload_timeout_secs: default_upload_timeout(),
            node: NodeConfig {
                id: "origin".into(),
                storage: StorageConfig::default(),
            },
            cluster: ClusterConfig::default(),
            peers: Vec::new(),
        }
    }
}
