use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Why a cluster configuration cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A cluster needs at least one node.
    #[error("cluster has no nodes")]
    NoNodes,

    /// Two nodes share an id.
    #[error("duplicate origin id {0}")]
    DuplicateNode(NodeId),

    /// Multi-node clusters must keep at least two copies.
    #[error("replication factor {replicas} is too small for a {nodes}-node cluster")]
    ReplicationFactor {
        /// Effective replication factor.
        replicas: usize,
        /// Cluster size.
        nodes: usize,
    },

    /// The write quorum must be between 1 and the replication factor.
    #[error("write quorum {quorum} is outside 1..={replicas}")]
    Quorum {
        /// Configured quorum.
        quorum: usize,
        /// Effective replication factor.
        replicas: usize,
    },

    /// Timeouts and intervals must be non-zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Replication settings.
///
/// ```toml
/// [cluster]
/// replication-factor = 3
/// write-quorum = 2
/// replica-timeout-ms = 5000
/// health-interval-ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClusterConfig {
    /// Copies kept of every entity, capped at the cluster size.
    pub replication_factor: usize,

    /// Acknowledgements a write needs. Defaults to a majority of the replica set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_quorum: Option<usize>,

    /// How long to wait on a single replica.
    pub replica_timeout_ms: u64,

    /// How often to ping replicas.
    pub health_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            write_quorum: None,
            replica_timeout_ms: 5_000,
            health_interval_ms: 2_000,
        }
    }
}

/// A configuration resolved against a concrete cluster size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationPlan {
    /// Replica set size.
    pub replicas: usize,
    /// Acknowledgements required per write.
    pub quorum: usize,
    /// Per-replica timeout.
    pub replica_timeout: Duration,
    /// Health check period.
    pub health_interval: Duration,
}

impl ClusterConfig {
    /// Check the configuration against a cluster of `nodes` origins.
    pub fn resolve(&self, nodes: usize) -> Result<ReplicationPlan, ConfigError> {
        if nodes == 0 {
            return Err(ConfigError::NoNodes);
        }

        let replicas = self.replication_factor.min(nodes);
        if replicas == 0 || (nodes >= 2 && replicas < 2) {
            return Err(ConfigError::ReplicationFactor { replicas, nodes });
        }

        let quorum = self.write_quorum.unwrap_or(replicas / 2 + 1);
        if quorum == 0 || quorum > replicas {
            return Err(ConfigError::Quorum { quorum, replicas });
        }

        if self.replica_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("replica-timeout-ms"));
        }
        if self.health_interval_ms == 0 {
            return Err(ConfigError::ZeroDuration("health-interval-ms"));
        }

        Ok(ReplicationPlan {
            replicas,
            quorum,
            replica_timeout: Duration::from_millis(self.replica_timeout_ms),
            health_interval: Duration::from_millis(self.health_interval_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_majority_of_three() {
        let plan = ClusterConfig::default().resolve(5).unwrap();
        assert_eq!(plan.replicas, 3);
        assert_eq!(plan.quorum, 2);
    }

    #[test]
    fn caps_replication_at_cluster_size() {
        let plan = ClusterConfig::default().resolve(2).unwrap();
        assert_eq!(plan.replicas, 2);
        assert_eq!(plan.quorum, 2);

        let plan = ClusterConfig::default().resolve(1).unwrap();
        assert_eq!((plan.replicas, plan.quorum), (1, 1));
    }

    #[test]
    fn rejects_unsafe_settings() {
        let config = ClusterConfig {
            replication_factor: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(3),
            Err(ConfigError::ReplicationFactor { .. })
        ));

        let config = ClusterConfig {
            write_quorum: Some(4),
            ..Default::default()
        };
        assert!(matches!(config.resolve(3), Err(ConfigError::Quorum { .. })));
        assert_eq!(ClusterConfig::default().resolve(0), Err(ConfigError::NoNodes));
    }

    #[test]
    fn parses_kebab_case() {
        let config: ClusterConfig =
            serde_json::from_str(r#"{"replication-factor": 2, "write-quorum": 1}"#).unwrap();
        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.write_quorum, Some(1));
        assert_eq!(config.replica_timeout_ms, 5_000);
    }
}
