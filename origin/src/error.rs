use storage::{StorageError, StorageErrorKind};

use crate::{config::ConfigError, key::Key, node::NodeId};

/// The result of an operation on a single replica.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// The result of an operation routed across the cluster.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Failure of one replica to carry out an operation.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// The replica is reachable and does not hold the key.
    #[error("{0} not found")]
    NotFound(Key),

    /// The replica cannot be reached or is restarting.
    #[error("origin {node} unavailable: {reason}")]
    Unavailable {
        /// The unreachable node.
        node: NodeId,
        /// What went wrong.
        reason: String,
    },

    /// The replica has no room for the write.
    #[error("origin {node} is out of storage")]
    StorageFull {
        /// The full node.
        node: NodeId,
    },

    /// Content did not hash to the digest it was written under.
    #[error("content does not match {key}")]
    DigestMismatch {
        /// The key the content was offered for.
        key: Key,
    },

    /// A stored record could not be decoded.
    #[error("undecodable record at {key}: {message}")]
    Decode {
        /// The record's key.
        key: Key,
        /// Decoder message.
        message: String,
    },

    /// The peer answered with something the protocol does not allow.
    #[error("origin {node} protocol error: {message}")]
    Protocol {
        /// The misbehaving node.
        node: NodeId,
        /// What was unexpected.
        message: String,
    },

    /// Local storage failed.
    #[error(transparent)]
    Storage(StorageError),
}

impl ReplicaError {
    /// Classify a driver error raised while handling `key` on `node`.
    pub(crate) fn storage(node: &NodeId, key: &Key, error: StorageError) -> Self {
        match error.kind() {
            StorageErrorKind::NotFound => ReplicaError::NotFound(key.clone()),
            StorageErrorKind::StorageFull => ReplicaError::StorageFull { node: node.clone() },
            StorageErrorKind::Unavailable => ReplicaError::Unavailable {
                node: node.clone(),
                reason: error.to_string(),
            },
            _ => ReplicaError::Storage(error),
        }
    }

    /// Whether the replica should be considered down.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ReplicaError::Unavailable { .. })
    }
}

/// Failure of a routed cluster operation.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Every replica that answered reported the key absent.
    #[error("{0} not found")]
    NotFound(Key),

    /// No replica holding the key (or listing) could be reached.
    #[error("no reachable replica for {target} after {attempts} attempts")]
    Unavailable {
        /// The requested key or listing.
        target: String,
        /// How many replicas were tried.
        attempts: usize,
    },

    /// Too few replicas acknowledged a write in time.
    #[error("write of {key} acknowledged by {acks} of {required} required replicas")]
    ReplicationTimeout {
        /// The written key.
        key: Key,
        /// Acknowledgements received.
        acks: usize,
        /// Acknowledgements required.
        required: usize,
    },

    /// Too few replicas acknowledged a write because storage was full.
    #[error("write of {key} failed: storage full ({acks} of {required} acknowledged)")]
    StorageFull {
        /// The written key.
        key: Key,
        /// Acknowledgements received.
        acks: usize,
        /// Acknowledgements required.
        required: usize,
    },

    /// Content did not hash to the digest it was written under.
    #[error("content does not match {0}")]
    DigestMismatch(Key),

    /// A stored record could not be decoded.
    #[error("undecodable record at {key}: {message}")]
    Corrupt {
        /// The record's key.
        key: Key,
        /// Decoder message.
        message: String,
    },

    /// The cluster configuration cannot be satisfied.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClusterError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Unavailable { .. } | ClusterError::ReplicationTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_storage_errors() {
        let node = NodeId::from("a");
        let key = Key::Repository("app".into());

        let err = ReplicaError::storage(
            &node,
            &key,
            StorageError::not_found("memory", "origin", "repositories/app/_repository"),
        );
        assert!(matches!(err, ReplicaError::NotFound(k) if k == key));

        let err = ReplicaError::storage(
            &node,
            &key,
            StorageError::new("memory", StorageErrorKind::StorageFull, "full"),
        );
        assert!(matches!(err, ReplicaError::StorageFull { .. }));

        let err = ReplicaError::storage(
            &node,
            &key,
            StorageError::new("memory", StorageErrorKind::Unavailable, "offline"),
        );
        assert!(err.is_unavailable());
    }
}
