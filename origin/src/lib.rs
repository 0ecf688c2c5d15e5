//! # Origin cluster
//!
//! A set of origin nodes which together hold every blob, manifest record,
//! tag and repository marker of the registry. Each entity is identified by a
//! [`Key`], placed on a replica set by rendezvous hashing, written to a
//! quorum of that set and read from whichever replica answers first.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use origin::{Cluster, ClusterConfig, Digest, Key, OriginNode, Replica};
//!
//! # async fn demo() -> Result<(), origin::ClusterError> {
//! let replicas: Vec<Arc<dyn Replica>> = ["a", "b", "c"]
//!     .into_iter()
//!     .map(|id| Arc::new(OriginNode::memory(id)) as Arc<dyn Replica>)
//!     .collect();
//! let cluster = Cluster::new(replicas, &ClusterConfig::default())?;
//!
//! let data = Bytes::from_static(b"layer");
//! let key = Key::Blob(Digest::sha256(&data));
//! cluster.put(&key, data.clone()).await?;
//! assert_eq!(cluster.get(&key).await?, data);
//! # Ok(())
//! # }
//! ```

mod cluster;
mod config;
mod digest;
mod error;
mod key;
mod node;
pub mod peer;
mod placement;
mod record;
mod replica;

pub use cluster::Cluster;
pub use config::{ClusterConfig, ConfigError, ReplicationPlan};
pub use digest::{Algorithm, Digest, DigestError};
pub use error::{ClusterError, ClusterResult, ReplicaError, ReplicaResult};
pub use key::{Key, ListQuery, Prefix, PrefixKind};
pub use node::{NodeId, NodeState, OriginNode};
pub use peer::RemoteOrigin;
pub use record::{Clock, TagRecord};
pub use replica::Replica;
