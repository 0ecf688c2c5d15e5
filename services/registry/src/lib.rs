//! # Container Registry
//!
//! A content-addressable registry speaking the Docker Registry V2 and
//! [OCI Distribution](https://github.com/opencontainers/distribution-spec)
//! HTTP APIs, backed by a replicated [`origin::Cluster`].
//!
//! ## Features
//!
//! - Blob upload (monolithic, chunked, cross-repository mount) and download
//! - Manifest push and pull by tag or digest, with reference checking
//! - Docker / OCI media type negotiation without rewriting manifest bytes
//! - Tag listing and catalog with `n`/`last` pagination
//! - Reads and writes keep working while any origin restarts
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use origin::{Cluster, ClusterConfig, OriginNode, Replica};
//! use registry::RegistryBuilder;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let replicas: Vec<Arc<dyn Replica>> = ["origin-a", "origin-b", "origin-c"]
//!     .into_iter()
//!     .map(|id| Arc::new(OriginNode::memory(id)) as Arc<dyn Replica>)
//!     .collect();
//! let cluster = Cluster::new(replicas, &ClusterConfig::default())?;
//! let registry = RegistryBuilder::new(cluster).build();
//!
//! // Use the registry service with axum or any tower-compatible server
//! # Ok(())
//! # }
//! ```

mod api;
mod blob;
#[cfg(feature = "cli")]
pub mod config;
mod error;
mod manifest;
pub mod media;
pub mod path;
pub mod schema;
mod tags;
mod upload;

pub use api::{DEFAULT_BODY_LIMIT, RegistryBuilder};
pub use blob::BlobStore;
pub use error::{RegistryError, RegistryResult};
pub use manifest::{ManifestStore, Served};
pub use media::{AcceptSet, MediaType};
pub use tags::{Page, TagIndex, paginate};
pub use upload::{DEFAULT_UPLOAD_TIMEOUT, UploadSessions};
