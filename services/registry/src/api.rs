//! API server builder and router

use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use origin::{Cluster, NodeId};
use serde::Deserialize;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::blob::{self, BlobStore};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{self, ManifestStore};
use crate::path::Endpoint;
use crate::tags::{self, TagIndex};
use crate::upload::{self, DEFAULT_UPLOAD_TIMEOUT, UploadSessions};

/// `Docker-Content-Digest`
pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");

const API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// Largest request body accepted by default: 1 GiB.
pub const DEFAULT_BODY_LIMIT: usize = 1 << 30;

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    cluster: Cluster,
    coordinator: Option<NodeId>,
    body_limit: usize,
    upload_timeout: Duration,
}

impl RegistryBuilder {
    /// Serve content replicated across `cluster`.
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            coordinator: None,
            body_limit: DEFAULT_BODY_LIMIT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        }
    }

    /// The node id stamped on tag writes made through this registry.
    ///
    /// Defaults to the first node of the cluster.
    pub fn coordinator(mut self, id: impl Into<NodeId>) -> Self {
        self.coordinator = Some(id.into());
        self
    }

    /// Largest accepted request body, in bytes.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// How long an upload session may sit idle before it is discarded.
    pub fn upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let coordinator = self
            .coordinator
            .or_else(|| self.cluster.nodes().first().cloned())
            .unwrap_or_else(|| NodeId::from("registry"));

        let blobs = BlobStore::new(self.cluster.clone());
        let registry = Registry {
            manifests: ManifestStore::new(self.cluster.clone(), blobs.clone()),
            tags: TagIndex::new(self.cluster, coordinator),
            uploads: UploadSessions::new(self.upload_timeout),
            blobs,
        };

        Router::new()
            .route("/v2", get(api_version_check))
            .route("/v2/", get(api_version_check))
            .route("/v2/_catalog", get(catalog))
            .route(
                "/v2/{*path}",
                get(dispatch_get)
                    .head(dispatch_head)
                    .put(dispatch_put)
                    .post(dispatch_post)
                    .patch(dispatch_patch)
                    .delete(dispatch_delete),
            )
            .with_state(registry)
            .layer(DefaultBodyLimit::max(self.body_limit))
            .layer(SetResponseHeaderLayer::overriding(
                API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(TraceLayer::new_for_http())
    }
}

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub(crate) struct Registry {
    pub(crate) blobs: BlobStore,
    pub(crate) manifests: ManifestStore,
    pub(crate) tags: TagIndex,
    pub(crate) uploads: UploadSessions,
}

/// Query parameters understood by any endpoint.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct Params {
    /// Page size for listings.
    pub(crate) n: Option<usize>,
    /// Last entry of the previous page.
    pub(crate) last: Option<String>,
    /// Expected digest of an upload.
    pub(crate) digest: Option<String>,
    /// Blob to mount from another repository.
    pub(crate) mount: Option<String>,
    /// Repository to mount from.
    pub(crate) from: Option<String>,
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn catalog(
    State(registry): State<Registry>,
    Query(params): Query<Params>,
) -> RegistryResult<Response> {
    tags::catalog(&registry, &params).await
}

fn unsupported(method: &str, path: &str) -> RegistryError {
    RegistryError::Unsupported(format!("{method} /v2/{path}"))
}

#[tracing::instrument(skip_all, fields(%path))]
async fn dispatch_get(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Manifest {
            repository,
            reference,
        } => manifest::get_manifest(&registry, &repository, &reference, &headers).await,
        Endpoint::Blob { digest, .. } => blob::get_blob(&registry, &digest).await,
        Endpoint::Tags { repository } => tags::list_tags(&registry, &repository, &params).await,
        Endpoint::Upload { repository, id } => {
            upload::upload_status(&registry, &repository, &id).await
        }
        Endpoint::Uploads { .. } => Err(unsupported("GET", &path)),
    }
}

#[tracing::instrument(skip_all, fields(%path))]
async fn dispatch_head(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Manifest {
            repository,
            reference,
        } => manifest::head_manifest(&registry, &repository, &reference, &headers).await,
        Endpoint::Blob { digest, .. } => blob::head_blob(&registry, &digest).await,
        _ => Err(unsupported("HEAD", &path)),
    }
}

#[tracing::instrument(skip_all, fields(%path, size = body.len()))]
async fn dispatch_put(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Manifest {
            repository,
            reference,
        } => manifest::put_manifest(&registry, &repository, &reference, &headers, body).await,
        Endpoint::Upload { repository, id } => {
            upload::finish_upload(&registry, &repository, &id, &params, &headers, body).await
        }
        _ => Err(unsupported("PUT", &path)),
    }
}

#[tracing::instrument(skip_all, fields(%path, size = body.len()))]
async fn dispatch_post(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Uploads { repository } => {
            upload::start_upload(&registry, &repository, &params, &headers, body).await
        }
        _ => Err(unsupported("POST", &path)),
    }
}

#[tracing::instrument(skip_all, fields(%path, size = body.len()))]
async fn dispatch_patch(
    State(registry): State<Registry>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Upload { repository, id } => {
            upload::patch_upload(&registry, &repository, &id, &headers, body).await
        }
        _ => Err(unsupported("PATCH", &path)),
    }
}

/// Only upload sessions can be deleted. Stored content is immutable.
#[tracing::instrument(skip_all, fields(%path))]
async fn dispatch_delete(
    State(registry): State<Registry>,
    Path(path): Path<String>,
) -> RegistryResult<Response> {
    match Endpoint::parse(&path)? {
        Endpoint::Upload { repository, id } => {
            Ok(upload::cancel_upload(&registry, &repository, &id)
                .await?
                .into_response())
        }
        _ => Err(unsupported("DELETE", &path)),
    }
}
