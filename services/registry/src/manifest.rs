//! Manifest operations for the registry

use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use origin::{Cluster, Digest, Key};

use crate::api::{DOCKER_CONTENT_DIGEST, Registry};
use crate::blob::BlobStore;
use crate::error::{RegistryError, RegistryResult};
use crate::media::{AcceptSet, MediaType};
use crate::path::Reference;
use crate::schema::{Manifest, ManifestRecord, References};

/// Manifests stored by digest.
///
/// The raw bytes live in the blob store under the manifest digest, and a
/// [`ManifestRecord`] next to them remembers the native media type. A
/// manifest only exists once its record is written, which happens after
/// the bytes are stored and every reference has been checked.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    cluster: Cluster,
    blobs: BlobStore,
}

/// A manifest chosen for a response.
#[derive(Debug, Clone)]
pub struct Served {
    /// The manifest digest.
    pub digest: Digest,
    /// The media type negotiated for the response.
    pub media_type: MediaType,
    /// The stored record.
    pub record: ManifestRecord,
}

impl ManifestStore {
    /// Store manifests in `cluster`, with raw bytes in `blobs`.
    pub fn new(cluster: Cluster, blobs: BlobStore) -> Self {
        Self { cluster, blobs }
    }

    /// Check that everything `manifest` references is stored.
    async fn resolve(&self, manifest: &Manifest) -> RegistryResult<()> {
        match &manifest.references {
            References::Leaf { config, layers } => {
                for descriptor in std::iter::once(config).chain(layers) {
                    if !self.blobs.exists(&descriptor.digest).await? {
                        return Err(RegistryError::UnresolvedReference(
                            descriptor.digest.clone(),
                        ));
                    }
                }
            }
            References::List { children } => {
                for child in children {
                    if !self
                        .cluster
                        .exists(&Key::Manifest(child.digest.clone()))
                        .await?
                    {
                        return Err(RegistryError::UnresolvedReference(child.digest.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate and store `raw`, declared as `content_type`.
    pub async fn put(&self, raw: Bytes, content_type: Option<&str>) -> RegistryResult<Digest> {
        let manifest = Manifest::parse(raw, content_type)?;
        self.store(&manifest).await?;
        Ok(manifest.digest)
    }

    /// Store a validated manifest.
    #[tracing::instrument(skip_all, fields(digest = %manifest.digest, media_type = %manifest.media_type))]
    pub async fn store(&self, manifest: &Manifest) -> RegistryResult<()> {
        self.resolve(manifest).await?;

        self.blobs
            .put_verified(&manifest.digest, manifest.raw.clone())
            .await?;

        let record = serde_json::to_vec(&manifest.record())
            .map_err(|err| RegistryError::Internal(err.to_string()))?;
        self.cluster
            .put(&Key::Manifest(manifest.digest.clone()), record.into())
            .await?;

        tracing::debug!("Stored manifest");
        Ok(())
    }

    /// The stored record for `digest`.
    pub async fn record(&self, digest: &Digest) -> RegistryResult<ManifestRecord> {
        let data = self.cluster.get(&Key::Manifest(digest.clone())).await?;
        serde_json::from_slice(&data).map_err(|err| {
            RegistryError::Internal(format!("manifest record {digest} is corrupt: {err}"))
        })
    }

    /// Whether a manifest is stored under `digest`.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.cluster.exists(&Key::Manifest(digest.clone())).await?)
    }

    /// Pick the representation of `digest` to serve, without reading its bytes.
    pub async fn negotiate(&self, digest: &Digest, accept: &AcceptSet) -> RegistryResult<Served> {
        let record = self.record(digest).await?;
        let media_type = accept.negotiate(record.media_type)?;
        Ok(Served {
            digest: digest.clone(),
            media_type,
            record,
        })
    }

    /// The bytes of `digest` and how to serve them.
    pub async fn get(&self, digest: &Digest, accept: &AcceptSet) -> RegistryResult<(Bytes, Served)> {
        let served = self.negotiate(digest, accept).await?;
        let raw = self.raw(digest).await?;
        Ok((raw, served))
    }

    /// The raw bytes of a manifest.
    pub async fn raw(&self, digest: &Digest) -> RegistryResult<Bytes> {
        self.blobs.get(digest).await.map_err(|err| match err {
            RegistryError::BlobNotFound(_) => RegistryError::ManifestNotFound(digest.to_string()),
            err => err,
        })
    }
}

async fn resolve_reference(
    registry: &Registry,
    repository: &str,
    reference: &Reference,
) -> RegistryResult<Digest> {
    match reference {
        Reference::Digest(digest) => Ok(digest.clone()),
        Reference::Tag(tag) => registry.tags.resolve_tag(repository, tag).await,
    }
}

fn manifest_headers(served: &Served) -> [(header::HeaderName, String); 3] {
    [
        (header::CONTENT_TYPE, served.media_type.as_str().to_owned()),
        (header::CONTENT_LENGTH, served.record.size.to_string()),
        (DOCKER_CONTENT_DIGEST, served.digest.to_string()),
    ]
}

/// `GET /v2/<name>/manifests/<reference>`
///
/// Content negotiation happens before the bytes are fetched, so a 406 never
/// costs a blob read.
pub(crate) async fn get_manifest(
    registry: &Registry,
    repository: &str,
    reference: &Reference,
    headers: &HeaderMap,
) -> RegistryResult<Response> {
    let digest = resolve_reference(registry, repository, reference).await?;
    let (raw, served) = registry
        .manifests
        .get(&digest, &AcceptSet::from_headers(headers))
        .await?;

    Ok((StatusCode::OK, manifest_headers(&served), raw).into_response())
}

/// `HEAD /v2/<name>/manifests/<reference>`
pub(crate) async fn head_manifest(
    registry: &Registry,
    repository: &str,
    reference: &Reference,
    headers: &HeaderMap,
) -> RegistryResult<Response> {
    let digest = resolve_reference(registry, repository, reference).await?;
    let served = registry
        .manifests
        .negotiate(&digest, &AcceptSet::from_headers(headers))
        .await?;

    Ok((StatusCode::OK, manifest_headers(&served)).into_response())
}

/// `PUT /v2/<name>/manifests/<reference>`
pub(crate) async fn put_manifest(
    registry: &Registry,
    repository: &str,
    reference: &Reference,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let manifest = Manifest::parse(body, content_type)?;

    if let Reference::Digest(expected) = reference {
        if *expected != manifest.digest {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: manifest.digest.to_string(),
            });
        }
    }

    registry.manifests.store(&manifest).await?;
    registry.tags.add_repository(repository).await?;
    if let Reference::Tag(tag) = reference {
        registry
            .tags
            .set_tag(repository, tag, &manifest.digest)
            .await?;
    }

    Ok((
        StatusCode::CREATED,
        [
            (
                header::LOCATION,
                format!("/v2/{repository}/manifests/{}", manifest.digest),
            ),
            (header::CONTENT_LENGTH, "0".to_owned()),
            (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
        ],
    )
        .into_response())
}
