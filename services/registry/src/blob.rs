//! Blob operations for the registry

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use origin::{Cluster, Digest, Key};

use crate::api::{DOCKER_CONTENT_DIGEST, Registry};
use crate::error::{RegistryError, RegistryResult};

/// Content-addressed storage of raw bytes, replicated across the cluster.
///
/// Blobs are global: the repository in a request path scopes nothing.
/// Writing the same bytes twice stores them once.
#[derive(Debug, Clone)]
pub struct BlobStore {
    cluster: Cluster,
}

impl BlobStore {
    /// Store blobs in `cluster`.
    pub fn new(cluster: Cluster) -> Self {
        Self { cluster }
    }

    /// Store `content` under its sha256 digest.
    #[tracing::instrument(skip_all, fields(size = content.len()))]
    pub async fn put(&self, content: Bytes) -> RegistryResult<Digest> {
        let digest = Digest::sha256(&content);
        self.cluster.put(&Key::Blob(digest.clone()), content).await?;
        tracing::debug!(%digest, "Stored blob");
        Ok(digest)
    }

    /// Store `content` under a digest supplied by the client.
    #[tracing::instrument(skip(self, content), fields(size = content.len()))]
    pub async fn put_verified(&self, expected: &Digest, content: Bytes) -> RegistryResult<()> {
        if !expected.verify(&content) {
            return Err(RegistryError::DigestMismatch {
                expected: expected.to_string(),
                actual: Digest::compute(expected.algorithm(), &content).to_string(),
            });
        }
        self.cluster.put(&Key::Blob(expected.clone()), content).await?;
        Ok(())
    }

    /// Fetch a blob.
    pub async fn get(&self, digest: &Digest) -> RegistryResult<Bytes> {
        Ok(self.cluster.get(&Key::Blob(digest.clone())).await?)
    }

    /// Whether the blob is stored.
    pub async fn exists(&self, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.cluster.exists(&Key::Blob(digest.clone())).await?)
    }

    /// Size of a stored blob, without fetching it.
    pub async fn size(&self, digest: &Digest) -> RegistryResult<u64> {
        Ok(self.cluster.size(&Key::Blob(digest.clone())).await?)
    }
}

/// `GET /v2/<name>/blobs/<digest>`
pub(crate) async fn get_blob(registry: &Registry, digest: &Digest) -> RegistryResult<Response> {
    let data = registry.blobs.get(digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        data,
    )
        .into_response())
}

/// `HEAD /v2/<name>/blobs/<digest>`
pub(crate) async fn head_blob(registry: &Registry, digest: &Digest) -> RegistryResult<Response> {
    let size = registry.blobs.size(digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn store() -> BlobStore {
        BlobStore::new(testing::cluster(3))
    }

    #[tokio::test]
    async fn stores_by_content_digest() {
        let blobs = store();
        let digest = blobs.put(Bytes::from_static(b"layer")).await.unwrap();
        assert_eq!(digest, Digest::sha256(b"layer"));
        assert!(blobs.exists(&digest).await.unwrap());
        assert_eq!(blobs.get(&digest).await.unwrap(), Bytes::from_static(b"layer"));
        assert_eq!(blobs.size(&digest).await.unwrap(), 5);

        let again = blobs.put(Bytes::from_static(b"layer")).await.unwrap();
        assert_eq!(again, digest);
    }

    #[tokio::test]
    async fn rejects_content_that_does_not_match() {
        let blobs = store();
        let err = blobs
            .put_verified(&Digest::sha256(b"expected"), Bytes::from_static(b"actual"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        assert!(!blobs.exists(&Digest::sha256(b"actual")).await.unwrap());
    }

    #[tokio::test]
    async fn missing_blobs_are_blob_unknown() {
        let blobs = store();
        let err = blobs.get(&Digest::sha256(b"missing")).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UNKNOWN");
        let err = blobs.size(&Digest::sha256(b"missing")).await.unwrap_err();
        assert_eq!(err.error_code(), "BLOB_UNKNOWN");
    }
}
