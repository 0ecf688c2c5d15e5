//! Error types for the registry

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use origin::{ClusterError, Digest, DigestError, Key};
use serde_json::json;

use crate::media::{MediaType, NotAcceptable};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Seconds a client should wait before retrying a 503.
const RETRY_AFTER: &str = "1";

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest or tag not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Repository not known to the registry
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Upload session not found
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Invalid tag name
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// A manifest references content the registry does not hold
    #[error("manifest references unknown content {0}")]
    UnresolvedReference(Digest),

    /// No acceptable representation of the manifest exists
    #[error("manifest cannot be served as any of {}", .0.requested.join(", "))]
    NotAcceptable(NotAcceptable),

    /// Range not satisfiable
    #[error("range not satisfiable: upload is at offset {offset}")]
    RangeNotSatisfiable {
        /// Bytes received so far.
        offset: u64,
    },

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Not enough origins are reachable to serve the request
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Origins ran out of space
    #[error("storage full: {0}")]
    StorageFull(String),

    /// The operation is not supported on this resource
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// No endpoint at this path
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::NameUnknown(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnresolvedReference(_) => StatusCode::FAILED_DEPENDENCY,
            RegistryError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            RegistryError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::StorageFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidDigest(_) => "DIGEST_INVALID",
            RegistryError::InvalidManifest(_) => "MANIFEST_INVALID",
            RegistryError::DigestMismatch { .. } => "DIGEST_INVALID",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::UnresolvedReference(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::NotAcceptable(_) => "MANIFEST_UNACCEPTABLE",
            RegistryError::RangeNotSatisfiable { .. } | RegistryError::BlobUploadInvalid(_) => {
                "BLOB_UPLOAD_INVALID"
            }
            RegistryError::Unavailable(_) => "UNAVAILABLE",
            RegistryError::StorageFull(_) => "STORAGE_FULL",
            RegistryError::Unsupported(_) | RegistryError::UnknownEndpoint(_) => "UNSUPPORTED",
            RegistryError::Internal(_) => "UNKNOWN",
        }
    }

    fn detail(&self) -> Option<serde_json::Value> {
        match self {
            RegistryError::NotAcceptable(err) => Some(json!({
                "requested": err.requested,
                "acceptable": err.servable.iter().map(MediaType::as_str).collect::<Vec<_>>(),
            })),
            RegistryError::UnresolvedReference(digest) => Some(json!({ "digest": digest })),
            RegistryError::RangeNotSatisfiable { offset } => Some(json!({ "offset": offset })),
            _ => None,
        }
    }
}

impl From<DigestError> for RegistryError {
    fn from(err: DigestError) -> Self {
        RegistryError::InvalidDigest(err.to_string())
    }
}

impl From<NotAcceptable> for RegistryError {
    fn from(err: NotAcceptable) -> Self {
        RegistryError::NotAcceptable(err)
    }
}

impl From<ClusterError> for RegistryError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(key) => match key {
                Key::Blob(digest) => RegistryError::BlobNotFound(digest.to_string()),
                Key::Manifest(digest) => RegistryError::ManifestNotFound(digest.to_string()),
                Key::Tag { repository, tag } => {
                    RegistryError::ManifestNotFound(format!("{repository}:{tag}"))
                }
                Key::Repository(repository) => RegistryError::NameUnknown(repository),
            },
            ClusterError::DigestMismatch(key) => RegistryError::DigestMismatch {
                expected: key
                    .digest()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| key.to_string()),
                actual: "content with a different digest".into(),
            },
            err @ (ClusterError::Unavailable { .. } | ClusterError::ReplicationTimeout { .. }) => {
                RegistryError::Unavailable(err.to_string())
            }
            err @ ClusterError::StorageFull { .. } => RegistryError::StorageFull(err.to_string()),
            err @ (ClusterError::Corrupt { .. } | ClusterError::Config(_)) => {
                RegistryError::Internal(err.to_string())
            }
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER));
        }
        response
    }
}
