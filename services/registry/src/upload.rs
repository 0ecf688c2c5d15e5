//! Blob upload sessions.
//!
//! An upload is opened with `POST`, fed with any number of `PATCH` chunks
//! and finished with a `PUT` naming the expected digest. Sessions live in the
//! memory of the node that opened them; the completed blob is written to the
//! cluster like any other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use origin::Digest;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::api::{DOCKER_CONTENT_DIGEST, Params, Registry};
use crate::error::{RegistryError, RegistryResult};
use crate::path::validate_repository;

/// `Docker-Upload-UUID`
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// How long an upload session may sit idle before it is discarded.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct Session {
    repository: String,
    data: BytesMut,
    started: DateTime<Utc>,
    touched: Instant,
}

/// In-progress uploads, keyed by session id.
///
/// A session that receives nothing for the idle timeout is dropped along
/// with its buffered data.
#[derive(Debug, Clone)]
pub struct UploadSessions {
    sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
    timeout: Duration,
}

impl Default for UploadSessions {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_TIMEOUT)
    }
}

impl UploadSessions {
    /// Track sessions, dropping any idle for longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::default(),
            timeout,
        }
    }

    /// Open a session for `repository`.
    pub fn start(&self, repository: &str) -> Uuid {
        self.purge_expired();

        let id = Uuid::new_v4();
        self.sessions.lock().insert(
            id,
            Session {
                repository: repository.to_owned(),
                data: BytesMut::new(),
                started: Utc::now(),
                touched: Instant::now(),
            },
        );
        tracing::debug!(%id, %repository, "Opened upload session");
        id
    }

    /// Drop every idle session. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.touched.elapsed() < self.timeout;
            if !keep {
                tracing::debug!(
                    %id,
                    repository = %session.repository,
                    received = session.data.len(),
                    "Expired upload session"
                );
            }
            keep
        });
        before - sessions.len()
    }

    fn with_session<T>(
        &self,
        repository: &str,
        id: &str,
        f: impl FnOnce(&mut Session) -> RegistryResult<T>,
    ) -> RegistryResult<T> {
        let unknown = || RegistryError::BlobUploadUnknown(id.to_owned());
        let uuid = Uuid::parse_str(id).map_err(|_| unknown())?;
        let mut sessions = self.sessions.lock();
        let expired = sessions
            .get(&uuid)
            .is_some_and(|session| session.touched.elapsed() >= self.timeout);
        if expired {
            sessions.remove(&uuid);
            tracing::debug!(%id, "Expired upload session");
            return Err(unknown());
        }

        match sessions.get_mut(&uuid) {
            Some(session) if session.repository == repository => {
                session.touched = Instant::now();
                f(session)
            }
            _ => Err(unknown()),
        }
    }

    /// Bytes received so far.
    pub fn offset(&self, repository: &str, id: &str) -> RegistryResult<u64> {
        self.with_session(repository, id, |session| Ok(session.data.len() as u64))
    }

    /// Append a chunk. When `start` is given it must equal the current offset.
    pub fn append(
        &self,
        repository: &str,
        id: &str,
        start: Option<u64>,
        chunk: &[u8],
    ) -> RegistryResult<u64> {
        self.with_session(repository, id, |session| {
            let offset = session.data.len() as u64;
            if start.is_some_and(|start| start != offset) {
                return Err(RegistryError::RangeNotSatisfiable { offset });
            }
            session.data.extend_from_slice(chunk);
            Ok(session.data.len() as u64)
        })
    }

    /// The full content if `last` were appended, leaving the session open.
    pub fn content(&self, repository: &str, id: &str, last: &[u8]) -> RegistryResult<Bytes> {
        self.with_session(repository, id, |session| {
            let mut content = BytesMut::with_capacity(session.data.len() + last.len());
            content.extend_from_slice(&session.data);
            content.extend_from_slice(last);
            Ok(content.freeze())
        })
    }

    /// Close a session, discarding its data.
    pub fn cancel(&self, repository: &str, id: &str) -> RegistryResult<()> {
        self.with_session(repository, id, |_| Ok(()))?;
        if let Ok(uuid) = Uuid::parse_str(id) {
            if let Some(session) = self.sessions.lock().remove(&uuid) {
                tracing::debug!(
                    %id,
                    repository = %session.repository,
                    received = session.data.len(),
                    age_ms = (Utc::now() - session.started).num_milliseconds(),
                    "Closed upload session"
                );
            }
        }
        Ok(())
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse `Content-Range: <start>-<end>` into the start offset, checking the
/// range covers exactly `len` bytes.
fn content_range(headers: &HeaderMap, len: usize) -> RegistryResult<Option<u64>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || RegistryError::BlobUploadInvalid(format!("bad Content-Range {value:?}"));
    let text = value.to_str().map_err(|_| invalid())?;
    let text = text
        .trim()
        .trim_start_matches("bytes")
        .trim_start_matches(|c: char| c == '=' || c.is_whitespace());
    let (start, end) = text.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start.trim().parse().map_err(|_| invalid())?;
    let end: u64 = end.trim().parse().map_err(|_| invalid())?;

    if len > 0 && end.checked_sub(start).map(|span| span + 1) != Some(len as u64) {
        return Err(RegistryError::RangeNotSatisfiable { offset: start });
    }
    Ok(Some(start))
}

fn session_location(repository: &str, id: &str) -> String {
    format!("/v2/{repository}/blobs/uploads/{id}")
}

/// The `Range` header for an upload at `offset`.
fn range(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}

fn blob_created(repository: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{repository}/blobs/{digest}")),
            (header::CONTENT_LENGTH, "0".to_owned()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response()
}

fn session_accepted(status: StatusCode, repository: &str, id: &str, offset: u64) -> Response {
    (
        status,
        [
            (header::LOCATION, session_location(repository, id)),
            (header::RANGE, range(offset)),
            (header::CONTENT_LENGTH, "0".to_owned()),
            (DOCKER_UPLOAD_UUID, id.to_owned()),
        ],
    )
        .into_response()
}

fn requested_digest(params: &Params, headers: &HeaderMap) -> RegistryResult<Option<Digest>> {
    let value = match &params.digest {
        Some(digest) => Some(digest.as_str()),
        None => headers.get("digest").and_then(|value| value.to_str().ok()),
    };
    Ok(value.map(str::parse::<Digest>).transpose()?)
}

/// `POST /v2/<name>/blobs/uploads/`
///
/// With `?digest=` the body is the whole blob. With `?mount=&from=` an
/// existing blob is linked without upload. Otherwise a session is opened.
pub(crate) async fn start_upload(
    registry: &Registry,
    repository: &str,
    params: &Params,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    if let Some(digest) = requested_digest(params, headers)? {
        registry.blobs.put_verified(&digest, body).await?;
        return Ok(blob_created(repository, &digest));
    }

    if let Some(mount) = &params.mount {
        let digest: Digest = mount.parse()?;
        if let Some(from) = &params.from {
            validate_repository(from)?;
        }
        if registry.blobs.exists(&digest).await? {
            tracing::debug!(%digest, %repository, "Mounted existing blob");
            return Ok(blob_created(repository, &digest));
        }
    }

    let id = registry.uploads.start(repository).to_string();
    let offset = if body.is_empty() {
        0
    } else {
        registry.uploads.append(repository, &id, None, &body)?
    };
    Ok(session_accepted(
        StatusCode::ACCEPTED,
        repository,
        &id,
        offset,
    ))
}

/// `PATCH /v2/<name>/blobs/uploads/<id>`
pub(crate) async fn patch_upload(
    registry: &Registry,
    repository: &str,
    id: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let start = content_range(headers, body.len())?;
    let offset = registry.uploads.append(repository, id, start, &body)?;
    Ok(session_accepted(StatusCode::ACCEPTED, repository, id, offset))
}

/// `PUT /v2/<name>/blobs/uploads/<id>?digest=<digest>`
///
/// The session stays open until the blob is stored, so a failed write can
/// be retried.
pub(crate) async fn finish_upload(
    registry: &Registry,
    repository: &str,
    id: &str,
    params: &Params,
    headers: &HeaderMap,
    body: Bytes,
) -> RegistryResult<Response> {
    let digest = requested_digest(params, headers)?
        .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".to_owned()))?;

    let content = registry.uploads.content(repository, id, &body)?;
    registry.blobs.put_verified(&digest, content).await?;
    registry.uploads.cancel(repository, id)?;

    Ok(blob_created(repository, &digest))
}

/// `GET /v2/<name>/blobs/uploads/<id>`
pub(crate) async fn upload_status(
    registry: &Registry,
    repository: &str,
    id: &str,
) -> RegistryResult<Response> {
    let offset = registry.uploads.offset(repository, id)?;
    Ok(session_accepted(
        StatusCode::NO_CONTENT,
        repository,
        id,
        offset,
    ))
}

/// `DELETE /v2/<name>/blobs/uploads/<id>`
pub(crate) async fn cancel_upload(
    registry: &Registry,
    repository: &str,
    id: &str,
) -> RegistryResult<StatusCode> {
    registry.uploads.cancel(repository, id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn sessions_track_offsets() {
        let uploads = UploadSessions::default();
        let id = uploads.start("app").to_string();

        assert_eq!(uploads.append("app", &id, None, b"abc").unwrap(), 3);
        assert_eq!(uploads.append("app", &id, Some(3), b"de").unwrap(), 5);
        assert!(matches!(
            uploads.append("app", &id, Some(1), b"x"),
            Err(RegistryError::RangeNotSatisfiable { offset: 5 })
        ));
        assert_eq!(uploads.offset("app", &id).unwrap(), 5);

        assert_eq!(
            uploads.content("app", &id, b"f").unwrap(),
            Bytes::from_static(b"abcdef")
        );
        assert_eq!(uploads.offset("app", &id).unwrap(), 5, "content does not consume");

        uploads.cancel("app", &id).unwrap();
        assert!(uploads.is_empty());
    }

    #[test]
    fn sessions_are_scoped_to_their_repository() {
        let uploads = UploadSessions::default();
        let id = uploads.start("app").to_string();
        assert!(matches!(
            uploads.offset("other", &id),
            Err(RegistryError::BlobUploadUnknown(_))
        ));
        assert!(matches!(
            uploads.offset("app", "not-a-uuid"),
            Err(RegistryError::BlobUploadUnknown(_))
        ));
    }

    #[test]
    fn parses_content_range() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_range(&headers, 4).unwrap(), None);

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("4-7"));
        assert_eq!(content_range(&headers, 4).unwrap(), Some(4));
        assert!(matches!(
            content_range(&headers, 3),
            Err(RegistryError::RangeNotSatisfiable { .. })
        ));

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes=0-4"));
        assert_eq!(content_range(&headers, 5).unwrap(), Some(0));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 5-9"));
        assert_eq!(content_range(&headers, 5).unwrap(), Some(5));

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("garbage"));
        assert!(matches!(
            content_range(&headers, 4),
            Err(RegistryError::BlobUploadInvalid(_))
        ));
    }

    #[test]
    fn idle_sessions_expire() {
        let uploads = UploadSessions::new(Duration::ZERO);
        let id = uploads.start("app").to_string();
        assert!(matches!(
            uploads.offset("app", &id),
            Err(RegistryError::BlobUploadUnknown(_))
        ));
        assert!(uploads.is_empty());

        for _ in 0..3 {
            uploads.start("app");
        }
        assert_eq!(uploads.len(), 1, "opening a session drops idle ones");
        assert_eq!(uploads.purge_expired(), 1);
        assert!(uploads.is_empty());
    }

    #[test]
    fn active_sessions_are_kept() {
        let uploads = UploadSessions::new(Duration::from_secs(60));
        let id = uploads.start("app").to_string();
        uploads.append("app", &id, None, b"abc").unwrap();
        assert_eq!(uploads.purge_expired(), 0);
        assert_eq!(uploads.offset("app", &id).unwrap(), 3);
    }

    #[test]
    fn range_header_is_inclusive() {
        assert_eq!(range(0), "0-0");
        assert_eq!(range(10), "0-9");
    }
}
