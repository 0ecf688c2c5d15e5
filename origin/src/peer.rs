//! The HTTP protocol origins use to reach each other's replicas.
//!
//! | Method | Path | Meaning |
//! |---|---|---|
//! | GET | `/_origin/health` | 200 `{id,state}` when serving, 503 otherwise |
//! | GET / HEAD | `/_origin/objects/{key-path}` | read / size in `Content-Length` |
//! | PUT | `/_origin/objects/{key-path}` | replica write |
//! | GET | `/_origin/list?kind=&repository=` | key paths under a prefix |

use std::{error::Error as StdError, fmt, marker::PhantomData};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{Method, Request, Response, StatusCode},
    response::{IntoResponse, Response as AxumResponse},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tower::{Service, ServiceExt};

use crate::{
    error::{ReplicaError, ReplicaResult},
    key::{Key, ListQuery, Prefix},
    node::{NodeId, NodeState, OriginNode},
    replica::Replica,
};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Body of the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// The answering node.
    pub id: NodeId,
    /// Its state.
    pub state: NodeState,
}

/// Routes serving `node`'s replica to other origins.
pub fn router(node: OriginNode) -> Router {
    Router::new()
        .route("/_origin/health", get(health))
        .route(
            "/_origin/objects/{*path}",
            get(get_object).head(head_object).put(put_object),
        )
        .route("/_origin/list", get(list_objects))
        .layer(DefaultBodyLimit::disable())
        .with_state(node)
}

fn status(error: &ReplicaError) -> StatusCode {
    match error {
        ReplicaError::NotFound(_) => StatusCode::NOT_FOUND,
        ReplicaError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        ReplicaError::StorageFull { .. } => StatusCode::INSUFFICIENT_STORAGE,
        ReplicaError::DigestMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ReplicaError::Decode { .. } => StatusCode::BAD_REQUEST,
        ReplicaError::Protocol { .. } => StatusCode::BAD_GATEWAY,
        ReplicaError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ReplicaError {
    fn into_response(self) -> AxumResponse {
        let status = status(&self);
        if status.is_server_error() {
            tracing::warn!("Peer request failed: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

fn parse_key(path: &str) -> Result<Key, AxumResponse> {
    Key::from_path(path)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no such key path {path}")).into_response())
}

async fn health(State(node): State<OriginNode>) -> AxumResponse {
    let status = match node.state() {
        NodeState::Serving => StatusCode::OK,
        NodeState::Restarting => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = Health {
        id: node.id().clone(),
        state: node.state(),
    };
    (status, Json(body)).into_response()
}

async fn get_object(State(node): State<OriginNode>, Path(path): Path<String>) -> AxumResponse {
    let key = match parse_key(&path) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match node.get(&key).await {
        Ok(data) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(error) => error.into_response(),
    }
}

async fn head_object(State(node): State<OriginNode>, Path(path): Path<String>) -> AxumResponse {
    let key = match parse_key(&path) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match node.size(&key).await {
        Ok(size) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_LENGTH, size.to_string())],
        )
            .into_response(),
        Err(error) => error.into_response(),
    }
}

async fn put_object(
    State(node): State<OriginNode>,
    Path(path): Path<String>,
    body: Bytes,
) -> AxumResponse {
    let key = match parse_key(&path) {
        Ok(key) => key,
        Err(response) => return response,
    };
    match node.put(&key, body).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn list_objects(
    State(node): State<OriginNode>,
    Query(query): Query<ListQuery>,
) -> AxumResponse {
    match node.list(&Prefix::from(query)).await {
        Ok(keys) => {
            let paths: Vec<String> = keys.iter().map(|key| key.path().into_string()).collect();
            Json(paths).into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// A replica on another origin, reached over HTTP.
///
/// Works over any tower HTTP service: a `hyperdriver` client in
/// production, or another origin's [`router`] in-process.
pub struct RemoteOrigin<S, B = hyperdriver::Body> {
    id: NodeId,
    base: String,
    service: S,
    body: PhantomData<fn(B)>,
}

impl<S, B> fmt::Debug for RemoteOrigin<S, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteOrigin")
            .field("id", &self.id)
            .field("base", &self.base)
            .finish()
    }
}

impl<S: Clone, B> Clone for RemoteOrigin<S, B> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            base: self.base.clone(),
            service: self.service.clone(),
            body: PhantomData,
        }
    }
}

impl RemoteOrigin<hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>> {
    /// Reach the origin at `base` (e.g. `http://origin-b:5000`) with a plain HTTP client.
    pub fn http(id: impl Into<NodeId>, base: impl Into<String>) -> Self {
        Self::new(
            id,
            base,
            hyperdriver::Client::build_tcp_http().build_service(),
        )
    }
}

impl<S, B> RemoteOrigin<S, B> {
    /// Reach the origin at `base` through `service`.
    pub fn new(id: impl Into<NodeId>, base: impl Into<String>, service: S) -> Self {
        let base: String = base.into();
        Self {
            id: id.into(),
            base: base.trim_end_matches('/').to_owned(),
            service,
            body: PhantomData,
        }
    }

    fn unavailable(&self, reason: impl fmt::Display) -> ReplicaError {
        ReplicaError::Unavailable {
            node: self.id.clone(),
            reason: reason.to_string(),
        }
    }

    fn protocol(&self, message: impl fmt::Display) -> ReplicaError {
        ReplicaError::Protocol {
            node: self.id.clone(),
            message: message.to_string(),
        }
    }

    /// Turn an unsuccessful response into the error it stands for.
    fn failure(&self, key: Option<&Key>, status: StatusCode, body: &[u8]) -> ReplicaError {
        let message = String::from_utf8_lossy(body);
        match (status, key) {
            (StatusCode::NOT_FOUND, Some(key)) => ReplicaError::NotFound(key.clone()),
            (StatusCode::SERVICE_UNAVAILABLE, _) => self.unavailable(message),
            (StatusCode::INSUFFICIENT_STORAGE, _) => ReplicaError::StorageFull {
                node: self.id.clone(),
            },
            (StatusCode::UNPROCESSABLE_ENTITY, Some(key)) => {
                ReplicaError::DigestMismatch { key: key.clone() }
            }
            (StatusCode::BAD_REQUEST, Some(key)) => ReplicaError::Decode {
                key: key.clone(),
                message: message.into_owned(),
            },
            (status, _) => self.protocol(format!("unexpected {status}: {message}")),
        }
    }
}

impl<S, B, ResB> RemoteOrigin<S, B>
where
    S: Service<Request<B>, Response = Response<ResB>> + Clone + Send + Sync,
    S::Error: Into<BoxError>,
    S::Future: Send,
    B: From<Bytes> + Send,
    ResB: http_body::Body + Send,
    ResB::Data: Send,
    ResB::Error: Into<BoxError>,
{
    async fn send(&self, method: Method, path: &str, body: Bytes) -> ReplicaResult<(StatusCode, Bytes)> {
        let response = self.exchange(method, path, body).await?;
        let status = response.status();
        Ok((status, response.into_body()))
    }

    async fn exchange(&self, method: Method, path: &str, body: Bytes) -> ReplicaResult<Response<Bytes>> {
        let request = Request::builder()
            .method(method)
            .uri(format!("{}{path}", self.base))
            .body(B::from(body))
            .map_err(|error| self.protocol(error))?;

        let response = self
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(|error| self.unavailable(Into::<BoxError>::into(error)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|error| self.unavailable(Into::<BoxError>::into(error)))?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }
}

fn object_path(key: &Key) -> String {
    format!("/_origin/objects/{}", key.path())
}

#[async_trait::async_trait]
impl<S, B, ResB> Replica for RemoteOrigin<S, B>
where
    S: Service<Request<B>, Response = Response<ResB>> + Clone + Send + Sync,
    S::Error: Into<BoxError>,
    S::Future: Send,
    B: From<Bytes> + Send,
    ResB: http_body::Body + Send,
    ResB::Data: Send,
    ResB::Error: Into<BoxError>,
{
    fn id(&self) -> &NodeId {
        &self.id
    }

    async fn ping(&self) -> ReplicaResult<()> {
        let (status, body) = self.send(Method::GET, "/_origin/health", Bytes::new()).await?;
        if status != StatusCode::OK {
            return Err(self.failure(None, status, &body));
        }
        let health: Health = serde_json::from_slice(&body).map_err(|error| self.protocol(error))?;
        if health.id != self.id {
            return Err(self.protocol(format!("answered as {}", health.id)));
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(node = %self.id))]
    async fn put(&self, key: &Key, data: Bytes) -> ReplicaResult<()> {
        let (status, body) = self.send(Method::PUT, &object_path(key), data).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(self.failure(Some(key), status, &body))
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(node = %self.id))]
    async fn get(&self, key: &Key) -> ReplicaResult<Bytes> {
        let (status, body) = self.send(Method::GET, &object_path(key), Bytes::new()).await?;
        if status == StatusCode::OK {
            Ok(body)
        } else {
            Err(self.failure(Some(key), status, &body))
        }
    }

    async fn exists(&self, key: &Key) -> ReplicaResult<bool> {
        let (status, body) = self.send(Method::HEAD, &object_path(key), Bytes::new()).await?;
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.failure(Some(key), status, &body)),
        }
    }

    async fn size(&self, key: &Key) -> ReplicaResult<u64> {
        let response = self.exchange(Method::HEAD, &object_path(key), Bytes::new()).await?;
        if response.status() != StatusCode::OK {
            return Err(self.failure(Some(key), response.status(), response.body()));
        }
        response
            .headers()
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| self.protocol("HEAD response without Content-Length"))
    }

    async fn list(&self, prefix: &Prefix) -> ReplicaResult<Vec<Key>> {
        let query = serde_urlencoded::to_string(ListQuery::from(prefix))
            .map_err(|error| self.protocol(error))?;
        let (status, body) = self
            .send(Method::GET, &format!("/_origin/list?{query}"), Bytes::new())
            .await?;
        if status != StatusCode::OK {
            return Err(self.failure(None, status, &body));
        }

        let paths: Vec<String> =
            serde_json::from_slice(&body).map_err(|error| self.protocol(error))?;
        let mut keys: Vec<Key> = paths
            .iter()
            .filter_map(|path| Key::from_path(path))
            .filter(|key| prefix.matches(key))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{cluster::Cluster, config::ClusterConfig, digest::Digest};

    fn remote(node: &OriginNode) -> RemoteOrigin<Router, axum::body::Body> {
        RemoteOrigin::new(
            node.id().clone(),
            format!("http://{}/", node.id()),
            router(node.clone()),
        )
    }

    #[tokio::test]
    async fn round_trips_objects_over_http() {
        let node = OriginNode::memory("b");
        let peer = remote(&node);

        let data = Bytes::from_static(b"layer");
        let key = Key::Blob(Digest::sha256(&data));

        peer.ping().await.unwrap();
        assert!(!peer.exists(&key).await.unwrap());
        assert!(matches!(peer.get(&key).await, Err(ReplicaError::NotFound(_))));
        assert!(matches!(peer.size(&key).await, Err(ReplicaError::NotFound(_))));

        peer.put(&key, data.clone()).await.unwrap();
        assert!(peer.exists(&key).await.unwrap());
        assert_eq!(peer.size(&key).await.unwrap(), data.len() as u64);
        assert_eq!(peer.get(&key).await.unwrap(), data);
        assert_eq!(peer.list(&Prefix::Blobs).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn maps_statuses_onto_replica_errors() {
        let node = OriginNode::memory("b");
        let peer = remote(&node);

        let key = Key::Blob(Digest::sha256(b"expected"));
        assert!(matches!(
            peer.put(&key, Bytes::from_static(b"actual")).await,
            Err(ReplicaError::DigestMismatch { .. })
        ));

        node.begin_restart();
        assert!(peer.ping().await.unwrap_err().is_unavailable());
        assert!(peer.get(&key).await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn clusters_mix_local_and_remote_replicas() {
        let local = OriginNode::memory("a");
        let far = [OriginNode::memory("b"), OriginNode::memory("c")];

        let mut replicas: Vec<Arc<dyn Replica>> = vec![Arc::new(local.clone())];
        replicas.extend(
            far.iter()
                .map(|node| Arc::new(remote(node)) as Arc<dyn Replica>),
        );
        let cluster = Cluster::new(replicas, &ClusterConfig::default()).unwrap();

        let key = Key::tag("app", "v1");
        let record = crate::TagRecord::new(Digest::sha256(b"m"), chrono::Utc::now(), "a".into());
        cluster.put_tag(&key, &record).await.unwrap();
        assert_eq!(cluster.get_tag(&key).await.unwrap(), record);

        let tags = cluster.list(&Prefix::tags("app")).await.unwrap();
        assert_eq!(tags, vec![key]);
    }
}
