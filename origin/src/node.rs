//! A single origin node and its node-local state.

use std::{borrow::Borrow, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use storage::{Storage, StorageBucket};

use crate::{
    error::{ReplicaError, ReplicaResult},
    key::{Key, Prefix},
    record::TagRecord,
    replica::Replica,
};

/// Bucket every origin keeps its entities in.
pub(crate) const BUCKET: &str = "origin";

/// The name of an origin node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a node is taking requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    /// Accepting requests.
    Serving,
    /// Refusing requests until the restart completes.
    Restarting,
}

#[derive(Debug)]
struct NodeInner {
    id: NodeId,
    bucket: StorageBucket,
    state: RwLock<NodeState>,
    tags: tokio::sync::Mutex<()>,
}

/// An origin node backed by local storage.
///
/// Cloning is cheap; clones share state. Restarting a node only changes
/// whether it answers: persisted objects survive.
#[derive(Debug, Clone)]
pub struct OriginNode {
    inner: Arc<NodeInner>,
}

impl OriginNode {
    /// Create a serving node keeping its objects in `storage`.
    pub fn new(id: impl Into<NodeId>, storage: &Storage) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                id: id.into(),
                bucket: storage.bucket(BUCKET),
                state: RwLock::new(NodeState::Serving),
                tags: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a serving node with in-memory storage.
    pub fn memory(id: impl Into<NodeId>) -> Self {
        Self::new(id, &storage::MemoryStorage::new().into())
    }

    /// The current state.
    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    /// Whether the node is serving.
    pub fn is_serving(&self) -> bool {
        self.state() == NodeState::Serving
    }

    /// Stop answering requests.
    pub fn begin_restart(&self) {
        *self.inner.state.write() = NodeState::Restarting;
        tracing::info!(node = %self.inner.id, "Origin restarting");
    }

    /// Resume answering requests.
    pub fn finish_restart(&self) {
        *self.inner.state.write() = NodeState::Serving;
        tracing::info!(node = %self.inner.id, "Origin serving");
    }

    /// Go through a full restart cycle, unavailable for `downtime`.
    pub async fn restart(&self, downtime: Duration) {
        self.begin_restart();
        tokio::time::sleep(downtime).await;
        self.finish_restart();
    }

    fn check(&self) -> ReplicaResult<()> {
        match self.state() {
            NodeState::Serving => Ok(()),
            NodeState::Restarting => Err(ReplicaError::Unavailable {
                node: self.inner.id.clone(),
                reason: "restarting".into(),
            }),
        }
    }

    fn storage_error(&self, key: &Key) -> impl FnOnce(storage::StorageError) -> ReplicaError {
        let node = self.inner.id.clone();
        let key = key.clone();
        move |error| ReplicaError::storage(&node, &key, error)
    }

    async fn read(&self, key: &Key) -> ReplicaResult<Bytes> {
        self.inner
            .bucket
            .read(&key.path())
            .await
            .map_err(self.storage_error(key))
    }

    async fn write(&self, key: &Key, data: &[u8]) -> ReplicaResult<()> {
        self.inner
            .bucket
            .write(&key.path(), data)
            .await
            .map_err(self.storage_error(key))
    }

    async fn contains(&self, key: &Key) -> ReplicaResult<bool> {
        self.inner
            .bucket
            .exists(&key.path())
            .await
            .map_err(self.storage_error(key))
    }

    async fn put_tag(&self, key: &Key, data: &[u8]) -> ReplicaResult<()> {
        let incoming = decode_tag(key, data)?;

        let _guard = self.inner.tags.lock().await;
        match self.read(key).await {
            Ok(stored) => {
                let stored = decode_tag(key, &stored)?;
                if !incoming.supersedes(&stored) {
                    tracing::trace!(%key, "Keeping newer tag record");
                    return Ok(());
                }
            }
            Err(ReplicaError::NotFound(_)) => {}
            Err(error) => return Err(error),
        }
        self.write(key, data).await
    }
}

/// Decode a stored or incoming tag record.
pub(crate) fn decode_tag(key: &Key, data: &[u8]) -> ReplicaResult<TagRecord> {
    serde_json::from_slice(data).map_err(|error| ReplicaError::Decode {
        key: key.clone(),
        message: error.to_string(),
    })
}

#[async_trait::async_trait]
impl Replica for OriginNode {
    fn id(&self) -> &NodeId {
        &self.inner.id
    }

    async fn ping(&self) -> ReplicaResult<()> {
        self.check()
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(node = %self.inner.id, size = data.len()))]
    async fn put(&self, key: &Key, data: Bytes) -> ReplicaResult<()> {
        self.check()?;

        if let Key::Blob(digest) = key {
            if !digest.verify(&data) {
                return Err(ReplicaError::DigestMismatch { key: key.clone() });
            }
        }

        if key.is_mutable() {
            return self.put_tag(key, &data).await;
        }

        if self.contains(key).await? {
            let Key::Blob(digest) = key else {
                tracing::trace!(%key, "Already stored");
                return Ok(());
            };
            match self.read(key).await {
                Ok(stored) if digest.verify(&stored) => {
                    tracing::trace!(%key, "Already stored");
                    return Ok(());
                }
                Ok(_) => tracing::warn!(%key, "Replacing corrupt copy"),
                Err(ReplicaError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }
        self.write(key, &data).await
    }

    #[tracing::instrument(level = "trace", skip(self), fields(node = %self.inner.id))]
    async fn get(&self, key: &Key) -> ReplicaResult<Bytes> {
        self.check()?;
        self.read(key).await
    }

    async fn exists(&self, key: &Key) -> ReplicaResult<bool> {
        self.check()?;
        self.contains(key).await
    }

    async fn size(&self, key: &Key) -> ReplicaResult<u64> {
        self.check()?;
        self.inner
            .bucket
            .metadata(&key.path())
            .await
            .map(|metadata| metadata.size)
            .map_err(self.storage_error(key))
    }

    #[tracing::instrument(level = "trace", skip(self), fields(node = %self.inner.id))]
    async fn list(&self, prefix: &Prefix) -> ReplicaResult<Vec<Key>> {
        self.check()?;
        let paths = self
            .inner
            .bucket
            .list(Some(&prefix.path()))
            .await
            .map_err(ReplicaError::Storage)?;

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
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::digest::Digest;

    fn tag(digest: &Digest, micros: i64, origin: &str) -> Bytes {
        let record = TagRecord::new(
            digest.clone(),
            DateTime::<Utc>::from_timestamp_micros(micros).unwrap(),
            origin.into(),
        );
        serde_json::to_vec(&record).unwrap().into()
    }

    #[tokio::test]
    async fn blob_writes_are_idempotent_and_verified() {
        let node = OriginNode::memory("a");
        let data = Bytes::from_static(b"layer");
        let key = Key::Blob(Digest::sha256(&data));

        node.put(&key, data.clone()).await.unwrap();
        node.put(&key, data.clone()).await.unwrap();
        assert_eq!(node.get(&key).await.unwrap(), data);
        assert_eq!(node.list(&Prefix::Blobs).await.unwrap(), vec![key.clone()]);

        let err = node
            .put(&key, Bytes::from_static(b"tampered"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn corrupt_blobs_are_overwritten() {
        let node = OriginNode::memory("a");
        let data = Bytes::from_static(b"layer");
        let key = Key::Blob(Digest::sha256(&data));

        node.write(&key, b"garbage").await.unwrap();
        node.put(&key, data.clone()).await.unwrap();
        assert_eq!(node.get(&key).await.unwrap(), data);
        assert_eq!(node.size(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn tag_writes_keep_the_newest_record() {
        let node = OriginNode::memory("a");
        let key = Key::tag("app", "latest");
        let first = Digest::sha256(b"one");
        let second = Digest::sha256(b"two");

        node.put(&key, tag(&second, 20, "a")).await.unwrap();
        node.put(&key, tag(&first, 10, "b")).await.unwrap();

        let stored = decode_tag(&key, &node.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored.digest, second);
    }

    #[tokio::test]
    async fn restarting_nodes_are_unavailable_but_keep_data() {
        let node = OriginNode::memory("a");
        let key = Key::Repository("app".into());
        node.put(&key, Bytes::new()).await.unwrap();

        node.begin_restart();
        assert!(node.ping().await.unwrap_err().is_unavailable());
        assert!(node.get(&key).await.unwrap_err().is_unavailable());

        node.finish_restart();
        assert!(node.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn missing_keys_are_not_found() {
        let node = OriginNode::memory("a");
        let key = Key::Manifest(Digest::sha256(b"{}"));
        assert!(matches!(
            node.get(&key).await,
            Err(ReplicaError::NotFound(k)) if k == key
        ));
        assert!(!node.exists(&key).await.unwrap());
        assert!(matches!(node.size(&key).await, Err(ReplicaError::NotFound(_))));
    }
}
