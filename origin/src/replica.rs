use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;

use crate::{
    error::ReplicaResult,
    key::{Key, Prefix},
    node::NodeId,
};

/// One copy of the origin's data, local or across the network.
///
/// Immutable keys are store-if-absent: writing a key that is already present
/// succeeds without touching it. Tag keys carry a JSON
/// [`TagRecord`](crate::TagRecord) and keep whichever record wins under
/// last-writer-wins.
#[async_trait::async_trait]
pub trait Replica: fmt::Debug + Send + Sync {
    /// The node this replica lives on.
    fn id(&self) -> &NodeId;

    /// Succeeds when the replica is serving.
    async fn ping(&self) -> ReplicaResult<()>;

    /// Store `data` under `key`.
    async fn put(&self, key: &Key, data: Bytes) -> ReplicaResult<()>;

    /// Fetch the data stored under `key`.
    async fn get(&self, key: &Key) -> ReplicaResult<Bytes>;

    /// Whether `key` is stored, without transferring it.
    async fn exists(&self, key: &Key) -> ReplicaResult<bool>;

    /// Size in bytes of the data under `key`, without transferring it.
    async fn size(&self, key: &Key) -> ReplicaResult<u64>;

    /// Every stored key in `prefix`, sorted.
    async fn list(&self, prefix: &Prefix) -> ReplicaResult<Vec<Key>>;
}

#[async_trait::async_trait]
impl<R> Replica for Arc<R>
where
    R: ?Sized + Replica,
{
    fn id(&self) -> &NodeId {
        self.deref().id()
    }

    async fn ping(&self) -> ReplicaResult<()> {
        self.deref().ping().await
    }

    async fn put(&self, key: &Key, data: Bytes) -> ReplicaResult<()> {
        self.deref().put(key, data).await
    }

    async fn get(&self, key: &Key) -> ReplicaResult<Bytes> {
        self.deref().get(key).await
    }

    async fn exists(&self, key: &Key) -> ReplicaResult<bool> {
        self.deref().exists(key).await
    }

    async fn size(&self, key: &Key) -> ReplicaResult<u64> {
        self.deref().size(key).await
    }

    async fn list(&self, prefix: &Prefix) -> ReplicaResult<Vec<Key>> {
        self.deref().list(prefix).await
    }
}
