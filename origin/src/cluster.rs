//! The HA router: one logical store over every origin's replica.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

use crate::{
    config::{ClusterConfig, ConfigError, ReplicationPlan},
    error::{ClusterError, ClusterResult, ReplicaError, ReplicaResult},
    key::{Key, Prefix},
    node::{decode_tag, NodeId},
    placement,
    record::TagRecord,
    replica::Replica,
};

type DynReplica = Arc<dyn Replica>;

#[derive(Debug)]
struct Inner {
    ids: Vec<NodeId>,
    replicas: Vec<DynReplica>,
    health: Vec<AtomicBool>,
    hints: Mutex<HashMap<usize, BTreeSet<Key>>>,
    plan: ReplicationPlan,
}

/// A replicated store spanning every origin node.
///
/// Each key is placed on a replica set chosen by rendezvous hashing. Reads
/// fail over along the replica set; writes fan out to the whole set and
/// return once a quorum acknowledged. Replicas that missed a write are
/// caught up later from pending hints and by reconciliation when they come
/// back.
///
/// Cloning is cheap; clones share health and hint state.
#[derive(Debug, Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl Cluster {
    /// Build a cluster over `replicas`, all initially considered healthy.
    pub fn new(replicas: Vec<DynReplica>, config: &ClusterConfig) -> ClusterResult<Self> {
        let plan = config.resolve(replicas.len())?;

        let mut seen = HashSet::new();
        for replica in &replicas {
            if !seen.insert(replica.id().clone()) {
                return Err(ConfigError::DuplicateNode(replica.id().clone()).into());
            }
        }

        tracing::info!(
            nodes = replicas.len(),
            replicas = plan.replicas,
            quorum = plan.quorum,
            "Origin cluster configured"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                ids: replicas.iter().map(|r| r.id().clone()).collect(),
                health: replicas.iter().map(|_| AtomicBool::new(true)).collect(),
                replicas,
                hints: Mutex::new(HashMap::new()),
                plan,
            }),
        })
    }

    /// The resolved replication settings.
    pub fn plan(&self) -> &ReplicationPlan {
        &self.inner.plan
    }

    /// Every node, in configuration order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.inner.ids
    }

    /// Whether the node was reachable at last contact.
    pub fn is_healthy(&self, node: &NodeId) -> bool {
        self.index_of(node)
            .is_some_and(|index| self.inner.health[index].load(Ordering::SeqCst))
    }

    /// The nodes holding `key`, most preferred first.
    pub fn replica_set(&self, key: &Key) -> Vec<NodeId> {
        self.placement(&key.placement())
            .into_iter()
            .map(|index| self.inner.ids[index].clone())
            .collect()
    }

    /// Number of (node, key) copies still waiting to be delivered.
    pub fn pending_hints(&self) -> usize {
        self.inner.hints.lock().values().map(BTreeSet::len).sum()
    }

    fn index_of(&self, node: &NodeId) -> Option<usize> {
        self.inner.ids.iter().position(|id| id == node)
    }

    fn replica(&self, index: usize) -> &DynReplica {
        &self.inner.replicas[index]
    }

    fn placement(&self, token: &str) -> Vec<usize> {
        placement::replica_set(&self.inner.ids, token, self.inner.plan.replicas)
    }

    /// The replica set ordered reachable-first, keeping placement order within each group.
    fn candidates(&self, key: &Key) -> Vec<usize> {
        let mut set = self.placement(&key.placement());
        set.sort_by_key(|&index| !self.inner.health[index].load(Ordering::SeqCst));
        set
    }

    fn mark_down(&self, index: usize, error: &ReplicaError) {
        if self.inner.health[index].swap(false, Ordering::SeqCst) {
            tracing::warn!(node = %self.inner.ids[index], "Origin marked down: {error}");
        }
    }

    /// Run one replica operation under the replica timeout, marking the
    /// replica down when it cannot be reached.
    async fn attempt<T, F>(&self, index: usize, operation: F) -> ReplicaResult<T>
    where
        F: Future<Output = ReplicaResult<T>>,
    {
        let result = match tokio::time::timeout(self.inner.plan.replica_timeout, operation).await
        {
            Ok(result) => result,
            Err(_) => Err(ReplicaError::Unavailable {
                node: self.inner.ids[index].clone(),
                reason: format!("timed out after {:?}", self.inner.plan.replica_timeout),
            }),
        };

        if let Err(error) = &result {
            if error.is_unavailable() {
                self.mark_down(index, error);
            }
        }
        result
    }

    /// Fetch the data stored under `key`.
    ///
    /// Tag keys return the newest record on the replica set, encoded as JSON.
    #[tracing::instrument(skip(self, key), fields(%key))]
    pub async fn get(&self, key: &Key) -> ClusterResult<Bytes> {
        if key.is_mutable() {
            let record = self.read_tag(key).await?;
            return encode_tag(key, &record);
        }

        let mut missing = Vec::new();
        let mut attempts = 0;
        for index in self.candidates(key) {
            attempts += 1;
            match self.attempt(index, self.replica(index).get(key)).await {
                Ok(data) if intact(key, &data) => {
                    if !missing.is_empty() {
                        self.repair(key.clone(), data.clone(), missing);
                    }
                    return Ok(data);
                }
                Ok(_) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica returned corrupt content, trying next");
                    missing.push(index);
                }
                Err(ReplicaError::NotFound(_)) => missing.push(index),
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica read failed, trying next: {error}");
                }
            }
        }

        if missing.is_empty() {
            Err(ClusterError::Unavailable {
                target: key.to_string(),
                attempts,
            })
        } else {
            Err(ClusterError::NotFound(key.clone()))
        }
    }

    /// Whether `key` is stored on any reachable replica.
    #[tracing::instrument(skip(self, key), fields(%key))]
    pub async fn exists(&self, key: &Key) -> ClusterResult<bool> {
        if key.is_mutable() {
            return match self.read_tag(key).await {
                Ok(_) => Ok(true),
                Err(ClusterError::NotFound(_)) => Ok(false),
                Err(error) => Err(error),
            };
        }

        let mut answered = false;
        let mut attempts = 0;
        for index in self.candidates(key) {
            attempts += 1;
            match self.attempt(index, self.replica(index).exists(key)).await {
                Ok(true) => return Ok(true),
                Ok(false) => answered = true,
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica existence check failed: {error}");
                }
            }
        }

        if answered {
            Ok(false)
        } else {
            Err(ClusterError::Unavailable {
                target: key.to_string(),
                attempts,
            })
        }
    }

    /// Size of the data under an immutable `key`, without transferring it.
    #[tracing::instrument(skip(self, key), fields(%key))]
    pub async fn size(&self, key: &Key) -> ClusterResult<u64> {
        let mut answered = false;
        let mut attempts = 0;
        for index in self.candidates(key) {
            attempts += 1;
            match self.attempt(index, self.replica(index).size(key)).await {
                Ok(size) => return Ok(size),
                Err(ReplicaError::NotFound(_)) => answered = true,
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica size check failed: {error}");
                }
            }
        }

        if answered {
            Err(ClusterError::NotFound(key.clone()))
        } else {
            Err(ClusterError::Unavailable {
                target: key.to_string(),
                attempts,
            })
        }
    }

    /// The newest record for a tag key.
    pub async fn get_tag(&self, key: &Key) -> ClusterResult<TagRecord> {
        self.read_tag(key).await
    }

    /// Write a tag record. Replicas keep it only if it is newer than theirs.
    pub async fn put_tag(&self, key: &Key, record: &TagRecord) -> ClusterResult<()> {
        self.put(key, encode_tag(key, record)?).await
    }

    async fn read_tag(&self, key: &Key) -> ClusterResult<TagRecord> {
        let set = self.placement(&key.placement());
        let reads = set.iter().map(|&index| async move {
            (index, self.attempt(index, self.replica(index).get(key)).await)
        });

        let mut records = Vec::new();
        let mut missing = Vec::new();
        for (index, result) in join_all(reads).await {
            match result.and_then(|data| decode_tag(key, &data)) {
                Ok(record) => records.push((index, record)),
                Err(ReplicaError::NotFound(_)) => missing.push(index),
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica tag read failed: {error}");
                }
            }
        }

        let Some(newest) = TagRecord::newest(records.iter().map(|(_, record)| record)).cloned()
        else {
            return if missing.is_empty() {
                Err(ClusterError::Unavailable {
                    target: key.to_string(),
                    attempts: set.len(),
                })
            } else {
                Err(ClusterError::NotFound(key.clone()))
            };
        };

        let stale: Vec<usize> = records
            .iter()
            .filter(|(_, record)| *record != newest)
            .map(|(index, _)| *index)
            .chain(missing)
            .collect();
        if !stale.is_empty() {
            self.repair(key.clone(), encode_tag(key, &newest)?, stale);
        }

        Ok(newest)
    }

    /// Copy `data` onto replicas that lacked it, in the background.
    fn repair(&self, key: Key, data: Bytes, targets: Vec<usize>) {
        let cluster = self.clone();
        tokio::spawn(
            async move {
                for index in targets {
                    match cluster
                        .attempt(index, cluster.replica(index).put(&key, data.clone()))
                        .await
                    {
                        Ok(()) => {
                            tracing::debug!(node = %cluster.inner.ids[index], %key, "Read repair");
                        }
                        Err(error) => {
                            tracing::debug!(node = %cluster.inner.ids[index], %key, "Read repair failed: {error}");
                        }
                    }
                }
            }
            .in_current_span(),
        );
    }

    /// Store `data` under `key` on its replica set.
    ///
    /// Returns once the write quorum acknowledged. Replicas still pending are
    /// left to finish in the background; any that fail keep a hint and are
    /// caught up by [`Cluster::converge`].
    #[tracing::instrument(skip(self, key, data), fields(%key, size = data.len()))]
    pub async fn put(&self, key: &Key, data: Bytes) -> ClusterResult<()> {
        if let Key::Blob(digest) = key {
            if !digest.verify(&data) {
                return Err(ClusterError::DigestMismatch(key.clone()));
            }
        }

        let set = self.placement(&key.placement());
        let required = self.inner.plan.quorum.min(set.len());
        {
            let mut hints = self.inner.hints.lock();
            for &index in &set {
                hints.entry(index).or_default().insert(key.clone());
            }
        }

        let (tx, mut rx) = mpsc::channel(set.len());
        for &index in &set {
            let cluster = self.clone();
            let key = key.clone();
            let data = data.clone();
            let tx = tx.clone();
            tokio::spawn(
                async move {
                    let result = cluster
                        .attempt(index, cluster.replica(index).put(&key, data))
                        .await;
                    match &result {
                        Ok(()) | Err(ReplicaError::DigestMismatch { .. }) => {
                            cluster.clear_hint(index, &key)
                        }
                        Err(error) => {
                            tracing::warn!(node = %cluster.inner.ids[index], "Replica write failed: {error}");
                        }
                    }
                    // The caller may have already returned with a quorum.
                    let _ = tx.send(result).await;
                }
                .in_current_span(),
            );
        }
        drop(tx);

        let mut acks = 0;
        let mut full = false;
        while let Some(result) = rx.recv().await {
            match result {
                Ok(()) => {
                    acks += 1;
                    if acks >= required {
                        tracing::debug!(acks, required, "Write quorum reached");
                        return Ok(());
                    }
                }
                Err(ReplicaError::DigestMismatch { .. }) => {
                    return Err(ClusterError::DigestMismatch(key.clone()))
                }
                Err(ReplicaError::StorageFull { .. }) => full = true,
                Err(_) => {}
            }
        }

        let key = key.clone();
        if full {
            Err(ClusterError::StorageFull {
                key,
                acks,
                required,
            })
        } else {
            Err(ClusterError::ReplicationTimeout {
                key,
                acks,
                required,
            })
        }
    }

    fn clear_hint(&self, index: usize, key: &Key) {
        let mut hints = self.inner.hints.lock();
        if let Some(keys) = hints.get_mut(&index) {
            keys.remove(key);
            if keys.is_empty() {
                hints.remove(&index);
            }
        }
    }

    /// The union of keys in `prefix` across every replica that answered.
    ///
    /// Repository-scoped listings ask that repository's replica set; other
    /// listings ask every node.
    #[tracing::instrument(skip(self))]
    pub async fn list(&self, prefix: &Prefix) -> ClusterResult<Vec<Key>> {
        let targets: Vec<usize> = match prefix.placement() {
            Some(token) => self.placement(&token),
            None => (0..self.inner.replicas.len()).collect(),
        };

        let lists = targets.iter().map(|&index| async move {
            (index, self.attempt(index, self.replica(index).list(prefix)).await)
        });

        let mut keys = BTreeSet::new();
        let mut answered = 0;
        for (index, result) in join_all(lists).await {
            match result {
                Ok(listed) => {
                    answered += 1;
                    keys.extend(listed);
                }
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Replica listing failed: {error}");
                }
            }
        }

        if answered == 0 {
            return Err(ClusterError::Unavailable {
                target: prefix.path().to_string(),
                attempts: targets.len(),
            });
        }
        Ok(keys.into_iter().collect())
    }

    /// Ping every replica, reconciling any that came back since the last check.
    pub async fn check_health(&self) {
        let pings = (0..self.inner.replicas.len())
            .map(|index| async move { (index, self.attempt(index, self.replica(index).ping()).await) });

        let mut recovered = Vec::new();
        for (index, result) in join_all(pings).await {
            match result {
                Ok(()) => {
                    if !self.inner.health[index].swap(true, Ordering::SeqCst) {
                        tracing::info!(node = %self.inner.ids[index], "Origin reachable again");
                        recovered.push(index);
                    }
                }
                Err(error) => self.mark_down(index, &error),
            }
        }

        for index in recovered {
            match self.reconcile(index).await {
                Ok(copied) => {
                    tracing::info!(node = %self.inner.ids[index], copied, "Origin reconciled")
                }
                Err(error) => {
                    tracing::warn!(node = %self.inner.ids[index], "Reconciliation failed: {error}")
                }
            }
        }
    }

    /// Deliver pending hints to healthy replicas.
    pub async fn replay_hints(&self) {
        let pending: Vec<(usize, Vec<Key>)> = {
            let hints = self.inner.hints.lock();
            hints
                .iter()
                .filter(|(index, _)| self.inner.health[**index].load(Ordering::SeqCst))
                .map(|(index, keys)| (*index, keys.iter().cloned().collect()))
                .collect()
        };

        for (index, keys) in pending {
            for key in keys {
                match self.copy_to(index, &key).await {
                    Ok(()) => self.clear_hint(index, &key),
                    Err(ClusterError::NotFound(_)) | Err(ClusterError::DigestMismatch(_)) => {
                        tracing::debug!(node = %self.inner.ids[index], %key, "Dropping undeliverable hint");
                        self.clear_hint(index, &key);
                    }
                    Err(error) => {
                        tracing::debug!(node = %self.inner.ids[index], %key, "Hint replay deferred: {error}");
                        break;
                    }
                }
            }
        }
    }

    /// Copy every key placed on the node at `index` that it is missing.
    /// Returns how many keys were copied.
    async fn reconcile(&self, index: usize) -> ClusterResult<usize> {
        let target = self.replica(index);
        let mut copied = 0;

        for prefix in [
            Prefix::Blobs,
            Prefix::Manifests,
            Prefix::Repositories,
            Prefix::Tags { repository: None },
        ] {
            let placed: Vec<Key> = self
                .list(&prefix)
                .await?
                .into_iter()
                .filter(|key| self.placement(&key.placement()).contains(&index))
                .collect();
            if placed.is_empty() {
                continue;
            }

            let present: HashSet<Key> = self
                .attempt(index, target.list(&prefix))
                .await
                .map_err(|error| {
                    replica_failure(&self.inner.ids[index], prefix.path().as_str(), error)
                })?
                .into_iter()
                .collect();

            for key in placed {
                // Tags are always offered: the replica keeps the newer record.
                if !key.is_mutable() && present.contains(&key) {
                    continue;
                }
                self.copy_to(index, &key).await?;
                self.clear_hint(index, &key);
                copied += 1;
            }
        }

        Ok(copied)
    }

    async fn copy_to(&self, index: usize, key: &Key) -> ClusterResult<()> {
        let data = self.get(key).await?;
        self.attempt(index, self.replica(index).put(key, data))
            .await
            .map_err(|error| replica_failure(&self.inner.ids[index], &key.to_string(), error))
    }

    /// One maintenance pass: health checks (reconciling recovered nodes),
    /// then hint replay.
    pub async fn converge(&self) {
        self.check_health().await;
        self.replay_hints().await;
    }

    /// Run [`Cluster::converge`] every health interval until every clone of
    /// this cluster is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.plan.health_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = inner.upgrade() else {
                    tracing::debug!("Cluster dropped, stopping maintenance");
                    break;
                };
                Cluster { inner }.converge().await;
            }
        })
    }
}

/// Blobs are re-verified on read; a replica holding corrupt bytes counts as missing.
fn intact(key: &Key, data: &[u8]) -> bool {
    match key {
        Key::Blob(digest) => digest.verify(data),
        _ => true,
    }
}

fn encode_tag(key: &Key, record: &TagRecord) -> ClusterResult<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|error| ClusterError::Corrupt {
            key: key.clone(),
            message: error.to_string(),
        })
}

/// Lift a single-replica failure into a cluster error.
fn replica_failure(node: &NodeId, target: &str, error: ReplicaError) -> ClusterError {
    match error {
        ReplicaError::NotFound(key) => ClusterError::NotFound(key),
        ReplicaError::DigestMismatch { key } => ClusterError::DigestMismatch(key),
        ReplicaError::StorageFull { .. } => ClusterError::Unavailable {
            target: format!("{target} on {node} (storage full)"),
            attempts: 1,
        },
        ReplicaError::Decode { key, message } => ClusterError::Corrupt { key, message },
        other => ClusterError::Unavailable {
            target: format!("{target} on {node} ({other})"),
            attempts: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{digest::Digest, node::OriginNode};

    fn cluster(n: usize, config: ClusterConfig) -> (Vec<OriginNode>, Cluster) {
        let nodes: Vec<OriginNode> = (0..n)
            .map(|i| OriginNode::memory(format!("origin-{i}")))
            .collect();
        let replicas = nodes
            .iter()
            .map(|node| Arc::new(node.clone()) as DynReplica)
            .collect();
        (nodes, Cluster::new(replicas, &config).unwrap())
    }

    fn node<'n>(nodes: &'n [OriginNode], id: &NodeId) -> &'n OriginNode {
        nodes.iter().find(|node| node.id() == id).unwrap()
    }

    fn blob(data: &'static [u8]) -> (Key, Bytes) {
        (Key::Blob(Digest::sha256(data)), Bytes::from_static(data))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn reads_fail_over_to_the_next_replica() {
        let (nodes, cluster) = cluster(3, ClusterConfig::default());
        let (key, data) = blob(b"layer");
        cluster.put(&key, data.clone()).await.unwrap();

        let first = cluster.replica_set(&key)[0].clone();
        node(&nodes, &first).begin_restart();

        assert_eq!(cluster.get(&key).await.unwrap(), data);
        assert!(cluster.exists(&key).await.unwrap());
        assert!(!cluster.is_healthy(&first));
    }

    /// Counts how many reads reach a node.
    #[derive(Debug)]
    struct Counted {
        node: OriginNode,
        gets: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Replica for Counted {
        fn id(&self) -> &NodeId {
            self.node.id()
        }

        async fn ping(&self) -> ReplicaResult<()> {
            self.node.ping().await
        }

        async fn put(&self, key: &Key, data: Bytes) -> ReplicaResult<()> {
            self.node.put(key, data).await
        }

        async fn get(&self, key: &Key) -> ReplicaResult<Bytes> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.node.get(key).await
        }

        async fn exists(&self, key: &Key) -> ReplicaResult<bool> {
            self.node.exists(key).await
        }

        async fn size(&self, key: &Key) -> ReplicaResult<u64> {
            self.node.size(key).await
        }

        async fn list(&self, prefix: &Prefix) -> ReplicaResult<Vec<Key>> {
            self.node.list(prefix).await
        }
    }

    #[tokio::test]
    async fn size_does_not_read_content() {
        let counted: Vec<Arc<Counted>> = (0..3)
            .map(|i| {
                Arc::new(Counted {
                    node: OriginNode::memory(format!("origin-{i}")),
                    gets: AtomicUsize::new(0),
                })
            })
            .collect();
        let replicas = counted
            .iter()
            .map(|replica| replica.clone() as DynReplica)
            .collect();
        let cluster = Cluster::new(replicas, &ClusterConfig::default()).unwrap();

        let data = Bytes::from(vec![7u8; 1 << 20]);
        let key = Key::Blob(Digest::sha256(&data));
        cluster.put(&key, data).await.unwrap();

        assert_eq!(cluster.size(&key).await.unwrap(), 1 << 20);
        assert!(cluster.exists(&key).await.unwrap());
        let gets: usize = counted.iter().map(|r| r.gets.load(Ordering::SeqCst)).sum();
        assert_eq!(gets, 0);

        let (missing, _) = blob(b"never written");
        assert!(matches!(
            cluster.size(&missing).await,
            Err(ClusterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_repair_replaces_corrupt_copies() {
        let stores: Vec<storage::Storage> =
            (0..3).map(|_| storage::MemoryStorage::new().into()).collect();
        let nodes: Vec<OriginNode> = stores
            .iter()
            .enumerate()
            .map(|(i, store)| OriginNode::new(format!("origin-{i}"), store))
            .collect();
        let replicas = nodes
            .iter()
            .map(|node| Arc::new(node.clone()) as DynReplica)
            .collect();
        let cluster = Cluster::new(replicas, &ClusterConfig::default()).unwrap();

        let (key, data) = blob(b"layer");
        cluster.put(&key, data.clone()).await.unwrap();
        settle().await;

        let first = cluster.replica_set(&key)[0].clone();
        let index = cluster.index_of(&first).unwrap();
        stores[index]
            .bucket(crate::node::BUCKET)
            .write(&key.path(), b"garbage")
            .await
            .unwrap();

        assert_eq!(cluster.get(&key).await.unwrap(), data);
        settle().await;
        assert_eq!(node(&nodes, &first).get(&key).await.unwrap(), data);
    }

    #[tokio::test]
    async fn distinguishes_missing_from_unreachable() {
        let (nodes, cluster) = cluster(3, ClusterConfig::default());
        let (key, _) = blob(b"never written");

        assert!(matches!(cluster.get(&key).await, Err(ClusterError::NotFound(_))));
        assert!(!cluster.exists(&key).await.unwrap());

        for node in &nodes {
            node.begin_restart();
        }
        assert!(matches!(
            cluster.get(&key).await,
            Err(ClusterError::Unavailable { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn writes_need_a_quorum() {
        let (nodes, cluster) = cluster(3, ClusterConfig::default());
        let (key, data) = blob(b"config");
        let set = cluster.replica_set(&key);

        node(&nodes, &set[0]).begin_restart();
        node(&nodes, &set[1]).begin_restart();
        let err = cluster.put(&key, data.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ReplicationTimeout {
                acks: 1,
                required: 2,
                ..
            }
        ));
        assert!(err.is_retryable());

        node(&nodes, &set[1]).finish_restart();
        cluster.put(&key, data).await.unwrap();
    }

    #[tokio::test]
    async fn missed_writes_converge_after_restart() {
        let (nodes, cluster) = cluster(3, ClusterConfig::default());
        let (key, data) = blob(b"layer");
        let down = node(&nodes, &cluster.replica_set(&key)[2]).clone();

        down.begin_restart();
        cluster.put(&key, data.clone()).await.unwrap();
        settle().await;
        assert!(cluster.pending_hints() > 0);

        down.finish_restart();
        cluster.converge().await;
        settle().await;

        assert_eq!(cluster.pending_hints(), 0);
        assert_eq!(down.get(&key).await.unwrap(), data);
    }

    #[tokio::test]
    async fn tags_resolve_to_the_newest_record() {
        let (nodes, cluster) = cluster(3, ClusterConfig::default());
        let key = Key::tag("app", "latest");
        let set = cluster.replica_set(&key);
        let origin = NodeId::from("origin-0");

        let old = TagRecord::new(Digest::sha256(b"v1"), Utc::now(), origin.clone());
        cluster.put_tag(&key, &old).await.unwrap();

        let lagging = node(&nodes, &set[0]).clone();
        lagging.begin_restart();
        let new = TagRecord::new(
            Digest::sha256(b"v2"),
            old.timestamp + chrono::TimeDelta::seconds(1),
            origin,
        );
        cluster.put_tag(&key, &new).await.unwrap();
        lagging.finish_restart();

        // An older write arriving late does not win.
        cluster.put_tag(&key, &old).await.unwrap();
        assert_eq!(cluster.get_tag(&key).await.unwrap(), new);

        settle().await;
        let stored = decode_tag(&key, &lagging.get(&key).await.unwrap()).unwrap();
        assert_eq!(stored, new);
    }

    #[tokio::test]
    async fn storage_full_is_reported() {
        let nodes: Vec<OriginNode> = ["a", "b"]
            .into_iter()
            .map(|id| OriginNode::new(id, &storage::MemoryStorage::with_capacity(2).into()))
            .collect();
        let replicas = nodes
            .iter()
            .map(|node| Arc::new(node.clone()) as DynReplica)
            .collect();
        let cluster = Cluster::new(replicas, &ClusterConfig::default()).unwrap();

        let (key, data) = blob(b"too large");
        assert!(matches!(
            cluster.put(&key, data).await,
            Err(ClusterError::StorageFull { acks: 0, .. })
        ));
    }

    #[tokio::test]
    async fn rejects_content_that_does_not_match_its_digest() {
        let (_, cluster) = cluster(3, ClusterConfig::default());
        let (key, _) = blob(b"expected");
        assert!(matches!(
            cluster.put(&key, Bytes::from_static(b"actual")).await,
            Err(ClusterError::DigestMismatch(_))
        ));
        assert_eq!(cluster.pending_hints(), 0);
    }

    #[tokio::test]
    async fn listings_union_every_node() {
        let (_, cluster) = cluster(4, ClusterConfig::default());
        for name in ["alpha", "beta", "gamma", "delta", "epsilon"] {
            cluster
                .put(&Key::Repository(name.into()), Bytes::new())
                .await
                .unwrap();
        }

        let listed = cluster.list(&Prefix::Repositories).await.unwrap();
        let names: Vec<String> = listed
            .into_iter()
            .filter_map(|key| match key {
                Key::Repository(name) => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["alpha", "beta", "delta", "epsilon", "gamma"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let replicas: Vec<DynReplica> = vec![
            Arc::new(OriginNode::memory("same")),
            Arc::new(OriginNode::memory("same")),
        ];
        assert!(matches!(
            Cluster::new(replicas, &ClusterConfig::default()),
            Err(ClusterError::Config(ConfigError::DuplicateNode(_)))
        ));
    }
}
