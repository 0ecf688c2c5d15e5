use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Buckets = HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>;

/// Storage driver that keeps objects in memory.
///
/// An optional capacity bounds the total number of bytes held across all
/// buckets; writes which would exceed it fail with
/// [`StorageErrorKind::StorageFull`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<Buckets>,
    capacity: Option<u64>,
}

impl MemoryStorage {
    /// Create a new, unbounded `MemoryStorage` instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` which holds at most `capacity` bytes.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            buckets: RwLock::default(),
            capacity: Some(capacity),
        }
    }

    /// Total bytes currently stored.
    pub async fn used(&self) -> u64 {
        let buckets = self.buckets.read().await;
        used(&buckets)
    }

    fn item<'b>(
        &self,
        buckets: &'b Buckets,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<&'b MemoryFileItem, StorageError> {
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(remote))
            .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote.as_str()))
    }
}

fn used(buckets: &Buckets) -> u64 {
    buckets
        .values()
        .flat_map(|objects| objects.values())
        .map(|item| item.data.len() as u64)
        .sum()
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        Ok(self.item(&buckets, bucket, remote)?.into())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err).at(bucket, remote.as_str()))?;

        let mut buckets = self.buckets.write().await;

        if let Some(capacity) = self.capacity {
            let replaced = buckets
                .get(bucket)
                .and_then(|objects| objects.get(remote))
                .map_or(0, |item| item.data.len() as u64);
            let needed = used(&buckets) - replaced + buf.len() as u64;
            if needed > capacity {
                return Err(StorageError::new(
                    self.name(),
                    StorageErrorKind::StorageFull,
                    format!("{needed} bytes exceeds capacity of {capacity} bytes"),
                )
                .at(bucket, remote.as_str()));
            }
        }

        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let buckets = self.buckets.read().await;
        let mut buf = self.item(&buckets, bucket, remote)?.as_ref();

        tokio::io::copy(&mut buf, local)
            .await
            .map_err(|err| StorageError::io(self.name(), err).at(bucket, remote.as_str()))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(self.name(), err).at(bucket, remote.as_str()))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut paths: Vec<String> = objects
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }
}
