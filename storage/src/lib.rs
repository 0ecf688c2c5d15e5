//! # Storage backends
//!
//! Configuration and unification for the storage backends an origin node
//! can keep its objects in.

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;
#[cfg(feature = "tmp")]
pub(crate) mod temp;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "tmp")]
#[doc(inline)]
pub use temp::TempDriver;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Which backend to keep objects in.
///
/// ```toml
/// [node.storage]
/// local = { path = "/var/lib/registry" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep objects in memory, optionally bounded to `capacity` bytes.
    Memory {
        #[serde(default)]
        capacity: Option<u64>,
    },

    /// Keep objects under a directory on the local filesystem.
    #[cfg(feature = "local")]
    Local { path: Utf8PathBuf },

    /// Keep objects in a temporary directory, discarded on exit.
    #[cfg(feature = "tmp")]
    Temp,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory { capacity: None }
    }
}

impl StorageConfig {
    /// Construct the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory { capacity: None } => MemoryStorage::new().into(),
            StorageConfig::Memory {
                capacity: Some(capacity),
            } => MemoryStorage::with_capacity(capacity).into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "tmp")]
            StorageConfig::Temp => TempDriver::new()
                .map_err(|error| StorageError::io("temp", error))?
                .into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shareable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A [`Storage`] handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket every operation on this handle targets.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// Size and creation time of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket = %self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Whether an object is stored at `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket = %self.bucket))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    /// Stream an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket = %self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await?;
        Ok(())
    }

    /// Stream an object from `reader`, replacing any existing one.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket = %self.bucket))]
    pub async fn upload<'d, R>(&'d self, remote: &Utf8Path, reader: &mut R) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await?;
        Ok(())
    }

    /// Read a whole object into memory.
    pub async fn read(&self, remote: &Utf8Path) -> Result<Bytes, StorageError> {
        let mut buf = Vec::new();
        self.download(remote, &mut buf).await?;
        Ok(buf.into())
    }

    /// Write a whole object from memory.
    pub async fn write(&self, remote: &Utf8Path, data: &[u8]) -> Result<(), StorageError> {
        let mut reader = data;
        self.upload(remote, &mut reader).await
    }

    /// Object paths under `prefix`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket = %self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }
}
