use camino::{Utf8Path, Utf8PathBuf};
use eyre::{eyre, WrapErr};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Suffix of files still being written. Never listed, never read.
const PARTIAL: &str = ".partial";

/// Storage driver backed by a directory on the local filesystem.
///
/// Each bucket is a subdirectory of the root. Writes go to a sibling
/// `.partial` file which is synced and renamed into place, so an object is
/// either absent or complete.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn bucket(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket.starts_with('.') {
            return Err(self.invalid(eyre!("invalid bucket name {bucket:?}")));
        }
        Ok(self.root.join(bucket))
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let safe = remote
            .components()
            .all(|c| matches!(c, camino::Utf8Component::Normal(_)));
        if !safe || remote.as_str().ends_with(PARTIAL) {
            return Err(self
                .invalid(eyre!("invalid object path {remote:?}"))
                .at(bucket, remote.as_str()));
        }
        Ok(self.bucket(bucket)?.join(remote))
    }

    fn invalid(&self, error: eyre::Report) -> StorageError {
        StorageError::new(self.name(), StorageErrorKind::InvalidRequest, error)
    }

    fn io(&self, bucket: &str, remote: &Utf8Path) -> impl FnOnce(std::io::Error) -> StorageError {
        let engine = self.name();
        let bucket = bucket.to_owned();
        let remote = remote.to_string();
        move |error| StorageError::io(engine, error).at(bucket, remote)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(self.io(bucket, remote))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(self.name(), bucket, remote.as_str()));
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(self.io(bucket, remote))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        let parent = path
            .parent()
            .ok_or_else(|| self.invalid(eyre!("object path has no parent: {path}")))?;

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(self.io(bucket, remote))?;

        let partial = Utf8PathBuf::from(format!("{path}.{}{PARTIAL}", uuid::Uuid::new_v4()));
        let written = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy(local, &mut writer).await?;
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(error) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!(%partial, "Unable to remove partial file: {cleanup}");
            }
            return Err(self.io(bucket, remote)(error));
        }

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(self.io(bucket, remote))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(self.io(bucket, remote))?;

        local.flush().await.map_err(self.io(bucket, remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket(bucket)?;
        let start = match prefix {
            Some(prefix) => self.path(bucket, prefix)?,
            None => root.clone(),
        };

        let mut items = tokio::task::spawn_blocking(move || collect_list(&root, &start))
            .in_current_span()
            .await
            .wrap_err("local driver: list task")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());
        items.sort();
        Ok(items)
    }
}

/// Walk `start` (a directory or a single file) and return paths relative to `root`.
#[tracing::instrument(level = "trace")]
fn collect_list(root: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<String>> {
    let mut files: Vec<Utf8PathBuf> = Vec::new();

    match start.symlink_metadata() {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => return Err(error).wrap_err_with(|| format!("stat {start}")),
        Ok(metadata) if metadata.is_file() => files.push(start.to_owned()),
        Ok(_) => visit(start, &mut files)?,
    }

    Ok(files
        .into_iter()
        .filter(|p| !p.as_str().ends_with(PARTIAL))
        .filter_map(|p| p.strip_prefix(root).ok().map(|p| p.to_string()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path
        .read_dir_utf8()
        .wrap_err_with(|| format!("read directory {path}"))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
