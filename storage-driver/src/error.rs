use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;

use tracing_error::SpanTrace;

/// Categorizes storage errors by what the caller should do about them,
/// independent of the driver that produced them.
///
/// Callers branch on the kind, never on the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// The requested object (or its bucket) does not exist.
    NotFound,

    /// The driver is not permitted to touch the object.
    PermissionDenied,

    /// Reading or writing the backing medium failed.
    ///
    /// May be transient.
    Io,

    /// The backing medium has no room left for the object.
    StorageFull,

    /// The driver is temporarily unable to serve requests.
    Unavailable,

    /// The request itself was malformed (bad path, bad bucket name).
    InvalidRequest,

    /// Anything else.
    Other,
}

impl StorageErrorKind {
    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io | StorageErrorKind::Unavailable)
    }

    /// Whether the error is the caller's fault.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::InvalidRequest | StorageErrorKind::PermissionDenied
        )
    }
}

impl From<io::ErrorKind> for StorageErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            io::ErrorKind::StorageFull => StorageErrorKind::StorageFull,
            io::ErrorKind::InvalidInput => StorageErrorKind::InvalidRequest,
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => StorageErrorKind::Io,
            _ => StorageErrorKind::Other,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::StorageFull => write!(f, "storage full"),
            StorageErrorKind::Unavailable => write!(f, "unavailable"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct Traces {
    /// Only populated when `RUST_BACKTRACE` is set.
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl Traces {
    #[track_caller]
    fn capture() -> Box<Self> {
        Box::new(Traces {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        })
    }
}

/// Where in a driver an error happened.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    bucket: String,
    path: Option<String>,
}

/// An error raised by a storage driver.
///
/// Carries the semantic [`StorageErrorKind`], the engine that raised it,
/// the bucket/path it concerned, the underlying cause, and the backtrace and
/// span trace at the point of construction.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let err = StorageError::new(
///     "memory",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such object"),
/// )
/// .at("origin", "blobs/sha256/abc");
///
/// assert_eq!(err.kind(), StorageErrorKind::NotFound);
/// assert_eq!(err.path(), Some("blobs/sha256/abc"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    location: Option<Location>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<Traces>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error.
    #[track_caller]
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            location: None,
            context: None,
            source: error.into(),
            traces: Traces::capture(),
        }
    }

    /// Create a storage error from an I/O error, deriving the kind from
    /// the I/O error kind.
    #[track_caller]
    pub fn io(engine: &'static str, error: io::Error) -> Self {
        Self::new(engine, error.kind().into(), error)
    }

    /// Shorthand for a missing object.
    #[track_caller]
    pub fn not_found(engine: &'static str, bucket: &str, path: &str) -> Self {
        Self::new(
            engine,
            StorageErrorKind::NotFound,
            io::Error::new(io::ErrorKind::NotFound, format!("{bucket}/{path}")),
        )
        .at(bucket, path)
    }

    /// A closure which converts a downstream error into a storage error,
    /// for use with `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError + Send + Sync
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        move |error: E| StorageError::new(engine, kind, error)
    }

    /// Attach the bucket and object path this error concerns.
    pub fn at(mut self, bucket: impl Into<String>, path: impl Into<String>) -> Self {
        self.location = Some(Location {
            bucket: bucket.into(),
            path: Some(path.into()),
        });
        self
    }

    /// Attach only the bucket this error concerns.
    pub fn in_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.location = Some(Location {
            bucket: bucket.into(),
            path: None,
        });
        self
    }

    /// Attach a short description of the operation that failed.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// The error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// The storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// The bucket, if known.
    pub fn bucket(&self) -> Option<&str> {
        self.location.as_ref().map(|l| l.bucket.as_str())
    }

    /// The object path, if known.
    pub fn path(&self) -> Option<&str> {
        self.location.as_ref().and_then(|l| l.path.as_deref())
    }

    /// Whether the error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// The backtrace captured when the error was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// The tracing span context captured when the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error [{}] from {}", self.kind, self.engine)?;

        match &self.location {
            Some(Location {
                bucket,
                path: Some(path),
            }) => write!(f, " at {bucket}/{path}")?,
            Some(Location { bucket, path: None }) => write!(f, " in {bucket}")?,
            None => {}
        }

        if let Some(context) = &self.context {
            write!(f, " ({context})")?;
        }

        write!(f, ": {}", self.source)
    }
}
