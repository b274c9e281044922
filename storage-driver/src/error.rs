use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of the
/// backend implementation.
///
/// The registry core decides retry and surfacing behavior from this kind
/// alone; it never inspects backend-specific error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The path names no object in the backend.
    ///
    /// Not retryable. The core maps this onto "unknown blob" or "unknown
    /// tag" at the layer where the path's meaning is known.
    NotFound,

    /// The path is not valid for this backend (empty, relative escapes,
    /// forbidden characters).
    ///
    /// Not retryable; indicates a programming error in the caller.
    InvalidPath,

    /// The backend does not implement the requested operation.
    ///
    /// Not retryable. Redirect URLs are the common case.
    Unsupported,

    /// The operation failed in a way that may succeed on retry (network
    /// partition, throttling, interrupted I/O).
    ///
    /// Retryable with backoff, bounded by the caller.
    Transient,

    /// The operation failed and retrying will not help (corruption,
    /// permission failure, disk full).
    ///
    /// Not retryable; surfaced to the caller with context.
    Permanent,
}

impl StorageErrorKind {
    /// Whether an operation failing with this kind may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Transient)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::InvalidPath => write!(f, "invalid path"),
            StorageErrorKind::Unsupported => write!(f, "unsupported"),
            StorageErrorKind::Transient => write!(f, "transient I/O error"),
            StorageErrorKind::Permanent => write!(f, "permanent I/O error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    /// Captured backtrace; capture is controlled by RUST_BACKTRACE.
    backtrace: Backtrace,

    /// Captured tracing span context at the point the error was created,
    /// giving the logical async call stack.
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// A storage error with the context the core needs to classify and report
/// backend failures: the semantic [`StorageErrorKind`], the driver name,
/// the path involved, the underlying error chain, and captured traces.
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,

    /// The name of the driver that produced this error.
    engine: &'static str,

    /// The backend path involved, if applicable.
    path: Option<String>,

    /// The operation or extra detail, if any.
    context: Option<String>,

    /// The underlying error.
    source: Box<dyn StdError + Send + Sync + 'static>,

    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    ///
    /// For more control, use [`StorageError::builder`].
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self {
            kind,
            engine,
            path: None,
            context: None,
            source: error.into(),
            traces: Box::new(ErrorTrace::capture()),
        }
    }

    /// Create a builder for a storage error with full context.
    ///
    /// # Example
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// let error = StorageError::builder(
    ///     "filesystem",
    ///     StorageErrorKind::NotFound,
    ///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
    /// )
    /// .path("docker/registry/v2/blobs/sha256/aa/aabb/data")
    /// .context("get_content")
    /// .build();
    ///
    /// assert!(error.is_not_found());
    /// ```
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            path: None,
            context: None,
        }
    }

    /// Returns a closure that wraps a downstream error, for use with
    /// `.map_err()`.
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the driver name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the backend path, if recorded.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns the operation context, if recorded.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether this error may be retried.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Whether this error reports a missing path.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Whether this error reports an unimplemented operation.
    pub fn is_unsupported(&self) -> bool {
        self.kind == StorageErrorKind::Unsupported
    }

    /// Returns the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the captured span trace.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for [`StorageError`] carrying the optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the backend path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set the operation context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the error. Never panics: all required fields are present.
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
