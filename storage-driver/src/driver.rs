use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use http::Uri;
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for object contents, positioned at the requested offset.
pub type Reader = dyn io::AsyncRead + Unpin + Send;

/// Metadata for a stored object, as reported by the backend.
///
/// Directory entries are synthesized by backends that have no native
/// directory notion; for those, `size` is zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The full backend path of the object.
    pub path: Utf8PathBuf,

    /// The size of the object in bytes.
    pub size: u64,

    /// The last modification timestamp.
    pub mod_time: DateTime<Utc>,

    /// Whether the path names a directory prefix rather than an object.
    pub is_dir: bool,
}

/// Flow control returned by a [`Driver::walk`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    /// Keep traversing.
    Continue,
    /// Do not descend into the current directory.
    SkipDir,
    /// Abort the traversal without error.
    Stop,
}

/// Options for [`Driver::url_for`].
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    /// The HTTP method the URL should permit (`GET` or `HEAD`).
    pub method: Option<String>,

    /// How long the URL should remain valid.
    pub expires_in: Option<Duration>,
}

/// An append-only byte sink returned by [`Driver::writer`].
///
/// Bytes become durable only after `commit`; a dropped or cancelled writer
/// must not leave the object observable at its final path.
#[async_trait::async_trait]
pub trait FileWriter: io::AsyncWrite + Unpin + Send {
    /// Total bytes written, including pre-existing bytes when opened in
    /// append mode.
    fn size(&self) -> u64;

    /// Flush and persist the written bytes.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard the written bytes where the backend allows it.
    async fn cancel(self: Box<Self>) -> Result<(), StorageError>;
}

/// A storage driver: a flat byte store keyed by UTF-8 paths.
///
/// Operations on distinct paths are independent; same-path writes follow
/// last-writer-wins. No cross-key transactions are available, and callers
/// must not assume stronger consistency than the backend advertises.
/// Cancellation is future cancellation; deadlines are the caller's.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver, used in error reports and logs.
    fn name(&self) -> &'static str;

    /// Read the entire object at `path`.
    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError>;

    /// Atomically overwrite the object at `path` with `content`.
    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError>;

    /// Open a byte stream over the object at `path`, starting at `offset`.
    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader>, StorageError>;

    /// Open an append-only sink at `path`.
    ///
    /// With `append` set, the writer continues after any existing bytes;
    /// otherwise it truncates.
    async fn writer(
        &self,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Stat the object or directory prefix at `path`.
    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError>;

    /// List the immediate children of the directory prefix at `path`.
    ///
    /// The order of the returned paths is unspecified.
    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError>;

    /// Atomically move the object at `from` to `to` within the backend.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError>;

    /// Delete the object at `path`, or everything under it when it names a
    /// directory prefix.
    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError>;

    /// Produce a URL from which the object can be fetched directly.
    ///
    /// Backends without redirect support return
    /// [`StorageErrorKind::Unsupported`], which is the default.
    async fn url_for(&self, path: &Utf8Path, options: &UrlOptions) -> Result<Uri, StorageError> {
        let _ = options;
        Err(StorageError::builder(
            self.name(),
            StorageErrorKind::Unsupported,
            "driver does not issue redirect URLs",
        )
        .path(path.as_str())
        .build())
    }

    /// Traverse every object under `root` in lexicographic order, invoking
    /// `f` for each entry (directories included, before their children).
    async fn walk(
        &self,
        root: &Utf8Path,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> WalkControl + Send),
    ) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn reader(&self, path: &Utf8Path, offset: u64) -> Result<Box<Reader>, StorageError> {
        self.deref().reader(path, offset).await
    }

    async fn writer(
        &self,
        path: &Utf8Path,
        append: bool,
    ) -> Result<Box<dyn FileWriter>, StorageError> {
        self.deref().writer(path, append).await
    }

    async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.deref().stat(path).await
    }

    async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.deref().list(path).await
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.deref().rename(from, to).await
    }

    async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn url_for(&self, path: &Utf8Path, options: &UrlOptions) -> Result<Uri, StorageError> {
        self.deref().url_for(path, options).await
    }

    async fn walk(
        &self,
        root: &Utf8Path,
        f: &mut (dyn for<'a> FnMut(&'a FileInfo) -> WalkControl + Send),
    ) -> Result<(), StorageError> {
        self.deref().walk(root, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
    static_assertions::assert_obj_safe!(FileWriter);
}
