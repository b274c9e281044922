use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use storage_driver::retry::retry_transient;
use storage_driver::{Reader, StorageError, UrlOptions, WalkControl};

use crate::cache::Scope;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::paths::{digest_from_blob_data_path, path_for, PathSpec};
use crate::Shared;

/// A blob ready to be served: either bytes to stream or a URL to redirect
/// the client to.
pub enum ServedBlob {
    /// Stream the bytes through the registry.
    Stream {
        descriptor: Descriptor,
        reader: Box<Reader>,
    },

    /// Redirect the client to fetch directly from the backend.
    Redirect { descriptor: Descriptor, url: http::Uri },
}

impl fmt::Debug for ServedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServedBlob::Stream { descriptor, .. } => f
                .debug_struct("ServedBlob::Stream")
                .field("descriptor", descriptor)
                .finish_non_exhaustive(),
            ServedBlob::Redirect { descriptor, url } => f
                .debug_struct("ServedBlob::Redirect")
                .field("descriptor", descriptor)
                .field("url", url)
                .finish(),
        }
    }
}

/// The global content-addressed blob store.
///
/// The only component that computes and verifies digests; everything above
/// it trusts a descriptor because this layer produced it.
#[derive(Debug, Clone)]
pub struct BlobStore {
    shared: Arc<Shared>,
}

impl BlobStore {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn data_path(digest: &Digest) -> Utf8PathBuf {
        path_for(PathSpec::BlobData { digest })
    }

    fn cache(&self) -> Option<&Arc<dyn crate::cache::DescriptorCache>> {
        self.shared.cache.as_ref()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Look up the descriptor for `digest`.
    #[tracing::instrument(skip(self))]
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(cache) = self.cache() {
            if let Some(descriptor) = cache.get(Scope::Global, digest).await {
                return Ok(descriptor);
            }
        }

        let path = Self::data_path(digest);
        let info = retry_transient(&self.shared.backoff, || self.shared.driver.stat(&path))
            .await
            .map_err(|err| Error::blob_from_storage(digest, err))?;
        if info.is_dir {
            return Err(Error::BlobUnknown {
                digest: digest.clone(),
            });
        }

        let descriptor = Descriptor::octet_stream(digest.clone(), info.size);
        if let Some(cache) = self.cache() {
            cache.set(Scope::Global, descriptor.clone()).await;
        }
        Ok(descriptor)
    }

    /// Open a reader over the blob, starting at `offset`.
    pub async fn open(&self, digest: &Digest, offset: u64) -> Result<Box<Reader>> {
        // Stat first: a missing blob must surface as unknown, not as a raw
        // backend error from the reader.
        self.stat(digest).await?;
        self.shared
            .driver
            .reader(&Self::data_path(digest), offset)
            .await
            .map_err(|err| Error::blob_from_storage(digest, err))
    }

    /// Read the entire blob.
    pub async fn get_content(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = Self::data_path(digest);
        retry_transient(&self.shared.backoff, || {
            self.shared.driver.get_content(&path)
        })
        .await
        .map_err(|err| Error::blob_from_storage(digest, err))
    }

    /// One-shot write: digest the bytes, store them, and return the
    /// descriptor. Writing an already-present blob is a no-op.
    #[tracing::instrument(skip(self, content), fields(len = content.len()))]
    pub async fn put(&self, media_type: &str, content: &[u8]) -> Result<Descriptor> {
        self.check_writable()?;

        let digest = Digest::from_bytes(content);
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest: digest.clone(),
            size: content.len() as u64,
            urls: Vec::new(),
        };

        if self.stat(&digest).await.is_ok() {
            tracing::trace!(%digest, "blob already present, skipping write");
            return Ok(descriptor);
        }

        let path = Self::data_path(&digest);
        retry_transient(&self.shared.backoff, || {
            self.shared.driver.put_content(&path, content)
        })
        .await?;

        if let Some(cache) = self.cache() {
            cache.set(Scope::Global, descriptor.clone()).await;
        }
        Ok(descriptor)
    }

    /// Serve the blob from `offset`: a redirect URL when the configuration
    /// and backend allow it, streamed bytes otherwise.
    pub async fn serve(&self, digest: &Digest, offset: u64) -> Result<ServedBlob> {
        let descriptor = self.stat(digest).await?;
        let path = Self::data_path(digest);

        if self.shared.config.redirect_enabled {
            let options = UrlOptions {
                method: Some("GET".to_string()),
                expires_in: None,
            };
            match self.shared.driver.url_for(&path, &options).await {
                Ok(url) => return Ok(ServedBlob::Redirect { descriptor, url }),
                Err(err) if err.is_unsupported() => {}
                Err(err) => {
                    tracing::warn!(%digest, error = %err, "redirect URL failed, streaming instead");
                }
            }
        }

        let reader = self
            .shared
            .driver
            .reader(&path, offset)
            .await
            .map_err(|err| Error::blob_from_storage(digest, err))?;
        Ok(ServedBlob::Stream { descriptor, reader })
    }

    /// Remove the blob. Admin and GC only, gated by `delete_enabled`.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        if !self.shared.config.delete_enabled {
            return Err(Error::Unsupported);
        }
        self.check_writable()?;
        self.delete_unchecked(digest).await
    }

    /// Remove the blob without consulting the delete gate. The sweeper and
    /// the proxy evictor call this; the public surface goes through
    /// [`BlobStore::delete`].
    pub(crate) async fn delete_unchecked(&self, digest: &Digest) -> Result<()> {
        let data = Self::data_path(digest);
        let blob_dir = data.parent().expect("blob data path has a parent");

        self.shared
            .driver
            .delete(blob_dir)
            .await
            .map_err(|err| Error::blob_from_storage(digest, err))?;

        if let Some(cache) = self.cache() {
            cache.invalidate(Scope::Global, digest).await;
        }

        if self.shared.config.remove_parents_on_delete {
            self.remove_empty_parent(blob_dir).await;
        }
        Ok(())
    }

    /// Best-effort removal of the two-hex fanout directory once empty.
    async fn remove_empty_parent(&self, blob_dir: &Utf8Path) {
        let Some(fanout) = blob_dir.parent() else {
            return;
        };
        match self.shared.driver.list(fanout).await {
            Ok(children) if children.is_empty() => {
                if let Err(err) = self.shared.driver.delete(fanout).await {
                    tracing::debug!(path = %fanout, error = %err, "parent cleanup failed");
                }
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => tracing::debug!(path = %fanout, error = %err, "parent listing failed"),
        }
    }

    /// Invoke `f` with the digest of every blob in the store.
    pub async fn enumerate(&self, f: &mut dyn FnMut(Digest)) -> Result<()> {
        let root = path_for(PathSpec::BlobsRoot);
        let mut digests = Vec::new();
        let walked = self
            .shared
            .driver
            .walk(&root, &mut |info| {
                if !info.is_dir {
                    if let Some(digest) = digest_from_blob_data_path(&info.path) {
                        digests.push(digest);
                    }
                }
                WalkControl::Continue
            })
            .await;
        match walked {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        for digest in digests {
            f(digest);
        }
        Ok(())
    }

    /// Write a link file: the ASCII digest, nothing else.
    pub(crate) async fn link(&self, path: &Utf8Path, digest: &Digest) -> Result<()> {
        let content = digest.to_string();
        retry_transient(&self.shared.backoff, || {
            self.shared.driver.put_content(path, content.as_bytes())
        })
        .await?;
        Ok(())
    }

    /// Read a link file back into a digest, tolerating one trailing newline.
    ///
    /// Backend errors pass through unmapped; the caller knows what the link
    /// path means and maps `NotFound` accordingly.
    pub(crate) async fn readlink(
        &self,
        path: &Utf8Path,
    ) -> std::result::Result<Digest, LinkReadError> {
        let raw = retry_transient(&self.shared.backoff, || {
            self.shared.driver.get_content(path)
        })
        .await
        .map_err(LinkReadError::Storage)?;

        let text = std::str::from_utf8(&raw)
            .map_err(|_| LinkReadError::Malformed(path.to_owned()))?
            .trim_end_matches('\n')
            .trim_end_matches('\r');
        text.parse()
            .map_err(|_| LinkReadError::Malformed(path.to_owned()))
    }
}

/// Failure reading a link file, before the caller assigns it meaning.
#[derive(Debug)]
pub(crate) enum LinkReadError {
    Storage(StorageError),
    Malformed(Utf8PathBuf),
}

impl LinkReadError {
    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, LinkReadError::Storage(err) if err.is_not_found())
    }

    /// Surface as "unknown blob" when missing, backend failure otherwise.
    pub(crate) fn into_blob_error(self, digest: &Digest) -> Error {
        match self {
            LinkReadError::Storage(err) => Error::blob_from_storage(digest, err),
            LinkReadError::Malformed(path) => Error::ManifestVerification {
                failures: vec![format!("malformed link file at {path}")],
            },
        }
    }
}
