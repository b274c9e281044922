use std::sync::Arc;

use camino::Utf8PathBuf;
use storage_driver::{Reader, WalkControl};

use crate::blob::store::{BlobStore, ServedBlob};
use crate::cache::Scope;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::paths::{digest_from_link_path, path_for, PathSpec};
use crate::reference::{RepositoryName, TagName};
use crate::Shared;

/// Which family of link paths a [`LinkedBlobStore`] manages.
#[derive(Debug, Clone)]
pub(crate) enum LinkRole {
    /// Layer links under `_layers`.
    Layer,

    /// Manifest revision links under `_manifests/revisions`.
    ManifestRevision,

    /// Tag index entries under `_manifests/tags/<tag>/index`.
    TagIndex(TagName),
}

impl LinkRole {
    /// The canonical link path. Writes always land here.
    fn link_path(&self, name: &RepositoryName, digest: &Digest) -> Utf8PathBuf {
        match self {
            LinkRole::Layer => path_for(PathSpec::LayerLink { name, digest }),
            LinkRole::ManifestRevision => path_for(PathSpec::ManifestRevisionLink { name, digest }),
            LinkRole::TagIndex(tag) => {
                path_for(PathSpec::ManifestTagIndexEntryLink { name, tag, digest })
            }
        }
    }

    /// Paths probed on read, canonical first.
    ///
    /// Manifest reads also probe the layer-link location: registry 2.1.0
    /// wrote manifest links under `_layers`.
    fn read_link_paths(&self, name: &RepositoryName, digest: &Digest) -> Vec<Utf8PathBuf> {
        match self {
            LinkRole::ManifestRevision => vec![
                path_for(PathSpec::ManifestRevisionLink { name, digest }),
                path_for(PathSpec::LayerLink { name, digest }),
            ],
            _ => vec![self.link_path(name, digest)],
        }
    }

    /// The directory enumerated by [`LinkedBlobStore::enumerate`].
    fn link_dir(&self, name: &RepositoryName) -> Utf8PathBuf {
        match self {
            LinkRole::Layer => path_for(PathSpec::Layers { name }),
            LinkRole::ManifestRevision => path_for(PathSpec::ManifestRevisions { name }),
            LinkRole::TagIndex(tag) => path_for(PathSpec::ManifestTagIndex { name, tag }),
        }
    }
}

/// A repository-scoped view over the global blob store.
///
/// Existence here means "the repository links to it": [`stat`] answers
/// unknown for blobs the repository never linked, even when the global store
/// holds them. That is how repositories are isolated.
///
/// [`stat`]: LinkedBlobStore::stat
#[derive(Debug, Clone)]
pub struct LinkedBlobStore {
    shared: Arc<Shared>,
    repository: RepositoryName,
    role: LinkRole,
}

impl LinkedBlobStore {
    pub(crate) fn new(shared: Arc<Shared>, repository: RepositoryName, role: LinkRole) -> Self {
        Self {
            shared,
            repository,
            role,
        }
    }

    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn global(&self) -> BlobStore {
        BlobStore::new(Arc::clone(&self.shared))
    }

    fn scope(&self) -> Scope<'_> {
        Scope::Repository(&self.repository)
    }

    /// Resolve the link for `digest`, if any path in this role holds one.
    async fn resolve_link(&self, digest: &Digest) -> Result<Option<Digest>> {
        let global = self.global();
        for path in self.role.read_link_paths(&self.repository, digest) {
            match global.readlink(&path).await {
                Ok(target) => return Ok(Some(target)),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into_blob_error(digest)),
            }
        }
        Ok(None)
    }

    /// Look up `digest` through this repository's links.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        if let Some(cache) = &self.shared.cache {
            if let Some(descriptor) = cache.get(self.scope(), digest).await {
                return Ok(descriptor);
            }
        }

        let target = self
            .resolve_link(digest)
            .await?
            .ok_or_else(|| Error::BlobUnknown {
                digest: digest.clone(),
            })?;

        // The link is not authoritative: the target blob may be gone, and
        // that still reads as an unknown blob.
        let descriptor = self.global().stat(&target).await?;

        if let Some(cache) = &self.shared.cache {
            cache.set(self.scope(), descriptor.clone()).await;
        }
        Ok(descriptor)
    }

    /// Open a reader over the linked blob, starting at `offset`.
    pub async fn open(&self, digest: &Digest, offset: u64) -> Result<Box<Reader>> {
        self.stat(digest).await?;
        self.global().open(digest, offset).await
    }

    /// Read the entire linked blob.
    pub async fn get_content(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.stat(digest).await?;
        self.global().get_content(digest).await
    }

    /// Serve the linked blob, honoring the redirect configuration.
    pub async fn serve(&self, digest: &Digest, offset: u64) -> Result<ServedBlob> {
        self.stat(digest).await?;
        self.global().serve(digest, offset).await
    }

    /// Store bytes globally and link them into this repository.
    #[tracing::instrument(skip(self, content), fields(repository = %self.repository, len = content.len()))]
    pub async fn put(&self, media_type: &str, content: &[u8]) -> Result<Descriptor> {
        let descriptor = self.global().put(media_type, content).await?;
        self.link(&descriptor.digest).await?;

        if let Some(cache) = &self.shared.cache {
            cache.set(self.scope(), descriptor.clone()).await;
        }
        Ok(descriptor)
    }

    /// Write this role's canonical link for an existing blob.
    pub(crate) async fn link(&self, digest: &Digest) -> Result<()> {
        let path = self.role.link_path(&self.repository, digest);
        self.global().link(&path, digest).await
    }

    /// Link a blob from another repository into this one without
    /// re-uploading it.
    ///
    /// Returns [`Error::BlobMounted`] when this repository already links the
    /// blob, and [`Error::BlobUnknown`] when the source repository does not.
    pub async fn mount(&self, source: &RepositoryName, digest: &Digest) -> Result<Descriptor> {
        self.global().check_writable()?;

        if self.stat(digest).await.is_ok() {
            return Err(Error::BlobMounted {
                digest: digest.clone(),
            });
        }

        let source_store = LinkedBlobStore::new(
            Arc::clone(&self.shared),
            source.clone(),
            LinkRole::Layer,
        );
        let descriptor = source_store.stat(digest).await?;

        self.link(digest).await?;
        if let Some(cache) = &self.shared.cache {
            cache.set(self.scope(), descriptor.clone()).await;
        }
        Ok(descriptor)
    }

    /// Remove this repository's link to `digest`. The underlying blob
    /// stays; reclaiming it is the garbage collector's decision.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        if !self.shared.config.delete_enabled {
            return Err(Error::Unsupported);
        }
        self.global().check_writable()?;
        self.delete_unchecked(digest).await
    }

    pub(crate) async fn delete_unchecked(&self, digest: &Digest) -> Result<()> {
        let link = self.role.link_path(&self.repository, digest);
        let link_dir = link.parent().expect("link path has a parent");
        self.shared
            .driver
            .delete(link_dir)
            .await
            .map_err(|err| Error::blob_from_storage(digest, err))?;

        if let Some(cache) = &self.shared.cache {
            cache.invalidate(self.scope(), digest).await;
        }
        Ok(())
    }

    /// Invoke `f` with every digest linked under this role.
    ///
    /// A repository (or role directory) that does not exist yet enumerates
    /// as empty. Foreign files in the link tree are skipped.
    pub async fn enumerate(&self, f: &mut dyn FnMut(Digest)) -> Result<()> {
        let dir = self.role.link_dir(&self.repository);
        let mut digests = Vec::new();
        let walked = self
            .shared
            .driver
            .walk(&dir, &mut |info| {
                if !info.is_dir {
                    if let Some(digest) = digest_from_link_path(&info.path) {
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
}
