//! Named pointers into the manifest graph.

use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::blob::{BlobStore, LinkReadError, LinkRole, LinkedBlobStore};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::paths::{path_for, PathSpec};
use crate::reference::{RepositoryName, TagName};
use crate::Shared;

/// Manages manifest tags for one repository.
///
/// A tag is two things on disk: an index entry per revision it has ever
/// pointed to (the history), and a `current` link that is overwritten on
/// every retag. Writing is not atomic across the pair; the index entry goes
/// first, so a crash leaves history without currency, and a later retag
/// converges.
#[derive(Debug, Clone)]
pub struct TagStore {
    shared: Arc<Shared>,
    repository: RepositoryName,
}

impl TagStore {
    pub(crate) fn new(shared: Arc<Shared>, repository: RepositoryName) -> Self {
        Self { shared, repository }
    }

    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    fn global(&self) -> BlobStore {
        BlobStore::new(Arc::clone(&self.shared))
    }

    fn index_store(&self, tag: &TagName) -> LinkedBlobStore {
        LinkedBlobStore::new(
            Arc::clone(&self.shared),
            self.repository.clone(),
            LinkRole::TagIndex(tag.clone()),
        )
    }

    /// All tag names in this repository, sorted for determinism.
    pub async fn all(&self) -> Result<Vec<TagName>> {
        let dir = path_for(PathSpec::ManifestTags {
            name: &self.repository,
        });
        let entries = match self.shared.driver.list(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() => {
                return Err(Error::RepositoryUnknown {
                    name: self.repository.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let mut tags: Vec<TagName> = entries
            .iter()
            .filter_map(|entry| entry.file_name())
            .filter_map(|name| TagName::new(name).ok())
            .collect();
        // Backend listing order is unspecified.
        tags.sort();
        Ok(tags)
    }

    /// The digest the tag currently points at.
    pub async fn get(&self, tag: &TagName) -> Result<Descriptor> {
        let current = path_for(PathSpec::ManifestTagCurrentLink {
            name: &self.repository,
            tag,
        });
        match self.global().readlink(&current).await {
            Ok(digest) => Ok(Descriptor::octet_stream(digest, 0)),
            Err(err) if err.is_not_found() => Err(Error::TagUnknown {
                tag: tag.to_string(),
            }),
            Err(LinkReadError::Storage(err)) => Err(err.into()),
            Err(LinkReadError::Malformed(path)) => {
                tracing::warn!(%path, "tag current link is malformed");
                Err(Error::TagUnknown {
                    tag: tag.to_string(),
                })
            }
        }
    }

    /// Point `tag` at `descriptor`, recording the old-to-new transition in
    /// the tag's index.
    ///
    /// The index entry is linked before `current` is overwritten; the
    /// overwrite is last-writer-wins at the backend, which is what defines
    /// tag currency under concurrent writers.
    #[tracing::instrument(skip(self, descriptor), fields(repository = %self.repository, digest = %descriptor.digest))]
    pub async fn tag(&self, tag: &TagName, descriptor: &Descriptor) -> Result<()> {
        self.global().check_writable()?;

        self.index_store(tag).link(&descriptor.digest).await?;

        let current = path_for(PathSpec::ManifestTagCurrentLink {
            name: &self.repository,
            tag,
        });
        self.global().link(&current, &descriptor.digest).await
    }

    /// Remove the tag and its entire history.
    pub async fn untag(&self, tag: &TagName) -> Result<()> {
        self.global().check_writable()?;

        let dir = path_for(PathSpec::ManifestTag {
            name: &self.repository,
            tag,
        });
        match self.shared.driver.delete(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Err(Error::TagUnknown {
                tag: tag.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Reverse lookup: every tag whose current digest equals the
    /// descriptor's.
    ///
    /// Current links are read with bounded parallelism; a tag that vanishes
    /// mid-lookup is skipped, not an error, since tags are removed
    /// concurrently in normal operation.
    pub async fn lookup(&self, descriptor: &Descriptor) -> Result<Vec<TagName>> {
        let tags = match self.all().await {
            Ok(tags) => tags,
            // Initialized but unpopulated repository: nothing refers to it.
            Err(Error::RepositoryUnknown { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let concurrency = self.shared.config.lookup_concurrency();
        let results: Vec<Result<Option<TagName>>> = stream::iter(tags)
            .map(|tag| async move {
                match self.get(&tag).await {
                    Ok(current) if current.digest == descriptor.digest => Ok(Some(tag)),
                    Ok(_) => Ok(None),
                    Err(Error::TagUnknown { .. }) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut matched = Vec::new();
        for result in results {
            if let Some(tag) = result? {
                matched.push(tag);
            }
        }
        matched.sort();
        Ok(matched)
    }

    /// Every revision this tag has ever pointed to, from the index.
    pub async fn manifest_digests(&self, tag: &TagName) -> Result<Vec<Digest>> {
        let index = path_for(PathSpec::ManifestTagIndex {
            name: &self.repository,
            tag,
        });
        if self.shared.driver.stat(&index).await.is_err() {
            return Err(Error::TagUnknown {
                tag: tag.to_string(),
            });
        }

        let mut digests = Vec::new();
        self.index_store(tag)
            .enumerate(&mut |digest| digests.push(digest))
            .await?;
        digests.sort();
        Ok(digests)
    }
}
