//! Pull-through cache over a remote registry.
//!
//! The proxy wraps the local stores in front of a [`RemoteRegistry`]:
//! blobs and manifests-by-digest are served local-first and populated
//! lazily; manifests-by-tag always consult the remote so a moved tag is
//! never served stale. Everything cached is scheduled for TTL eviction.
//! The proxy is read-only: client writes are refused.

mod remote;
mod scheduler;

pub use remote::{HttpRemoteRegistry, RemoteRegistry};
pub use scheduler::{EntryKind, ExpiryHandler, Scheduler, SchedulerEntry};

use std::sync::Arc;
use std::time::Duration;

use crate::blob::ServedBlob;
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, PutOptions};
use crate::paths::{path_for, PathSpec};
use crate::reference::{RepositoryName, TagName};
use crate::Registry;

/// A registry operating as a read-only cache of an upstream.
#[derive(Debug)]
pub struct ProxyRegistry {
    local: Registry,
    remote: Arc<dyn RemoteRegistry>,
    scheduler: Arc<Scheduler>,
    ttl: Duration,
    worker: tokio::task::JoinHandle<()>,
}

impl Drop for ProxyRegistry {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl ProxyRegistry {
    /// Wrap `local` storage in front of `remote`, reinstating scheduled
    /// evictions from the previous run and starting the eviction worker.
    pub async fn new(local: Registry, remote: Arc<dyn RemoteRegistry>) -> Self {
        let ttl = local
            .shared()
            .config
            .proxy
            .clone()
            .unwrap_or_default()
            .ttl;

        let scheduler = Scheduler::restore(Arc::clone(&local.shared().driver)).await;
        let evictor = Arc::new(ProxyEvictor {
            local: local.clone(),
        });
        let worker = scheduler.start(evictor);

        Self {
            local,
            remote,
            scheduler,
            ttl,
            worker,
        }
    }

    /// Proxied access to one repository.
    pub fn repository(&self, name: RepositoryName) -> ProxyRepository {
        ProxyRepository {
            blobs: ProxyBlobStore {
                local: self.local.clone(),
                remote: Arc::clone(&self.remote),
                scheduler: Arc::clone(&self.scheduler),
                ttl: self.ttl,
                repository: name.clone(),
            },
            manifests: ProxyManifestStore {
                local: self.local.clone(),
                remote: Arc::clone(&self.remote),
                scheduler: Arc::clone(&self.scheduler),
                ttl: self.ttl,
                repository: name,
            },
        }
    }

    /// The eviction scheduler, exposed for observation.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

/// Deletes local content when its TTL runs out.
struct ProxyEvictor {
    local: Registry,
}

#[async_trait::async_trait]
impl ExpiryHandler for ProxyEvictor {
    async fn expire(&self, kind: EntryKind, key: &str) {
        match kind {
            EntryKind::Blob => {
                let Ok(digest) = key.parse::<Digest>() else {
                    tracing::warn!(key, "unparseable blob eviction key");
                    return;
                };
                match self.local.blobs().delete_unchecked(&digest).await {
                    Ok(()) | Err(Error::BlobUnknown { .. }) => {}
                    Err(err) => tracing::error!(%digest, error = %err, "blob eviction failed"),
                }
            }
            EntryKind::Manifest => {
                let Ok(name) = RepositoryName::new(key) else {
                    tracing::warn!(key, "unparseable manifest eviction key");
                    return;
                };
                let manifests = path_for(PathSpec::Manifests { name: &name });
                match self.local.shared().driver.delete(&manifests).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        tracing::error!(repository = %name, error = %err, "manifest eviction failed")
                    }
                }
            }
        }
    }
}

/// Proxied stores for one repository.
#[derive(Debug)]
pub struct ProxyRepository {
    blobs: ProxyBlobStore,
    manifests: ProxyManifestStore,
}

impl ProxyRepository {
    pub fn blobs(&self) -> &ProxyBlobStore {
        &self.blobs
    }

    pub fn manifests(&self) -> &ProxyManifestStore {
        &self.manifests
    }
}

/// Pull-through blob access: local first, remote on miss, with digest
/// verification on every fetch.
#[derive(Debug)]
pub struct ProxyBlobStore {
    local: Registry,
    remote: Arc<dyn RemoteRegistry>,
    scheduler: Arc<Scheduler>,
    ttl: Duration,
    repository: RepositoryName,
}

impl ProxyBlobStore {
    fn local_blobs(&self) -> crate::LinkedBlobStore {
        self.local.repository(self.repository.clone()).blobs()
    }

    /// Make the blob locally present, fetching from the remote on a miss,
    /// and refresh its eviction TTL either way.
    async fn ensure_local(&self, digest: &Digest) -> Result<Descriptor> {
        match self.local_blobs().stat(digest).await {
            Ok(descriptor) => {
                self.scheduler.add_blob(digest, self.ttl).await;
                return Ok(descriptor);
            }
            Err(Error::BlobUnknown { .. }) => {}
            Err(err) => return Err(err),
        }

        let payload = self.remote.fetch_blob(&self.repository, digest).await?;
        // fetch_blob verified the payload; the local put re-derives the
        // digest from the bytes it writes.
        let descriptor = self
            .local_blobs()
            .put("application/octet-stream", &payload)
            .await?;
        tracing::debug!(%digest, size = descriptor.size, "blob cached from remote");
        self.scheduler.add_blob(digest, self.ttl).await;
        Ok(descriptor)
    }

    pub async fn stat(&self, digest: &Digest) -> Result<Descriptor> {
        match self.local_blobs().stat(digest).await {
            Ok(descriptor) => {
                self.scheduler.add_blob(digest, self.ttl).await;
                Ok(descriptor)
            }
            Err(Error::BlobUnknown { .. }) => self.remote.stat_blob(&self.repository, digest).await,
            Err(err) => Err(err),
        }
    }

    pub async fn get_content(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.ensure_local(digest).await?;
        self.local_blobs().get_content(digest).await
    }

    pub async fn serve(&self, digest: &Digest, offset: u64) -> Result<ServedBlob> {
        self.ensure_local(digest).await?;
        self.local_blobs().serve(digest, offset).await
    }

    /// The proxy is read-only.
    pub async fn put(&self, _media_type: &str, _content: &[u8]) -> Result<Descriptor> {
        Err(Error::Unsupported)
    }

    /// The proxy is read-only.
    pub async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(Error::Unsupported)
    }
}

/// Pull-through manifest access.
#[derive(Debug)]
pub struct ProxyManifestStore {
    local: Registry,
    remote: Arc<dyn RemoteRegistry>,
    scheduler: Arc<Scheduler>,
    ttl: Duration,
    repository: RepositoryName,
}

impl ProxyManifestStore {
    fn local_manifests(&self) -> crate::ManifestStore {
        self.local.repository(self.repository.clone()).manifests()
    }

    /// Manifests are cached before their blobs arrive, so the local put
    /// skips the referential-integrity check.
    async fn cache_locally(&self, manifest: &Manifest) -> Result<()> {
        self.local_manifests()
            .put_with(
                manifest,
                PutOptions {
                    skip_reference_verification: true,
                },
            )
            .await?;
        self.scheduler
            .add_manifest(&self.repository, self.ttl)
            .await;
        Ok(())
    }

    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        if self.local_manifests().exists(digest).await? {
            return Ok(true);
        }
        self.remote.manifest_exists(&self.repository, digest).await
    }

    /// Get by digest: local first; a miss populates from the remote and
    /// schedules eviction.
    pub async fn get(&self, digest: &Digest) -> Result<Manifest> {
        match self.local_manifests().get(digest).await {
            Ok(manifest) => return Ok(manifest),
            Err(Error::ManifestUnknown { .. }) => {}
            Err(err) => return Err(err),
        }

        let manifest = self.remote.fetch_manifest(&self.repository, digest).await?;
        self.cache_locally(&manifest).await?;
        tracing::debug!(%digest, "manifest cached from remote");
        Ok(manifest)
    }

    /// Get by tag: the remote is always consulted first, so a repointed
    /// tag is never served stale from the cache.
    pub async fn get_by_tag(&self, tag: &TagName) -> Result<Manifest> {
        let manifest = self
            .remote
            .fetch_manifest_by_tag(&self.repository, tag)
            .await?;
        let digest = manifest.digest();

        if self.local_manifests().exists(&digest).await? {
            return Ok(manifest);
        }

        tracing::info!(%tag, %digest, "newer manifest fetched for tag");
        self.cache_locally(&manifest).await?;
        Ok(manifest)
    }

    /// The proxy is read-only.
    pub async fn put(&self, _manifest: &Manifest) -> Result<Digest> {
        Err(Error::Unsupported)
    }

    /// The proxy is read-only.
    pub async fn delete(&self, _digest: &Digest) -> Result<()> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProxyConfig, Registry, RegistryConfig};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use storage::MemoryDriver;

    /// An in-memory upstream with call counting.
    #[derive(Debug, Default)]
    struct FakeRemote {
        blobs: Mutex<HashMap<Digest, Bytes>>,
        manifests: Mutex<HashMap<Digest, Bytes>>,
        tags: Mutex<HashMap<String, Digest>>,
        blob_fetches: Mutex<usize>,
        tag_fetches: Mutex<usize>,
    }

    impl FakeRemote {
        fn add_blob(&self, content: &[u8]) -> Digest {
            let digest = Digest::from_bytes(content);
            self.blobs
                .lock()
                .insert(digest.clone(), Bytes::copy_from_slice(content));
            digest
        }

        fn add_manifest(&self, raw: &str) -> Digest {
            let digest = Digest::from_bytes(raw.as_bytes());
            self.manifests
                .lock()
                .insert(digest.clone(), Bytes::copy_from_slice(raw.as_bytes()));
            digest
        }

        fn set_tag(&self, tag: &str, digest: Digest) {
            self.tags.lock().insert(tag.to_string(), digest);
        }
    }

    #[async_trait::async_trait]
    impl RemoteRegistry for FakeRemote {
        async fn stat_blob(
            &self,
            _repository: &RepositoryName,
            digest: &Digest,
        ) -> Result<Descriptor> {
            let blobs = self.blobs.lock();
            let payload = blobs.get(digest).ok_or_else(|| Error::BlobUnknown {
                digest: digest.clone(),
            })?;
            Ok(Descriptor::octet_stream(digest.clone(), payload.len() as u64))
        }

        async fn fetch_blob(&self, _repository: &RepositoryName, digest: &Digest) -> Result<Bytes> {
            *self.blob_fetches.lock() += 1;
            self.blobs
                .lock()
                .get(digest)
                .cloned()
                .ok_or_else(|| Error::BlobUnknown {
                    digest: digest.clone(),
                })
        }

        async fn manifest_exists(
            &self,
            _repository: &RepositoryName,
            digest: &Digest,
        ) -> Result<bool> {
            Ok(self.manifests.lock().contains_key(digest))
        }

        async fn fetch_manifest(
            &self,
            _repository: &RepositoryName,
            digest: &Digest,
        ) -> Result<Manifest> {
            let payload = self
                .manifests
                .lock()
                .get(digest)
                .cloned()
                .ok_or_else(|| Error::ManifestUnknown {
                    digest: digest.clone(),
                })?;
            Manifest::parse(&payload)
        }

        async fn fetch_manifest_by_tag(
            &self,
            repository: &RepositoryName,
            tag: &TagName,
        ) -> Result<Manifest> {
            *self.tag_fetches.lock() += 1;
            let digest = self
                .tags
                .lock()
                .get(tag.as_str())
                .cloned()
                .ok_or_else(|| Error::TagUnknown {
                    tag: tag.to_string(),
                })?;
            self.fetch_manifest(repository, &digest).await
        }
    }

    fn local(ttl: Duration) -> Registry {
        Registry::new(
            MemoryDriver::new(),
            RegistryConfig {
                proxy: Some(ProxyConfig { ttl }),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn repo_name() -> RepositoryName {
        RepositoryName::new("library/cached").unwrap()
    }

    fn manifest_for(remote: &FakeRemote, seed: &str) -> String {
        let config = remote.add_blob(format!("config {seed}").as_bytes());
        let layer = remote.add_blob(format!("layer {seed}").as_bytes());
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": 10,
    "digest": "{config}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": 10,
      "digest": "{layer}"
    }}
  ]
}}"#
        )
    }

    #[tokio::test]
    async fn blob_miss_populates_locally_once() {
        let remote = Arc::new(FakeRemote::default());
        let digest = remote.add_blob(b"layer bytes");
        let local = local(Duration::from_secs(3600));
        let proxy = ProxyRegistry::new(local.clone(), remote.clone()).await;
        let repo = proxy.repository(repo_name());

        let first = repo.blobs().get_content(&digest).await.unwrap();
        assert_eq!(first, b"layer bytes");
        let second = repo.blobs().get_content(&digest).await.unwrap();
        assert_eq!(second, b"layer bytes");

        // Only the first read hit the upstream.
        assert_eq!(*remote.blob_fetches.lock(), 1);
        assert!(proxy
            .scheduler()
            .contains(EntryKind::Blob, &digest.to_string()));
    }

    #[tokio::test]
    async fn manifest_by_digest_is_local_first() {
        let remote = Arc::new(FakeRemote::default());
        let raw = manifest_for(&remote, "a");
        let digest = remote.add_manifest(&raw);
        let local = local(Duration::from_secs(3600));
        let proxy = ProxyRegistry::new(local.clone(), remote.clone()).await;
        let repo = proxy.repository(repo_name());

        let manifest = repo.manifests().get(&digest).await.unwrap();
        assert_eq!(manifest.digest(), digest);

        // Cached locally under the same digest.
        assert!(local
            .repository(repo_name())
            .manifests()
            .exists(&digest)
            .await
            .unwrap());
        assert!(proxy
            .scheduler()
            .contains(EntryKind::Manifest, repo_name().as_str()));
    }

    #[tokio::test]
    async fn tags_always_consult_the_remote() {
        let remote = Arc::new(FakeRemote::default());
        let raw_v1 = manifest_for(&remote, "v1");
        let d1 = remote.add_manifest(&raw_v1);
        remote.set_tag("latest", d1.clone());

        let local = local(Duration::from_secs(3600));
        let proxy = ProxyRegistry::new(local.clone(), remote.clone()).await;
        let repo = proxy.repository(repo_name());
        let latest = TagName::new("latest").unwrap();

        assert_eq!(repo.manifests().get_by_tag(&latest).await.unwrap().digest(), d1);

        // The tag moves upstream; the proxy serves the new digest at once.
        let raw_v2 = manifest_for(&remote, "v2");
        let d2 = remote.add_manifest(&raw_v2);
        remote.set_tag("latest", d2.clone());

        assert_eq!(repo.manifests().get_by_tag(&latest).await.unwrap().digest(), d2);
        assert_eq!(*remote.tag_fetches.lock(), 2);
    }

    #[tokio::test]
    async fn writes_are_unsupported() {
        let remote = Arc::new(FakeRemote::default());
        let local = local(Duration::from_secs(3600));
        let proxy = ProxyRegistry::new(local, remote).await;
        let repo = proxy.repository(repo_name());

        assert!(matches!(
            repo.blobs().put("application/octet-stream", b"x").await,
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            repo.blobs().delete(&Digest::from_bytes(b"x")).await,
            Err(Error::Unsupported)
        ));
        assert!(matches!(
            repo.manifests().delete(&Digest::from_bytes(b"x")).await,
            Err(Error::Unsupported)
        ));
    }

    #[tokio::test]
    async fn ttl_evicts_cached_manifests_and_state() {
        let remote = Arc::new(FakeRemote::default());
        let raw = manifest_for(&remote, "fleeting");
        let digest = remote.add_manifest(&raw);
        remote.set_tag("latest", digest.clone());

        let local = local(Duration::from_millis(100));
        let proxy = ProxyRegistry::new(local.clone(), remote.clone()).await;
        let repo = proxy.repository(repo_name());

        repo.manifests()
            .get_by_tag(&TagName::new("latest").unwrap())
            .await
            .unwrap();
        assert!(local
            .repository(repo_name())
            .manifests()
            .exists(&digest)
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;

        // Evicted locally, and the persisted state no longer lists it.
        assert!(!local
            .repository(repo_name())
            .manifests()
            .exists(&digest)
            .await
            .unwrap());
        assert!(!proxy
            .scheduler()
            .contains(EntryKind::Manifest, repo_name().as_str()));
    }
}
