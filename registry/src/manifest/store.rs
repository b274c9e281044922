use std::sync::Arc;

use storage_driver::WalkControl;

use crate::blob::{LinkRole, LinkedBlobStore};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Signature};
use crate::paths::{digest_from_link_path, path_for, PathSpec};
use crate::reference::RepositoryName;
use crate::Shared;

/// Options for [`ManifestStore::put_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    /// Skip the referential-integrity check against the repository's linked
    /// blobs. The pull-through proxy stores manifests before their blobs
    /// arrive; everything else leaves this off.
    pub skip_reference_verification: bool,
}

/// Schema-dispatched manifest persistence for one repository.
///
/// Manifests are blobs with a revision link; what this store adds is
/// verification. A manifest is stored only after every blob it references
/// is linked in this repository, which is what keeps the stored graph free
/// of dangling references at write time.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    shared: Arc<Shared>,
    repository: RepositoryName,
}

impl ManifestStore {
    pub(crate) fn new(shared: Arc<Shared>, repository: RepositoryName) -> Self {
        Self { shared, repository }
    }

    pub fn repository(&self) -> &RepositoryName {
        &self.repository
    }

    fn revisions(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(
            Arc::clone(&self.shared),
            self.repository.clone(),
            LinkRole::ManifestRevision,
        )
    }

    fn layers(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(
            Arc::clone(&self.shared),
            self.repository.clone(),
            LinkRole::Layer,
        )
    }

    /// Whether a revision link exists for `digest`.
    pub async fn exists(&self, digest: &Digest) -> Result<bool> {
        match self.revisions().stat(digest).await {
            Ok(_) => Ok(true),
            Err(Error::BlobUnknown { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Fetch and re-parse the manifest stored under `digest`.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn get(&self, digest: &Digest) -> Result<Manifest> {
        let bytes = match self.revisions().get_content(digest).await {
            Ok(bytes) => bytes,
            Err(Error::BlobUnknown { digest }) => {
                return Err(Error::ManifestUnknown { digest })
            }
            Err(err) => return Err(err),
        };

        let mut manifest = Manifest::parse(&bytes)?;
        if let Manifest::Schema1(schema1) = &mut manifest {
            let stored = self.read_signatures(digest).await?;
            schema1.merge_signatures(stored);
        }
        Ok(manifest)
    }

    /// Verify and persist a manifest; returns its storage digest.
    ///
    /// Put is idempotent: the same payload lands on the same digest and the
    /// same revision link.
    pub async fn put(&self, manifest: &Manifest) -> Result<Digest> {
        self.put_with(manifest, PutOptions::default()).await
    }

    /// [`put`](ManifestStore::put) with explicit options.
    #[tracing::instrument(skip(self, manifest), fields(repository = %self.repository))]
    pub async fn put_with(&self, manifest: &Manifest, options: PutOptions) -> Result<Digest> {
        manifest.verify()?;
        if !options.skip_reference_verification {
            self.verify_references(manifest).await?;
        }

        let descriptor = self
            .revisions()
            .put(manifest.media_type(), manifest.payload())
            .await?;

        if let Manifest::Schema1(schema1) = manifest {
            self.store_signatures(&descriptor.digest, &schema1.signatures)
                .await?;
        }

        tracing::debug!(digest = %descriptor.digest, "manifest stored");
        Ok(descriptor.digest)
    }

    /// Remove the revision link. Gated by `delete_enabled`; the manifest
    /// blob itself is the garbage collector's to reclaim.
    pub async fn delete(&self, digest: &Digest) -> Result<()> {
        match self.revisions().delete(digest).await {
            Ok(()) => Ok(()),
            Err(Error::BlobUnknown { digest }) => Err(Error::ManifestUnknown { digest }),
            Err(err) => Err(err),
        }
    }

    /// Invoke `f` with every revision digest known to this repository.
    pub async fn enumerate(&self, f: &mut dyn FnMut(Digest)) -> Result<()> {
        self.revisions().enumerate(f).await
    }

    /// The referential-integrity check: every descriptor the manifest names
    /// must already exist in this repository's scope.
    async fn verify_references(&self, manifest: &Manifest) -> Result<()> {
        if manifest.is_index() {
            // Members are manifests: they must have revision links here.
            for member in manifest.references() {
                if !self.exists(&member.digest).await? {
                    return Err(Error::ManifestBlobUnknown {
                        digest: member.digest,
                    });
                }
            }
            return Ok(());
        }

        let layers = self.layers();
        for reference in manifest.references() {
            match layers.stat(&reference.digest).await {
                Ok(_) => {}
                Err(Error::BlobUnknown { digest }) => {
                    return Err(Error::ManifestBlobUnknown { digest })
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Store each detached signature as a blob plus a signature link under
    /// the revision.
    async fn store_signatures(&self, revision: &Digest, signatures: &[Signature]) -> Result<()> {
        let global = self.revisions().global();
        for signature in signatures {
            let payload = serde_json::to_vec(signature).map_err(|err| {
                Error::ManifestVerification {
                    failures: vec![format!("signature does not serialize: {err}")],
                }
            })?;
            let descriptor = global.put("application/json", &payload).await?;
            let link = path_for(PathSpec::ManifestSignatureLink {
                name: &self.repository,
                revision,
                signature: &descriptor.digest,
            });
            global.link(&link, &descriptor.digest).await?;
        }
        Ok(())
    }

    /// Read back every signature linked under the revision.
    async fn read_signatures(&self, revision: &Digest) -> Result<Vec<Signature>> {
        let dir = path_for(PathSpec::ManifestSignatures {
            name: &self.repository,
            revision,
        });

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
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let global = self.revisions().global();
        let mut signatures = Vec::new();
        for digest in digests {
            match global.get_content(&digest).await {
                Ok(bytes) => {
                    if let Ok(signature) = serde_json::from_slice(&bytes) {
                        signatures.push(signature);
                    } else {
                        tracing::warn!(%digest, "skipping malformed stored signature");
                    }
                }
                // A dangling signature link is tolerated like any other.
                Err(Error::BlobUnknown { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Registry, RegistryConfig};
    use storage::MemoryDriver;

    fn registry(delete_enabled: bool) -> Registry {
        Registry::new(
            MemoryDriver::new(),
            RegistryConfig {
                delete_enabled,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn repo(registry: &Registry) -> crate::Repository {
        registry.repository(RepositoryName::new("library/app").unwrap())
    }

    async fn push_blob(repo: &crate::Repository, content: &[u8], media_type: &str) -> Digest {
        repo.blobs().put(media_type, content).await.unwrap().digest
    }

    fn schema2_json(config: &Digest, config_len: usize, layer: &Digest, layer_len: usize) -> String {
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": {config_len},
    "digest": "{config}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": {layer_len},
      "digest": "{layer}"
    }}
  ]
}}"#
        )
    }

    async fn pushed_manifest(repo: &crate::Repository) -> Manifest {
        let config = push_blob(
            repo,
            br#"{"architecture":"amd64"}"#,
            "application/vnd.docker.container.image.v1+json",
        )
        .await;
        let layer = push_blob(repo, b"layer bytes", "application/octet-stream").await;
        let raw = schema2_json(&config, 24, &layer, 11);
        Manifest::parse(raw.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trips_the_payload() {
        let registry = registry(false);
        let repo = repo(&registry);
        let manifest = pushed_manifest(&repo).await;

        let digest = repo.manifests().put(&manifest).await.unwrap();
        assert_eq!(digest, manifest.digest());

        let fetched = repo.manifests().get(&digest).await.unwrap();
        assert_eq!(fetched.payload(), manifest.payload());
        assert_eq!(fetched.media_type(), manifest.media_type());
    }

    #[tokio::test]
    async fn put_refuses_dangling_references() {
        let registry = registry(false);
        let repo = repo(&registry);

        let missing = Digest::from_bytes(b"never uploaded");
        let config = push_blob(
            &repo,
            br#"{"architecture":"amd64"}"#,
            "application/vnd.docker.container.image.v1+json",
        )
        .await;
        let raw = schema2_json(&config, 24, &missing, 11);
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();

        let err = repo.manifests().put(&manifest).await.unwrap_err();
        match err {
            Error::ManifestBlobUnknown { digest } => assert_eq!(digest, missing),
            other => panic!("expected ManifestBlobUnknown, got {other:?}"),
        }

        // No revision link was created.
        assert!(!repo
            .manifests()
            .exists(&manifest.digest())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let registry = registry(false);
        let repo = repo(&registry);
        let manifest = pushed_manifest(&repo).await;

        let first = repo.manifests().put(&manifest).await.unwrap();
        let second = repo.manifests().put(&manifest).await.unwrap();
        assert_eq!(first, second);

        let mut revisions = Vec::new();
        repo.manifests()
            .enumerate(&mut |digest| revisions.push(digest))
            .await
            .unwrap();
        assert_eq!(revisions, vec![first]);
    }

    #[tokio::test]
    async fn get_unknown_manifest() {
        let registry = registry(false);
        let repo = repo(&registry);
        let missing = Digest::from_bytes(b"missing");
        assert!(matches!(
            repo.manifests().get(&missing).await,
            Err(Error::ManifestUnknown { .. })
        ));
        assert!(!repo.manifests().exists(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_gated_and_removes_the_link() {
        let registry = registry(true);
        let repo = repo(&registry);
        let manifest = pushed_manifest(&repo).await;
        let digest = repo.manifests().put(&manifest).await.unwrap();

        repo.manifests().delete(&digest).await.unwrap();
        assert!(!repo.manifests().exists(&digest).await.unwrap());

        // The manifest blob itself survives for GC to reclaim.
        assert!(registry.blobs().stat(&digest).await.is_ok());
    }

    #[tokio::test]
    async fn index_members_must_be_stored_first() {
        let registry = registry(false);
        let repo = repo(&registry);
        let image = pushed_manifest(&repo).await;

        let list_raw = format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
  "manifests": [
    {{
      "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
      "size": {},
      "digest": "{}",
      "platform": {{"architecture": "amd64", "os": "linux"}}
    }}
  ]
}}"#,
            image.payload().len(),
            image.digest()
        );
        let list = Manifest::parse(list_raw.as_bytes()).unwrap();

        // Member not stored yet: refused.
        assert!(matches!(
            repo.manifests().put(&list).await,
            Err(Error::ManifestBlobUnknown { .. })
        ));

        repo.manifests().put(&image).await.unwrap();
        let digest = repo.manifests().put(&list).await.unwrap();
        let fetched = repo.manifests().get(&digest).await.unwrap();
        assert!(fetched.is_index());
    }

    #[tokio::test]
    async fn schema1_signatures_round_trip_through_links() {
        let registry = registry(false);
        let repo = repo(&registry);

        let layer = push_blob(&repo, b"legacy layer", "application/octet-stream").await;
        let raw = format!(
            r#"{{
  "schemaVersion": 1,
  "name": "library/app",
  "tag": "latest",
  "architecture": "amd64",
  "fsLayers": [{{"blobSum": "{layer}"}}],
  "history": [{{"v1Compatibility": "{{}}"}}],
  "signatures": [
    {{"header": {{"alg": "ES256"}}, "signature": "c2ln", "protected": "cHJvdGVjdGVk"}}
  ]
}}"#
        );
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        let digest = repo.manifests().put(&manifest).await.unwrap();

        let fetched = repo.manifests().get(&digest).await.unwrap();
        let Manifest::Schema1(schema1) = fetched else {
            panic!("expected schema1");
        };
        assert_eq!(schema1.signatures.len(), 1);
        assert_eq!(schema1.signatures[0].signature, "c2ln");
    }
}
