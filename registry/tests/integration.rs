//! End-to-end scenarios over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use registry_core::gc::{mark_and_sweep, GcOptions};
use registry_core::proxy::EntryKind;
use registry_core::{
    Descriptor, Digest, Error, Manifest, ProxyConfig, ProxyRegistry, Registry, RegistryConfig,
    RemoteRegistry, RepositoryName, TagName,
};
use storage::{Driver, MemoryDriver, StorageConfig};

fn registry() -> Registry {
    let storage = StorageConfig::Memory.build();
    registry_core::RegistryBuilder::new()
        .shared_driver(storage.driver())
        .config(RegistryConfig::default())
        .build()
        .unwrap()
}

fn name(raw: &str) -> RepositoryName {
    RepositoryName::new(raw).unwrap()
}

fn tag(raw: &str) -> TagName {
    TagName::new(raw).unwrap()
}

fn schema2_manifest(config: &Descriptor, layers: &[Descriptor]) -> Manifest {
    let layer_entries: Vec<String> = layers
        .iter()
        .map(|layer| {
            format!(
                r#"    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": {},
      "digest": "{}"
    }}"#,
                layer.size, layer.digest
            )
        })
        .collect();
    let raw = format!(
        r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": {},
    "digest": "{}"
  }},
  "layers": [
{}
  ]
}}"#,
        config.size,
        config.digest,
        layer_entries.join(",\n")
    );
    Manifest::parse(raw.as_bytes()).unwrap()
}

#[tokio::test]
async fn happy_push() {
    let registry = registry();
    let repo = registry.repository(name("library/hello"));

    let descriptor = repo
        .blobs()
        .put("application/octet-stream", b"hello\n")
        .await
        .unwrap();
    assert_eq!(
        descriptor.digest.to_string(),
        "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
    );
    assert_eq!(descriptor.size, 6);

    let content = repo.blobs().get_content(&descriptor.digest).await.unwrap();
    assert_eq!(content, b"hello\n");
}

#[tokio::test]
async fn manifest_commit_with_missing_layer_leaves_no_trace() {
    let registry = registry();
    let repo = registry.repository(name("library/broken"));

    let config = repo
        .blobs()
        .put(
            "application/vnd.docker.container.image.v1+json",
            br#"{"architecture":"amd64"}"#,
        )
        .await
        .unwrap();
    let missing = Descriptor::octet_stream(Digest::from_bytes(b"never uploaded"), 11);
    let manifest = schema2_manifest(&config, &[missing.clone()]);

    match repo.manifests().put(&manifest).await.unwrap_err() {
        Error::ManifestBlobUnknown { digest } => assert_eq!(digest, missing.digest),
        other => panic!("expected ManifestBlobUnknown, got {other:?}"),
    }

    // No revision link was created anywhere in the repository.
    assert!(!repo.manifests().exists(&manifest.digest()).await.unwrap());
    let mut revisions = Vec::new();
    repo.manifests()
        .enumerate(&mut |digest| revisions.push(digest))
        .await
        .unwrap();
    assert!(revisions.is_empty());
}

#[tokio::test]
async fn tag_update_and_history() {
    let registry = registry();
    let repo = registry.repository(name("library/tags"));
    let tags = repo.tags();

    let d1 = Descriptor::octet_stream(Digest::from_bytes(b"manifest one"), 0);
    let d2 = Descriptor::octet_stream(Digest::from_bytes(b"manifest two"), 0);

    tags.tag(&tag("v1"), &d1).await.unwrap();
    tags.tag(&tag("v1"), &d2).await.unwrap();

    assert_eq!(tags.get(&tag("v1")).await.unwrap().digest, d2.digest);

    let history = tags.manifest_digests(&tag("v1")).await.unwrap();
    assert!(history.contains(&d1.digest));
    assert!(history.contains(&d2.digest));

    assert_eq!(tags.lookup(&d2).await.unwrap(), vec![tag("v1")]);
    assert!(tags.lookup(&d1).await.unwrap().is_empty());
}

#[tokio::test]
async fn gc_reclaims_unreferenced_blob() {
    let registry = registry();

    let stray = registry
        .blobs()
        .put("application/octet-stream", b"unreferenced")
        .await
        .unwrap();

    let summary = mark_and_sweep(
        &registry,
        GcOptions {
            grace_window: Duration::ZERO,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(summary.blobs_swept, 1);

    assert!(matches!(
        registry.blobs().stat(&stray.digest).await,
        Err(Error::BlobUnknown { .. })
    ));
}

#[tokio::test]
async fn resumable_upload_across_restart() {
    let registry = registry();
    let repo = registry.repository(name("library/large"));

    let first_half = vec![0xA5u8; 4 * 1024 * 1024];
    let second_half = vec![0x5Au8; 4 * 1024 * 1024];
    let mut full = first_half.clone();
    full.extend_from_slice(&second_half);
    let expected = Digest::from_bytes(&full);

    let mut writer = repo.blobs().create_upload().await.unwrap();
    let id = writer.id().to_string();
    writer.append(&first_half).await.unwrap();
    // Process restart: the writer state is gone, only the backend remains.
    drop(writer);

    let mut resumed = repo.blobs().resume_upload(&id).await.unwrap();
    assert_eq!(resumed.size(), first_half.len() as u64);
    resumed
        .append_at(first_half.len() as u64, &second_half)
        .await
        .unwrap();

    let descriptor = resumed
        .commit(&expected, Some(full.len() as u64))
        .await
        .unwrap();
    assert_eq!(descriptor.digest, expected);

    let stored = repo.blobs().get_content(&expected).await.unwrap();
    assert_eq!(stored, full);
}

#[derive(Debug, Default)]
struct StaticRemote {
    blobs: parking_lot::Mutex<std::collections::HashMap<Digest, bytes::Bytes>>,
}

#[async_trait::async_trait]
impl RemoteRegistry for StaticRemote {
    async fn stat_blob(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
    ) -> registry_core::Result<Descriptor> {
        let blobs = self.blobs.lock();
        let payload = blobs.get(digest).ok_or_else(|| Error::BlobUnknown {
            digest: digest.clone(),
        })?;
        Ok(Descriptor::octet_stream(digest.clone(), payload.len() as u64))
    }

    async fn fetch_blob(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
    ) -> registry_core::Result<bytes::Bytes> {
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
        _digest: &Digest,
    ) -> registry_core::Result<bool> {
        Ok(false)
    }

    async fn fetch_manifest(
        &self,
        _repository: &RepositoryName,
        digest: &Digest,
    ) -> registry_core::Result<Manifest> {
        Err(Error::ManifestUnknown {
            digest: digest.clone(),
        })
    }

    async fn fetch_manifest_by_tag(
        &self,
        _repository: &RepositoryName,
        tag: &TagName,
    ) -> registry_core::Result<Manifest> {
        Err(Error::TagUnknown {
            tag: tag.to_string(),
        })
    }
}

#[tokio::test]
async fn proxy_ttl_evicts_blob_and_scheduler_state() {
    let driver = MemoryDriver::new();
    let local = Registry::new(
        driver.clone(),
        RegistryConfig {
            proxy: Some(ProxyConfig {
                ttl: Duration::from_millis(100),
            }),
            ..Default::default()
        },
    )
    .unwrap();

    let remote = Arc::new(StaticRemote::default());
    let digest = {
        let content = b"proxied layer";
        let digest = Digest::from_bytes(content);
        remote
            .blobs
            .lock()
            .insert(digest.clone(), bytes::Bytes::from_static(content));
        digest
    };

    let proxy = ProxyRegistry::new(local.clone(), remote).await;
    let repo = proxy.repository(name("library/cached"));

    let content = repo.blobs().get_content(&digest).await.unwrap();
    assert_eq!(content, b"proxied layer");
    assert!(local.blobs().stat(&digest).await.is_ok());
    assert!(proxy
        .scheduler()
        .contains(EntryKind::Blob, &digest.to_string()));

    tokio::time::sleep(Duration::from_millis(250)).await;

    // Evicted locally; the persisted scheduler state dropped the entry.
    assert!(matches!(
        local.blobs().stat(&digest).await,
        Err(Error::BlobUnknown { .. })
    ));
    assert!(!proxy
        .scheduler()
        .contains(EntryKind::Blob, &digest.to_string()));

    let state = driver
        .get_content(camino::Utf8Path::new(
            "docker/registry/v2/scheduler-state.json",
        ))
        .await
        .unwrap();
    assert!(!String::from_utf8(state).unwrap().contains(&digest.to_string()));
}

#[tokio::test]
async fn addressable_set_equals_reachable_closure_after_gc() {
    let registry = Registry::new(
        MemoryDriver::new(),
        RegistryConfig::default(),
    )
    .unwrap();
    let repo = registry.repository(name("library/closure"));

    // A tagged image, an untagged image, and a loose blob.
    let make_image = |seed: &'static str| {
        let repo = repo.clone();
        async move {
            let config = repo
                .blobs()
                .put(
                    "application/vnd.docker.container.image.v1+json",
                    format!(r#"{{"seed":"{seed}"}}"#).as_bytes(),
                )
                .await
                .unwrap();
            let layer = repo
                .blobs()
                .put("application/octet-stream", format!("layer {seed}").as_bytes())
                .await
                .unwrap();
            let manifest = schema2_manifest(&config, &[layer.clone()]);
            let digest = repo.manifests().put(&manifest).await.unwrap();
            (digest, config.digest, layer.digest)
        }
    };

    let (kept, kept_config, kept_layer) = make_image("kept").await;
    let (dropped, dropped_config, dropped_layer) = make_image("dropped").await;
    repo.tags()
        .tag(&tag("live"), &Descriptor::octet_stream(kept.clone(), 0))
        .await
        .unwrap();
    let loose = registry
        .blobs()
        .put("application/octet-stream", b"loose")
        .await
        .unwrap();

    mark_and_sweep(
        &registry,
        GcOptions {
            grace_window: Duration::ZERO,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for live in [&kept, &kept_config, &kept_layer] {
        assert!(registry.blobs().stat(live).await.is_ok(), "{live} must survive");
    }
    for dead in [&dropped, &dropped_config, &dropped_layer, &loose.digest] {
        assert!(
            matches!(registry.blobs().stat(dead).await, Err(Error::BlobUnknown { .. })),
            "{dead} must be reclaimed"
        );
    }
}
