//! # Registry storage core
//!
//! The content-addressed storage core of a container image registry: blobs,
//! repository-scoped links, manifests, tags, garbage collection and a
//! pull-through proxy, layered over a pluggable [`storage_driver::Driver`]
//! backend.
//!
//! ## Example
//!
//! ```no_run
//! use registry_core::{Registry, RegistryConfig, RepositoryName};
//!
//! # async fn example(driver: storage::MemoryDriver) -> registry_core::Result<()> {
//! let registry = Registry::new(driver, RegistryConfig::default()).expect("valid config");
//!
//! let repo = registry.repository(RepositoryName::new("library/ubuntu")?);
//! let descriptor = repo.blobs().put("application/octet-stream", b"hello\n").await?;
//! assert_eq!(repo.blobs().stat(&descriptor.digest).await?.size, 6);
//! # Ok(())
//! # }
//! ```
//!
//! Three invariants shape everything here: an object's identifier is the
//! digest of its bytes; repositories reach shared blobs only through link
//! files; and the backend guarantees nothing beyond per-key last-writer-wins,
//! so every layer tolerates dangling links and repairs rather than assumes.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use storage_driver::retry::Backoff;
use storage_driver::Driver;

pub mod blob;
pub mod cache;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod gc;
pub mod manifest;
pub mod paths;
pub mod proxy;
pub mod reference;
pub mod tag;
pub mod uploads;

pub use blob::{BlobStore, BlobWriter, LinkedBlobStore, ServedBlob};
pub use cache::{DescriptorCache, InMemoryDescriptorCache};
pub use config::{CacheConfig, ConfigError, ProxyConfig, RegistryConfig, UploadPurgeConfig};
pub use descriptor::Descriptor;
pub use digest::{Algorithm, Digest, Digester};
pub use error::{Error, Result};
pub use gc::{mark_and_sweep, GcOptions, GcSummary};
pub use manifest::{Manifest, ManifestStore, PutOptions};
pub use proxy::{HttpRemoteRegistry, ProxyRegistry, RemoteRegistry};
pub use reference::{RepositoryName, TagName};
pub use tag::TagStore;
pub use uploads::{purge_uploads, start_upload_purger, PurgeSummary};

/// State shared by every store handle cut from one registry.
pub(crate) struct Shared {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) config: RegistryConfig,
    pub(crate) cache: Option<Arc<dyn DescriptorCache>>,
    pub(crate) backoff: Backoff,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("driver", &self.driver.name())
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

/// Configures and creates a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    driver: Option<Arc<dyn Driver>>,
    config: RegistryConfig,
    cache: Option<Arc<dyn DescriptorCache>>,
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBuilder")
            .field("driver", &self.driver.as_ref().map(|d| d.name()))
            .field("config", &self.config)
            .finish()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend.
    pub fn driver<D: Driver + 'static>(mut self, driver: D) -> Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Set the storage backend from an already-shared driver.
    pub fn shared_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the configuration record.
    pub fn config(mut self, config: RegistryConfig) -> Self {
        self.config = config;
        self
    }

    /// Inject a descriptor cache provider, overriding the `cache` section
    /// of the configuration. This is how an external (Redis-compatible)
    /// provider is wired in.
    pub fn cache<C: DescriptorCache + 'static>(mut self, cache: C) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Validate the configuration and wire the stores.
    pub fn build(self) -> std::result::Result<Registry, ConfigError> {
        let driver = self.driver.ok_or(ConfigError::MissingDriver)?;
        self.config.validate()?;

        let cache = match (&self.cache, &self.config.cache) {
            (Some(explicit), _) => Some(Arc::clone(explicit)),
            (None, CacheConfig::InMemory { capacity }) => {
                let capacity =
                    NonZeroUsize::new(*capacity).ok_or(ConfigError::ZeroCacheCapacity)?;
                Some(Arc::new(InMemoryDescriptorCache::new(capacity)) as Arc<dyn DescriptorCache>)
            }
            (None, CacheConfig::Disabled) => None,
        };

        Ok(Registry {
            shared: Arc::new(Shared {
                driver,
                config: self.config,
                cache,
                backoff: Backoff::default(),
            }),
        })
    }
}

/// The top-level handle over one backend. Cheap to clone; all stores cut
/// from it share the driver, configuration and descriptor cache.
#[derive(Debug, Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

impl Registry {
    /// Create a registry over `driver` with `config`.
    pub fn new<D: Driver + 'static>(
        driver: D,
        config: RegistryConfig,
    ) -> std::result::Result<Self, ConfigError> {
        RegistryBuilder::new().driver(driver).config(config).build()
    }

    /// The global, repository-agnostic blob store.
    pub fn blobs(&self) -> BlobStore {
        BlobStore::new(Arc::clone(&self.shared))
    }

    /// Repository-scoped access to blobs, manifests and tags.
    pub fn repository(&self, name: RepositoryName) -> Repository {
        Repository {
            shared: Arc::clone(&self.shared),
            name,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

/// Name-scoped access to one repository's stores.
///
/// Cheap to allocate; instances are typically request-scoped.
#[derive(Debug, Clone)]
pub struct Repository {
    shared: Arc<Shared>,
    name: RepositoryName,
}

impl Repository {
    pub fn name(&self) -> &RepositoryName {
        &self.name
    }

    /// The layer blob store for this repository.
    pub fn blobs(&self) -> LinkedBlobStore {
        LinkedBlobStore::new(
            Arc::clone(&self.shared),
            self.name.clone(),
            blob::LinkRole::Layer,
        )
    }

    /// The manifest store for this repository.
    pub fn manifests(&self) -> ManifestStore {
        ManifestStore::new(Arc::clone(&self.shared), self.name.clone())
    }

    /// The tag store for this repository.
    pub fn tags(&self) -> TagStore {
        TagStore::new(Arc::clone(&self.shared), self.name.clone())
    }
}
