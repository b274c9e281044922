//! # Storage backends
//!
//! Reference backends for the registry storage core, plus configuration and
//! a cheap-to-clone handle unifying them behind `Arc<dyn Driver>`.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

pub(crate) mod filesystem;
pub(crate) mod memory;

#[doc(inline)]
pub use filesystem::FilesystemDriver;
#[doc(inline)]
pub use memory::MemoryDriver;

#[doc(inline)]
pub use storage_driver::{
    Driver, FileInfo, FileWriter, Reader, StorageError, StorageErrorKind, UrlOptions, WalkControl,
};

/// Backend selection, deserialized from the host's configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Hold everything in process memory. Test and development only.
    Memory,

    /// Store objects under a local directory.
    Filesystem { path: Utf8PathBuf },
}

impl StorageConfig {
    /// Build the configured backend.
    #[tracing::instrument]
    pub fn build(self) -> Storage {
        match self {
            StorageConfig::Memory => MemoryDriver::new().into(),
            StorageConfig::Filesystem { path } => FilesystemDriver::new(path).into(),
        }
    }
}

type ArcDriver = Arc<dyn Driver>;

/// A shared handle to a storage backend.
///
/// Clones share the same driver. The registry core takes the driver itself;
/// this handle exists for embedders that want instrumented direct access.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    pub fn new<D: Driver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// The underlying driver, for handing to the registry core.
    pub fn driver(&self) -> ArcDriver {
        self.driver.clone()
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_content(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(path).await
    }

    #[tracing::instrument(skip(self, content), fields(driver = self.driver.name(), len = content.len()))]
    pub async fn put_content(&self, path: &Utf8Path, content: &[u8]) -> Result<(), StorageError> {
        self.driver.put_content(path, content).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn stat(&self, path: &Utf8Path) -> Result<FileInfo, StorageError> {
        self.driver.stat(path).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn list(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
        self.driver.list(path).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        self.driver.rename(from, to).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_config_builds_a_working_backend() {
        let storage = StorageConfig::Memory.build();
        assert_eq!(storage.name(), "memory");

        storage.put_content(Utf8Path::new("k"), b"v").await.unwrap();
        assert_eq!(storage.get_content(Utf8Path::new("k")).await.unwrap(), b"v");
    }

    #[test]
    fn config_deserializes_kebab_case() {
        let config: StorageConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));

        let config: StorageConfig =
            serde_json::from_str(r#"{"filesystem": {"path": "/var/lib/registry"}}"#).unwrap();
        assert!(matches!(config, StorageConfig::Filesystem { .. }));
    }
}
