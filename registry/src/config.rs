//! Registry configuration.
//!
//! Every knob the storage core honors lives in one explicit record,
//! validated exactly once in [`crate::RegistryBuilder::build`]. Nothing
//! else reads configuration ambiently.

use std::time::Duration;

use serde::Deserialize;

/// Deserialize a duration expressed in whole seconds.
mod duration_secs {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration consumed by the storage core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Enables blob and manifest deletion (`storage.delete.enabled`).
    pub delete_enabled: bool,

    /// When set, blob serving issues redirect URLs through the driver
    /// (`!storage.redirect.disabled`).
    pub redirect_enabled: bool,

    /// Rejects every write at the blob store layer
    /// (`storage.maintenance.readonly.enabled`).
    pub read_only: bool,

    /// Also remove emptied parent prefixes on delete. Only sound on
    /// strongly consistent backends; requires `delete_enabled`.
    pub remove_parents_on_delete: bool,

    /// Blob descriptor cache selection (`storage.cache.blobdescriptor`).
    pub cache: CacheConfig,

    /// Background purging of abandoned upload sessions
    /// (`storage.maintenance.uploadpurging`).
    pub upload_purging: UploadPurgeConfig,

    /// Age past which an upload session refuses further writes.
    #[serde(with = "duration_secs")]
    pub upload_read_only_age: Duration,

    /// Parallelism for tag reverse lookups. Falls back to the
    /// `STORAGE_TAGSTORE_LOOKUP_CONCURRENCY` environment variable, then 64.
    pub tag_lookup_concurrency: Option<usize>,

    /// Pull-through proxy settings; `None` for an ordinary registry.
    pub proxy: Option<ProxyConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            delete_enabled: false,
            redirect_enabled: true,
            read_only: false,
            remove_parents_on_delete: false,
            cache: CacheConfig::default(),
            upload_purging: UploadPurgeConfig::default(),
            upload_read_only_age: 7 * DAY,
            tag_lookup_concurrency: None,
            proxy: None,
        }
    }
}

/// Blob descriptor cache provider selection.
///
/// External providers (e.g. Redis-compatible) are injected through
/// [`crate::RegistryBuilder::cache`] instead of this enum.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheConfig {
    /// No descriptor memoization.
    #[default]
    Disabled,

    /// Bounded in-process LRU.
    InMemory { capacity: usize },
}

/// Upload purge pass settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UploadPurgeConfig {
    pub enabled: bool,

    /// Sessions older than this are deleted.
    #[serde(with = "duration_secs")]
    pub age: Duration,

    /// How often the purge pass runs.
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// Log what would be deleted without deleting.
    pub dry_run: bool,
}

impl Default for UploadPurgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            age: 14 * DAY,
            interval: DAY,
            dry_run: false,
        }
    }
}

/// Pull-through cache settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProxyConfig {
    /// How long proxied content stays cached locally (`proxy.ttl`).
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
        }
    }
}

/// A configuration rejected at construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a storage driver must be configured")]
    MissingDriver,

    #[error("remove-parents-on-delete requires delete-enabled")]
    RemoveParentsWithoutDelete,

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("in-memory cache capacity must be greater than zero")]
    ZeroCacheCapacity,

    #[error("upload-read-only-age must not exceed the upload purge age")]
    ReadOnlyAfterPurge,
}

impl RegistryConfig {
    /// Validate cross-field constraints. Called once, at construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remove_parents_on_delete && !self.delete_enabled {
            return Err(ConfigError::RemoveParentsWithoutDelete);
        }
        if self.upload_read_only_age.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "upload-read-only-age",
            });
        }
        if self.upload_purging.age.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "upload-purging.age",
            });
        }
        if self.upload_purging.interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "upload-purging.interval",
            });
        }
        if self.upload_read_only_age > self.upload_purging.age {
            return Err(ConfigError::ReadOnlyAfterPurge);
        }
        if let CacheConfig::InMemory { capacity: 0 } = self.cache {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if let Some(proxy) = &self.proxy {
            if proxy.ttl.is_zero() {
                return Err(ConfigError::ZeroDuration { field: "proxy.ttl" });
            }
        }
        Ok(())
    }

    /// Effective tag reverse-lookup parallelism.
    pub fn lookup_concurrency(&self) -> usize {
        if let Some(explicit) = self.tag_lookup_concurrency {
            return explicit.max(1);
        }
        std::env::var("STORAGE_TAGSTORE_LOOKUP_CONCURRENCY")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RegistryConfig::default().validate().unwrap();
    }

    #[test]
    fn remove_parents_requires_delete() {
        let config = RegistryConfig {
            remove_parents_on_delete: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RemoveParentsWithoutDelete)
        ));

        let config = RegistryConfig {
            delete_enabled: true,
            remove_parents_on_delete: true,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let config = RegistryConfig {
            cache: CacheConfig::InMemory { capacity: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn read_only_age_must_precede_purge_age() {
        let config = RegistryConfig {
            upload_read_only_age: Duration::from_secs(100),
            upload_purging: UploadPurgeConfig {
                age: Duration::from_secs(50),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ReadOnlyAfterPurge)
        ));
    }

    #[test]
    fn config_deserializes_from_kebab_case_json() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{
                "delete-enabled": true,
                "cache": {"in-memory": {"capacity": 512}},
                "upload-read-only-age": 3600,
                "proxy": {"ttl": 120}
            }"#,
        )
        .unwrap();
        assert!(config.delete_enabled);
        assert!(matches!(config.cache, CacheConfig::InMemory { capacity: 512 }));
        assert_eq!(config.upload_read_only_age, Duration::from_secs(3600));
        config.validate().unwrap();
        assert_eq!(config.proxy.unwrap().ttl, Duration::from_secs(120));
    }

    #[test]
    fn explicit_lookup_concurrency_wins() {
        let config = RegistryConfig {
            tag_lookup_concurrency: Some(8),
            ..Default::default()
        };
        assert_eq!(config.lookup_concurrency(), 8);
    }
}
