//! The upstream registry client contract.

use std::fmt;

use bytes::Bytes;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::reference::{RepositoryName, TagName};

/// A remote registry the proxy pulls through.
///
/// Implementations must preserve digests end-to-end: every payload handed
/// back has been verified against the digest it is addressed by.
#[async_trait::async_trait]
pub trait RemoteRegistry: Send + Sync + fmt::Debug {
    async fn stat_blob(&self, repository: &RepositoryName, digest: &Digest) -> Result<Descriptor>;

    async fn fetch_blob(&self, repository: &RepositoryName, digest: &Digest) -> Result<Bytes>;

    async fn manifest_exists(&self, repository: &RepositoryName, digest: &Digest) -> Result<bool>;

    async fn fetch_manifest(&self, repository: &RepositoryName, digest: &Digest)
        -> Result<Manifest>;

    async fn fetch_manifest_by_tag(
        &self,
        repository: &RepositoryName,
        tag: &TagName,
    ) -> Result<Manifest>;
}

/// Verify a fetched payload against the digest it was requested by.
pub(crate) fn verify_payload(expected: &Digest, payload: &[u8]) -> Result<()> {
    let mut digester = expected.algorithm().digester();
    digester.update(payload);
    let computed = digester.finalize();
    if computed != *expected {
        return Err(Error::BlobInvalidDigest {
            expected: expected.clone(),
            computed,
        });
    }
    Ok(())
}

/// Accept header listing every manifest schema the core understands.
const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v1+prettyjws, ",
    "application/vnd.docker.distribution.manifest.v1+json"
);

/// [`RemoteRegistry`] over the upstream v2 HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRemoteRegistry {
    client: reqwest::Client,
    base: String,
}

impl HttpRemoteRegistry {
    /// Create a client for the registry at `base` (e.g.
    /// `https://registry-1.docker.io`).
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Use a preconfigured client (timeouts, proxies, TLS).
    pub fn with_client(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn blob_url(&self, repository: &RepositoryName, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.base, repository, digest)
    }

    fn manifest_url(&self, repository: &RepositoryName, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base, repository, reference)
    }

    async fn fetch_manifest_bytes(
        &self,
        repository: &RepositoryName,
        reference: &str,
    ) -> Result<Option<Bytes>> {
        let response = self
            .client
            .get(self.manifest_url(repository, reference))
            .header(http::header::ACCEPT.as_str(), MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(transport_error)?;
        let payload = response.bytes().await.map_err(transport_error)?;
        Ok(Some(payload))
    }
}

/// Transport failures map onto the storage taxonomy as transient backend
/// errors: the upstream is the proxy's backend.
fn transport_error(err: reqwest::Error) -> Error {
    Error::Storage(storage_driver::StorageError::new(
        "remote",
        storage_driver::StorageErrorKind::Transient,
        err,
    ))
}

#[async_trait::async_trait]
impl RemoteRegistry for HttpRemoteRegistry {
    async fn stat_blob(&self, repository: &RepositoryName, digest: &Digest) -> Result<Descriptor> {
        let response = self
            .client
            .head(self.blob_url(repository, digest))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::BlobUnknown {
                digest: digest.clone(),
            });
        }
        let response = response.error_for_status().map_err(transport_error)?;
        let size = response.content_length().unwrap_or(0);
        Ok(Descriptor::octet_stream(digest.clone(), size))
    }

    async fn fetch_blob(&self, repository: &RepositoryName, digest: &Digest) -> Result<Bytes> {
        let response = self
            .client
            .get(self.blob_url(repository, digest))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::BlobUnknown {
                digest: digest.clone(),
            });
        }
        let response = response.error_for_status().map_err(transport_error)?;
        let payload = response.bytes().await.map_err(transport_error)?;
        verify_payload(digest, &payload)?;
        Ok(payload)
    }

    async fn manifest_exists(&self, repository: &RepositoryName, digest: &Digest) -> Result<bool> {
        let response = self
            .client
            .head(self.manifest_url(repository, &digest.to_string()))
            .header(http::header::ACCEPT.as_str(), MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        response.error_for_status().map_err(transport_error)?;
        Ok(true)
    }

    async fn fetch_manifest(
        &self,
        repository: &RepositoryName,
        digest: &Digest,
    ) -> Result<Manifest> {
        let payload = self
            .fetch_manifest_bytes(repository, &digest.to_string())
            .await?
            .ok_or_else(|| Error::ManifestUnknown {
                digest: digest.clone(),
            })?;
        verify_payload(digest, &payload)?;
        Manifest::parse(&payload)
    }

    async fn fetch_manifest_by_tag(
        &self,
        repository: &RepositoryName,
        tag: &TagName,
    ) -> Result<Manifest> {
        let payload = self
            .fetch_manifest_bytes(repository, tag.as_str())
            .await?
            .ok_or_else(|| Error::TagUnknown {
                tag: tag.to_string(),
            })?;
        Manifest::parse(&payload)
    }
}
