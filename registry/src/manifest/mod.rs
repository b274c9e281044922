//! Typed manifests.
//!
//! Manifests are self-describing JSON: the media type embedded in the bytes
//! selects the variant, and hashing the canonical bytes yields the storage
//! digest. Parsing never reformats — the payload carried by every variant is
//! the on-wire byte slice, verbatim, because that is what the digest was
//! computed over.

mod list;
mod oci;
mod schema1;
mod schema2;
mod store;

pub use list::{ManifestList, ManifestRef, Platform};
pub use oci::{OciIndex, OciManifest};
pub use schema1::{FsLayer, History, Schema1Manifest, Signature};
pub use schema2::Schema2Manifest;
pub use store::{ManifestStore, PutOptions};

use bytes::Bytes;
use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::{Error, Result};

/// Media types the manifest store understands.
pub mod media_type {
    pub const SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const SCHEMA1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const SCHEMA1_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const SCHEMA2_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER_PREFIX: &str = "application/vnd.docker.image.rootfs.";
    pub const MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_PREFIX: &str = "application/vnd.oci.image.layer.";
}

/// A parsed manifest of any supported schema.
///
/// A closed set of variants dispatched by media type; every variant exposes
/// the same operations, so callers never branch on schema except to add one.
#[derive(Debug, Clone)]
pub enum Manifest {
    /// Legacy signed manifest (schema 1).
    Schema1(Schema1Manifest),

    /// Docker schema 2: config plus layers.
    Schema2(Schema2Manifest),

    /// Docker manifest list.
    List(ManifestList),

    /// OCI image manifest.
    Oci(OciManifest),

    /// OCI image index.
    OciIndex(OciIndex),
}

/// Just enough structure to pick a handler.
#[derive(Deserialize)]
struct Probe {
    #[serde(default, rename = "schemaVersion")]
    schema_version: Option<u64>,
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    #[serde(default, rename = "fsLayers")]
    fs_layers: Option<serde_json::Value>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl Manifest {
    /// Parse manifest bytes, dispatching on the embedded media type.
    ///
    /// Schema 1 carries no media type on the wire and is recognized by its
    /// version number and `fsLayers`; OCI documents may omit the media type,
    /// in which case their shape decides.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let probe: Probe = serde_json::from_slice(bytes).map_err(|err| {
            Error::ManifestVerification {
                failures: vec![format!("manifest is not valid JSON: {err}")],
            }
        })?;

        if probe.schema_version == Some(1) || probe.fs_layers.is_some() {
            return Ok(Manifest::Schema1(Schema1Manifest::from_bytes(bytes)?));
        }

        match probe.media_type.as_deref() {
            Some(media_type::SCHEMA2) => Ok(Manifest::Schema2(Schema2Manifest::from_bytes(bytes)?)),
            Some(media_type::MANIFEST_LIST) => {
                Ok(Manifest::List(ManifestList::from_bytes(bytes)?))
            }
            Some(media_type::OCI_MANIFEST) => Ok(Manifest::Oci(OciManifest::from_bytes(bytes)?)),
            Some(media_type::OCI_INDEX) => Ok(Manifest::OciIndex(OciIndex::from_bytes(bytes)?)),
            Some(other) => Err(Error::ManifestVerification {
                failures: vec![format!("unsupported manifest media type: {other}")],
            }),
            None if probe.manifests.is_some() => {
                Ok(Manifest::OciIndex(OciIndex::from_bytes(bytes)?))
            }
            None if probe.config.is_some() => Ok(Manifest::Oci(OciManifest::from_bytes(bytes)?)),
            None => Err(Error::ManifestVerification {
                failures: vec!["manifest declares no media type and matches no schema".to_string()],
            }),
        }
    }

    /// The media type this manifest is stored and served under.
    pub fn media_type(&self) -> &str {
        match self {
            Manifest::Schema1(m) => {
                if m.signatures.is_empty() {
                    media_type::SCHEMA1
                } else {
                    media_type::SCHEMA1_SIGNED
                }
            }
            Manifest::Schema2(m) => &m.media_type,
            Manifest::List(m) => &m.media_type,
            Manifest::Oci(m) => m.media_type.as_deref().unwrap_or(media_type::OCI_MANIFEST),
            Manifest::OciIndex(m) => m.media_type.as_deref().unwrap_or(media_type::OCI_INDEX),
        }
    }

    /// The canonical bytes: exactly what arrived, exactly what is hashed.
    pub fn payload(&self) -> &Bytes {
        match self {
            Manifest::Schema1(m) => m.payload(),
            Manifest::Schema2(m) => m.payload(),
            Manifest::List(m) => m.payload(),
            Manifest::Oci(m) => m.payload(),
            Manifest::OciIndex(m) => m.payload(),
        }
    }

    /// The storage digest of the canonical bytes.
    pub fn digest(&self) -> Digest {
        Digest::from_bytes(self.payload())
    }

    /// A descriptor for this manifest as a blob.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type().to_string(),
            digest: self.digest(),
            size: self.payload().len() as u64,
            urls: Vec::new(),
        }
    }

    /// Every blob or manifest this manifest references.
    ///
    /// For image manifests these are the config and layers; for lists and
    /// indexes, the member manifests.
    pub fn references(&self) -> Vec<Descriptor> {
        match self {
            Manifest::Schema1(m) => m.references(),
            Manifest::Schema2(m) => m.references(),
            Manifest::List(m) => m.references(),
            Manifest::Oci(m) => m.references(),
            Manifest::OciIndex(m) => m.references(),
        }
    }

    /// Whether the references are themselves manifests.
    pub fn is_index(&self) -> bool {
        matches!(self, Manifest::List(_) | Manifest::OciIndex(_))
    }

    /// Structural verification: required fields, version numbers, and the
    /// media-type allow-lists for referenced content.
    pub(crate) fn verify(&self) -> Result<()> {
        let failures = match self {
            Manifest::Schema1(m) => m.verify(),
            Manifest::Schema2(m) => m.verify(),
            Manifest::List(m) => m.verify(),
            Manifest::Oci(m) => m.verify(),
            Manifest::OciIndex(m) => m.verify(),
        };
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::ManifestVerification { failures })
        }
    }
}

/// Shared helper: parse a typed manifest document and retain the payload.
fn parse_retaining_payload<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<(T, Bytes)> {
    let parsed = serde_json::from_slice(bytes).map_err(|err| Error::ManifestVerification {
        failures: vec![format!("manifest does not match its schema: {err}")],
    })?;
    Ok((parsed, Bytes::copy_from_slice(bytes)))
}
