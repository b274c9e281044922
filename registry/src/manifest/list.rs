//! Docker manifest lists.

use bytes::Bytes;
use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::manifest::media_type;

/// The platform a member manifest targets.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub architecture: String,

    pub os: String,

    #[serde(default)]
    pub variant: Option<String>,
}

/// One member of a manifest list or image index.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRef {
    #[serde(flatten)]
    pub descriptor: Descriptor,

    #[serde(default)]
    pub platform: Option<Platform>,
}

/// A list of platform-specific manifests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,

    #[serde(default)]
    pub media_type: String,

    pub manifests: Vec<ManifestRef>,

    #[serde(skip)]
    payload: Bytes,
}

const MEMBER_TYPES: &[&str] = &[
    media_type::SCHEMA2,
    media_type::SCHEMA1,
    media_type::SCHEMA1_SIGNED,
    media_type::OCI_MANIFEST,
];

impl ManifestList {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (mut list, payload): (Self, _) = super::parse_retaining_payload(bytes)?;
        list.payload = payload;
        Ok(list)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Member manifests. These reference manifests, not layers; a list is
    /// never recursively fetched on read.
    pub fn references(&self) -> Vec<Descriptor> {
        self.manifests
            .iter()
            .map(|member| member.descriptor.clone())
            .collect()
    }

    pub(crate) fn verify(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.schema_version != 2 {
            failures.push(format!(
                "manifest list declares version {}",
                self.schema_version
            ));
        }
        if self.media_type != media_type::MANIFEST_LIST {
            failures.push(format!(
                "manifest list declares media type {:?}",
                self.media_type
            ));
        }
        for member in &self.manifests {
            if !MEMBER_TYPES.contains(&member.descriptor.media_type.as_str()) {
                failures.push(format!(
                    "unexpected member media type {:?}",
                    member.descriptor.media_type
                ));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::manifest::Manifest;

    fn list_json(member: &Digest) -> String {
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
  "manifests": [
    {{
      "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
      "size": 527,
      "digest": "{member}",
      "platform": {{"architecture": "amd64", "os": "linux"}}
    }}
  ]
}}"#
        )
    }

    #[test]
    fn parses_members_with_platforms() {
        let member = Digest::from_bytes(b"member");
        let manifest = Manifest::parse(list_json(&member).as_bytes()).unwrap();
        let Manifest::List(list) = &manifest else {
            panic!("expected manifest list dispatch");
        };
        assert!(list.verify().is_empty());
        assert!(manifest.is_index());
        assert_eq!(list.manifests[0].platform.as_ref().unwrap().os, "linux");
        assert_eq!(manifest.references()[0].digest, member);
    }

    #[test]
    fn verification_flags_foreign_members() {
        let raw = list_json(&Digest::from_bytes(b"member"))
            .replace("manifest.v2+json", "something.else+json");
        let Manifest::List(list) = Manifest::parse(raw.as_bytes()).unwrap() else {
            panic!("expected manifest list dispatch");
        };
        assert!(!list.verify().is_empty());
    }
}
