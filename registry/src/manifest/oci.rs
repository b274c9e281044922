//! OCI image manifests and indexes.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::manifest::list::ManifestRef;
use crate::manifest::media_type;

/// An OCI image manifest: config, layers, annotations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,

    /// Optional on the wire; absent means the OCI manifest type.
    #[serde(default)]
    pub media_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(skip)]
    payload: Bytes,
}

impl OciManifest {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (mut manifest, payload): (Self, _) = super::parse_retaining_payload(bytes)?;
        manifest.payload = payload;
        Ok(manifest)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn references(&self) -> Vec<Descriptor> {
        let mut refs = Vec::with_capacity(1 + self.layers.len());
        refs.push(self.config.clone());
        refs.extend(self.layers.iter().cloned());
        refs
    }

    pub(crate) fn verify(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.schema_version != 2 {
            failures.push(format!(
                "OCI manifest declares version {}",
                self.schema_version
            ));
        }
        if let Some(declared) = &self.media_type {
            if declared != media_type::OCI_MANIFEST {
                failures.push(format!("OCI manifest declares media type {declared:?}"));
            }
        }
        if self.config.media_type != media_type::OCI_CONFIG
            && self.config.media_type != media_type::SCHEMA2_CONFIG
        {
            failures.push(format!(
                "unexpected config media type {:?}",
                self.config.media_type
            ));
        }
        for layer in &self.layers {
            let accepted = layer.media_type.starts_with(media_type::OCI_LAYER_PREFIX)
                || layer.media_type.starts_with(media_type::DOCKER_LAYER_PREFIX);
            if !accepted {
                failures.push(format!("unexpected layer media type {:?}", layer.media_type));
            }
        }
        failures
    }
}

/// An OCI image index: a list of manifests, possibly nested.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,

    #[serde(default)]
    pub media_type: Option<String>,

    pub manifests: Vec<ManifestRef>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(skip)]
    payload: Bytes,
}

const MEMBER_TYPES: &[&str] = &[
    media_type::OCI_MANIFEST,
    media_type::OCI_INDEX,
    media_type::SCHEMA2,
    media_type::MANIFEST_LIST,
];

impl OciIndex {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (mut index, payload): (Self, _) = super::parse_retaining_payload(bytes)?;
        index.payload = payload;
        Ok(index)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn references(&self) -> Vec<Descriptor> {
        self.manifests
            .iter()
            .map(|member| member.descriptor.clone())
            .collect()
    }

    pub(crate) fn verify(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.schema_version != 2 {
            failures.push(format!("OCI index declares version {}", self.schema_version));
        }
        if let Some(declared) = &self.media_type {
            if declared != media_type::OCI_INDEX {
                failures.push(format!("OCI index declares media type {declared:?}"));
            }
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

    fn manifest_json(config: &Digest, layer: &Digest) -> String {
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.oci.image.manifest.v1+json",
  "config": {{
    "mediaType": "application/vnd.oci.image.config.v1+json",
    "size": 1470,
    "digest": "{config}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
      "size": 818,
      "digest": "{layer}"
    }}
  ],
  "annotations": {{"org.opencontainers.image.created": "2024-01-01T00:00:00Z"}}
}}"#
        )
    }

    #[test]
    fn parses_with_annotations() {
        let config = Digest::from_bytes(b"config");
        let layer = Digest::from_bytes(b"layer");
        let manifest = Manifest::parse(manifest_json(&config, &layer).as_bytes()).unwrap();
        let Manifest::Oci(oci) = &manifest else {
            panic!("expected OCI manifest dispatch");
        };
        assert!(oci.verify().is_empty());
        assert_eq!(oci.annotations.len(), 1);
        assert_eq!(manifest.references().len(), 2);
    }

    #[test]
    fn media_type_may_be_omitted() {
        let config = Digest::from_bytes(b"config");
        let layer = Digest::from_bytes(b"layer");
        let raw = manifest_json(&config, &layer)
            .replace("  \"mediaType\": \"application/vnd.oci.image.manifest.v1+json\",\n", "");
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        assert!(matches!(manifest, Manifest::Oci(_)));
        assert_eq!(
            manifest.media_type(),
            media_type::OCI_MANIFEST,
            "absent media type defaults to the OCI manifest type"
        );
    }

    #[test]
    fn index_members_may_nest_indexes() {
        let member = Digest::from_bytes(b"member");
        let raw = format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.oci.image.index.v1+json",
  "manifests": [
    {{
      "mediaType": "application/vnd.oci.image.index.v1+json",
      "size": 100,
      "digest": "{member}"
    }}
  ]
}}"#
        );
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        let Manifest::OciIndex(index) = &manifest else {
            panic!("expected OCI index dispatch");
        };
        assert!(index.verify().is_empty());
        assert!(manifest.is_index());
    }
}
