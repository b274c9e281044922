//! Legacy schema 1 signed manifests.
//!
//! The JWS envelope is preserved byte-for-byte: the storage digest is
//! computed over the signed slice exactly as received, and re-serializing a
//! signed document would break its signatures. Detached signatures live
//! under the revision's signature links and are re-bundled on read.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::Result;
use crate::manifest::media_type;

/// One filesystem layer reference.
#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

/// One history entry, paired index-for-index with `fsLayers`.
#[derive(Debug, Clone, Deserialize)]
pub struct History {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

/// A detached JWS signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub header: serde_json::Value,
    pub signature: String,
    pub protected: String,
}

/// A schema 1 manifest, signed or bare.
#[derive(Debug, Clone, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub name: String,

    pub tag: String,

    #[serde(default)]
    pub architecture: String,

    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,

    pub history: Vec<History>,

    #[serde(default)]
    pub signatures: Vec<Signature>,

    #[serde(skip)]
    payload: Bytes,
}

impl Schema1Manifest {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (mut manifest, payload): (Self, _) = super::parse_retaining_payload(bytes)?;
        manifest.payload = payload;
        Ok(manifest)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn references(&self) -> Vec<Descriptor> {
        self.fs_layers
            .iter()
            .map(|layer| Descriptor {
                media_type: media_type::SCHEMA1_LAYER.to_string(),
                digest: layer.blob_sum.clone(),
                size: 0,
                urls: Vec::new(),
            })
            .collect()
    }

    /// Merge signatures recovered from storage, skipping ones already
    /// present in the envelope.
    pub(crate) fn merge_signatures(&mut self, extra: Vec<Signature>) {
        for signature in extra {
            if !self.signatures.contains(&signature) {
                self.signatures.push(signature);
            }
        }
    }

    pub(crate) fn verify(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.schema_version != 1 {
            failures.push(format!(
                "schema1 manifest declares version {}",
                self.schema_version
            ));
        }
        if self.fs_layers.is_empty() {
            failures.push("schema1 manifest has no layers".to_string());
        }
        if self.fs_layers.len() != self.history.len() {
            failures.push(format!(
                "history length {} does not pair with {} layers",
                self.history.len(),
                self.fs_layers.len()
            ));
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;

    fn signed_manifest(layer: &Digest) -> String {
        format!(
            r#"{{
  "schemaVersion": 1,
  "name": "library/hello",
  "tag": "latest",
  "architecture": "amd64",
  "fsLayers": [{{"blobSum": "{layer}"}}],
  "history": [{{"v1Compatibility": "{{}}"}}],
  "signatures": [
    {{"header": {{"alg": "ES256"}}, "signature": "c2ln", "protected": "cHJvdGVjdGVk"}}
  ]
}}"#
        )
    }

    #[test]
    fn dispatches_on_schema_version() {
        let raw = signed_manifest(&Digest::from_bytes(b"layer"));
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        let Manifest::Schema1(parsed) = &manifest else {
            panic!("expected schema1 dispatch");
        };
        assert!(parsed.verify().is_empty());
        assert_eq!(parsed.signatures.len(), 1);
        assert_eq!(
            manifest.media_type(),
            media_type::SCHEMA1_SIGNED,
            "signed envelope serves as prettyjws"
        );
    }

    #[test]
    fn references_are_the_layer_sums() {
        let layer = Digest::from_bytes(b"layer");
        let raw = signed_manifest(&layer);
        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        let refs = manifest.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].digest, layer);
    }

    #[test]
    fn history_must_pair_with_layers() {
        let raw = signed_manifest(&Digest::from_bytes(b"layer")).replace(
            r#""history": [{"v1Compatibility": "{}"}]"#,
            r#""history": []"#,
        );
        let Manifest::Schema1(parsed) = Manifest::parse(raw.as_bytes()).unwrap() else {
            panic!("expected schema1 dispatch");
        };
        assert!(!parsed.verify().is_empty());
    }

    #[test]
    fn merge_signatures_deduplicates() {
        let raw = signed_manifest(&Digest::from_bytes(b"layer"));
        let Manifest::Schema1(mut parsed) = Manifest::parse(raw.as_bytes()).unwrap() else {
            panic!("expected schema1 dispatch");
        };
        let existing = parsed.signatures[0].clone();
        let fresh = Signature {
            header: serde_json::json!({"alg": "ES256"}),
            signature: "b3RoZXI".to_string(),
            protected: "cHJvdGVjdGVk".to_string(),
        };
        parsed.merge_signatures(vec![existing, fresh]);
        assert_eq!(parsed.signatures.len(), 2);
    }
}
