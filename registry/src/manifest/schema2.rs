//! Docker schema 2 image manifests.

use bytes::Bytes;
use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::manifest::media_type;

/// A schema 2 manifest: one config blob plus ordered layers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema2Manifest {
    pub schema_version: u32,

    #[serde(default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(skip)]
    payload: Bytes,
}

impl Schema2Manifest {
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
                "schema2 manifest declares version {}",
                self.schema_version
            ));
        }
        if self.media_type != media_type::SCHEMA2 {
            failures.push(format!(
                "schema2 manifest declares media type {:?}",
                self.media_type
            ));
        }
        if self.config.media_type != media_type::SCHEMA2_CONFIG {
            failures.push(format!(
                "unexpected config media type {:?}",
                self.config.media_type
            ));
        }
        for layer in &self.layers {
            if !layer.media_type.starts_with(media_type::DOCKER_LAYER_PREFIX) {
                failures.push(format!("unexpected layer media type {:?}", layer.media_type));
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

    fn manifest_json(layer: &Digest, config: &Digest) -> String {
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "size": 7023,
    "digest": "{config}"
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "size": 32654,
      "digest": "{layer}"
    }}
  ]
}}"#
        )
    }

    #[test]
    fn parses_and_references_config_then_layers() {
        let layer = Digest::from_bytes(b"layer");
        let config = Digest::from_bytes(b"config");
        let raw = manifest_json(&layer, &config);

        let manifest = Manifest::parse(raw.as_bytes()).unwrap();
        let Manifest::Schema2(parsed) = &manifest else {
            panic!("expected schema2 dispatch");
        };
        assert!(parsed.verify().is_empty());

        let refs = manifest.references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].digest, config);
        assert_eq!(refs[1].digest, layer);
    }

    #[test]
    fn verification_flags_wrong_config_type() {
        let raw = manifest_json(&Digest::from_bytes(b"l"), &Digest::from_bytes(b"c"))
            .replace("container.image.v1", "container.image.v9");
        let Manifest::Schema2(parsed) = Manifest::parse(raw.as_bytes()).unwrap() else {
            panic!("expected schema2 dispatch");
        };
        let failures = parsed.verify();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("config media type"));
    }
}
