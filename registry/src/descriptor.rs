//! Blob references.

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type assigned to blobs whose content the registry does not
/// interpret.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A reference to a blob: its media type, digest and size.
///
/// The core never trusts `size` or `media_type` from untrusted input
/// without re-deriving them from the bytes where possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    /// Alternate locations the content may be fetched from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    /// A descriptor for uninterpreted bytes.
    pub fn octet_stream(digest: Digest, size: u64) -> Self {
        Self {
            media_type: OCTET_STREAM.to_string(),
            digest,
            size,
            urls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_and_skips_empty_urls() {
        let descriptor = Descriptor::octet_stream(Digest::from_bytes(b"x"), 1);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert!(json.get("mediaType").is_some());
        assert!(json.get("urls").is_none());
        assert_eq!(json["size"], 1);
    }

    #[test]
    fn round_trips() {
        let descriptor = Descriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            digest: Digest::from_bytes(b"layer"),
            size: 5,
            urls: vec!["https://mirror.example/layer".to_string()],
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }
}
