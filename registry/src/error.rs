//! Error types for the registry storage core.

use crate::digest::{Digest, InvalidDigest};

use storage_driver::StorageError;

/// Result type for registry storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds the core surfaces to callers.
///
/// Transient backend failures are retried internally with bounded backoff
/// and never reach this enum; everything here is a final answer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Blob not found in the requested scope.
    #[error("blob unknown: {digest}")]
    BlobUnknown { digest: Digest },

    /// Bytes hashed during upload do not match the asserted digest.
    #[error("blob digest mismatch: expected {expected}, computed {computed}")]
    BlobInvalidDigest { expected: Digest, computed: Digest },

    /// Asserted size disagrees with the bytes written.
    #[error("blob length mismatch: expected {expected}, wrote {actual}")]
    BlobInvalidLength { expected: u64, actual: u64 },

    /// The blob is already present in this repository via a cross-repo
    /// mount.
    #[error("blob already mounted: {digest}")]
    BlobMounted { digest: Digest },

    /// No manifest stored under this digest.
    #[error("manifest unknown: {digest}")]
    ManifestUnknown { digest: Digest },

    /// A manifest references a blob that is not linked in this repository.
    #[error("manifest references unknown blob: {digest}")]
    ManifestBlobUnknown { digest: Digest },

    /// The manifest failed structural or media-type verification.
    #[error("manifest verification failed: {}", format_failures(.failures))]
    ManifestVerification { failures: Vec<String> },

    /// No such tag in this repository.
    #[error("tag unknown: {tag}")]
    TagUnknown { tag: String },

    /// No such repository.
    #[error("repository unknown: {name}")]
    RepositoryUnknown { name: String },

    /// The repository name is not canonical.
    #[error("invalid repository name: {name}")]
    NameInvalid { name: String },

    /// The tag name is malformed.
    #[error("invalid tag name: {tag}")]
    TagInvalid { tag: String },

    /// The digest string is malformed.
    #[error("invalid digest")]
    DigestInvalid(#[from] InvalidDigest),

    /// An upload append arrived below the current end of the session.
    #[error("invalid byte range for upload: offset {offset}, current end {current}")]
    RangeInvalid { offset: u64, current: u64 },

    /// No upload session with this id.
    #[error("upload unknown: {id}")]
    UploadUnknown { id: String },

    /// The upload session has aged past the write window and accepts no
    /// further bytes.
    #[error("upload {id} is read-only")]
    UploadReadOnly { id: String },

    /// The operation is disabled by configuration.
    #[error("operation unsupported")]
    Unsupported,

    /// The registry is in read-only maintenance mode.
    #[error("registry is read-only")]
    ReadOnly,

    /// A non-transient backend failure, wrapped with operation context.
    #[error("storage backend error")]
    Storage(#[from] StorageError),
}

fn format_failures(failures: &[String]) -> String {
    failures.join("; ")
}

impl Error {
    /// Map a backend error on a link or blob path to "unknown blob".
    ///
    /// Links are not authoritative: a missing target surfaces as an unknown
    /// blob, never as a backend failure.
    pub(crate) fn blob_from_storage(digest: &Digest, err: StorageError) -> Self {
        if err.is_not_found() {
            Error::BlobUnknown {
                digest: digest.clone(),
            }
        } else {
            Error::Storage(err)
        }
    }

    /// Whether this error reports something missing, as opposed to broken.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BlobUnknown { .. }
                | Error::ManifestUnknown { .. }
                | Error::ManifestBlobUnknown { .. }
                | Error::TagUnknown { .. }
                | Error::RepositoryUnknown { .. }
                | Error::UploadUnknown { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_errors_join_failures() {
        let err = Error::ManifestVerification {
            failures: vec!["missing config".to_string(), "bad layer type".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "manifest verification failed: missing config; bad layer type"
        );
    }

    #[test]
    fn storage_not_found_becomes_blob_unknown() {
        let digest = Digest::from_bytes(b"x");
        let storage = StorageError::new(
            "memory",
            storage_driver::StorageErrorKind::NotFound,
            "missing",
        );
        assert!(matches!(
            Error::blob_from_storage(&digest, storage),
            Error::BlobUnknown { .. }
        ));

        let storage = StorageError::new(
            "memory",
            storage_driver::StorageErrorKind::Permanent,
            "broken",
        );
        assert!(matches!(
            Error::blob_from_storage(&digest, storage),
            Error::Storage(_)
        ));
    }
}
