//! Mapping from semantic keys to backend paths.
//!
//! The layout in the storage backend is roughly as follows:
//!
//! ```text
//! docker/registry/v2
//! ├── blobs
//! │   └── <algorithm>
//! │       └── <first two hex characters>
//! │           └── <full hex>
//! │               └── data
//! └── repositories
//!     └── <name>
//!         ├── _layers
//!         │   └── <algorithm>/<hex>/link
//!         ├── _manifests
//!         │   ├── revisions
//!         │   │   └── <algorithm>/<hex>
//!         │   │       ├── link
//!         │   │       └── signatures/<algorithm>/<hex>/link
//!         │   └── tags
//!         │       └── <tag>
//!         │           ├── current/link
//!         │           └── index/<algorithm>/<hex>/link
//!         └── _uploads
//!             └── <uuid>
//!                 ├── data
//!                 ├── startedat
//!                 └── hashstates/<algorithm>/<offset>
//! ```
//!
//! The content-addressable blob store holds all data; repositories reach it
//! through link files. This mapping is a compatibility surface with existing
//! deployments and must stay stable; the golden tests below pin it.

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest::{Algorithm, Digest};
use crate::reference::{RepositoryName, TagName};

/// Stable layout root, shared with prior deployments of this layout.
const ROOT: &str = "docker/registry/v2";

/// A semantic key into the backend keyspace.
#[derive(Debug, Clone, Copy)]
pub enum PathSpec<'a> {
    /// The root of the content-addressable blob store.
    BlobsRoot,

    /// The data file of a single blob.
    BlobData { digest: &'a Digest },

    /// The root of all repositories.
    RepositoriesRoot,

    /// The `_manifests` directory of a repository.
    Manifests { name: &'a RepositoryName },

    /// The manifest revisions directory of a repository.
    ManifestRevisions { name: &'a RepositoryName },

    /// The directory of one manifest revision.
    ManifestRevision {
        name: &'a RepositoryName,
        digest: &'a Digest,
    },

    /// The link of one manifest revision.
    ManifestRevisionLink {
        name: &'a RepositoryName,
        digest: &'a Digest,
    },

    /// The signatures directory of one manifest revision.
    ManifestSignatures {
        name: &'a RepositoryName,
        revision: &'a Digest,
    },

    /// The link of one detached signature of a manifest revision.
    ManifestSignatureLink {
        name: &'a RepositoryName,
        revision: &'a Digest,
        signature: &'a Digest,
    },

    /// The tags directory of a repository.
    ManifestTags { name: &'a RepositoryName },

    /// The directory of a single tag.
    ManifestTag {
        name: &'a RepositoryName,
        tag: &'a TagName,
    },

    /// The link holding a tag's current revision.
    ManifestTagCurrentLink {
        name: &'a RepositoryName,
        tag: &'a TagName,
    },

    /// The index directory recording every revision a tag has pointed to.
    ManifestTagIndex {
        name: &'a RepositoryName,
        tag: &'a TagName,
    },

    /// One entry in a tag's index.
    ManifestTagIndexEntryLink {
        name: &'a RepositoryName,
        tag: &'a TagName,
        digest: &'a Digest,
    },

    /// The layer links directory of a repository.
    Layers { name: &'a RepositoryName },

    /// The link of a single layer in a repository.
    LayerLink {
        name: &'a RepositoryName,
        digest: &'a Digest,
    },

    /// The uploads directory of a repository.
    Uploads { name: &'a RepositoryName },

    /// The directory of one upload session.
    Upload {
        name: &'a RepositoryName,
        id: &'a str,
    },

    /// The data file of one upload session.
    UploadData {
        name: &'a RepositoryName,
        id: &'a str,
    },

    /// The timestamp file recording when an upload session started.
    UploadStartedAt {
        name: &'a RepositoryName,
        id: &'a str,
    },

    /// The hash-state directory of one upload session.
    UploadHashStates {
        name: &'a RepositoryName,
        id: &'a str,
    },

    /// One persisted hash-state marker.
    UploadHashState {
        name: &'a RepositoryName,
        id: &'a str,
        algorithm: Algorithm,
        offset: u64,
    },

    /// The proxy scheduler's persisted entries.
    SchedulerState,
}

/// Translate a semantic key to its backend path. Deterministic and total.
pub fn path_for(spec: PathSpec<'_>) -> Utf8PathBuf {
    let mut path = Utf8PathBuf::from(ROOT);
    match spec {
        PathSpec::BlobsRoot => path.push("blobs"),
        PathSpec::BlobData { digest } => {
            path.push("blobs");
            path.push(digest.algorithm().as_str());
            path.push(&digest.hex()[..2]);
            path.push(digest.hex());
            path.push("data");
        }
        PathSpec::RepositoriesRoot => path.push("repositories"),
        PathSpec::Manifests { name } => {
            push_repository(&mut path, name);
            path.push("_manifests");
        }
        PathSpec::ManifestRevisions { name } => {
            push_repository(&mut path, name);
            path.push("_manifests/revisions");
        }
        PathSpec::ManifestRevision { name, digest } => {
            path = path_for(PathSpec::ManifestRevisions { name });
            push_digest(&mut path, digest);
        }
        PathSpec::ManifestRevisionLink { name, digest } => {
            path = path_for(PathSpec::ManifestRevision { name, digest });
            path.push("link");
        }
        PathSpec::ManifestSignatures { name, revision } => {
            path = path_for(PathSpec::ManifestRevision {
                name,
                digest: revision,
            });
            path.push("signatures");
        }
        PathSpec::ManifestSignatureLink {
            name,
            revision,
            signature,
        } => {
            path = path_for(PathSpec::ManifestSignatures { name, revision });
            push_digest(&mut path, signature);
            path.push("link");
        }
        PathSpec::ManifestTags { name } => {
            push_repository(&mut path, name);
            path.push("_manifests/tags");
        }
        PathSpec::ManifestTag { name, tag } => {
            path = path_for(PathSpec::ManifestTags { name });
            path.push(tag.as_str());
        }
        PathSpec::ManifestTagCurrentLink { name, tag } => {
            path = path_for(PathSpec::ManifestTag { name, tag });
            path.push("current/link");
        }
        PathSpec::ManifestTagIndex { name, tag } => {
            path = path_for(PathSpec::ManifestTag { name, tag });
            path.push("index");
        }
        PathSpec::ManifestTagIndexEntryLink { name, tag, digest } => {
            path = path_for(PathSpec::ManifestTagIndex { name, tag });
            push_digest(&mut path, digest);
            path.push("link");
        }
        PathSpec::Layers { name } => {
            push_repository(&mut path, name);
            path.push("_layers");
        }
        PathSpec::LayerLink { name, digest } => {
            path = path_for(PathSpec::Layers { name });
            push_digest(&mut path, digest);
            path.push("link");
        }
        PathSpec::Uploads { name } => {
            push_repository(&mut path, name);
            path.push("_uploads");
        }
        PathSpec::Upload { name, id } => {
            path = path_for(PathSpec::Uploads { name });
            path.push(id);
        }
        PathSpec::UploadData { name, id } => {
            path = path_for(PathSpec::Upload { name, id });
            path.push("data");
        }
        PathSpec::UploadStartedAt { name, id } => {
            path = path_for(PathSpec::Upload { name, id });
            path.push("startedat");
        }
        PathSpec::UploadHashStates { name, id } => {
            path = path_for(PathSpec::Upload { name, id });
            path.push("hashstates");
        }
        PathSpec::UploadHashState {
            name,
            id,
            algorithm,
            offset,
        } => {
            path = path_for(PathSpec::UploadHashStates { name, id });
            path.push(algorithm.as_str());
            path.push(offset.to_string());
        }
        PathSpec::SchedulerState => path.push("scheduler-state.json"),
    }
    path
}

fn push_repository(path: &mut Utf8PathBuf, name: &RepositoryName) {
    path.push("repositories");
    path.push(name.as_str());
}

/// Digest path components split the algorithm from the hex so backend
/// directory fanout stays bounded.
fn push_digest(path: &mut Utf8PathBuf, digest: &Digest) {
    path.push(digest.algorithm().as_str());
    path.push(digest.hex());
}

/// Recover a digest from a link path of the form `…/<algorithm>/<hex>/link`.
///
/// Foreign files in link directories yield `None` and are skipped by
/// enumeration.
pub fn digest_from_link_path(path: &Utf8Path) -> Option<Digest> {
    if path.file_name() != Some("link") {
        return None;
    }
    let hex = path.parent()?.file_name()?;
    let algorithm: Algorithm = path.parent()?.parent()?.file_name()?.parse().ok()?;
    Digest::new(algorithm, hex).ok()
}

/// Recover a digest from a blob data path of the form
/// `blobs/<algorithm>/<xx>/<hex>/data`.
pub fn digest_from_blob_data_path(path: &Utf8Path) -> Option<Digest> {
    if path.file_name() != Some("data") {
        return None;
    }
    let hex = path.parent()?.file_name()?;
    let algorithm: Algorithm = path
        .parent()?
        .parent()? // <xx>
        .parent()?
        .file_name()?
        .parse()
        .ok()?;
    Digest::new(algorithm, hex).ok()
}
