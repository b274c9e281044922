//! Mark-and-sweep over the link graph.
//!
//! Roots are tag currents. The mark pass resolves manifests iteratively —
//! lists and indexes enqueue their members, an explicit work list bounds the
//! traversal — and the sweep deletes blobs no root reaches. A grace window
//! protects blobs written after the mark snapshot began: on an eventually
//! consistent backend the window must exceed both the longest upload and the
//! backend's inconsistency horizon.

use std::collections::HashSet;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Utc;
use storage_driver::WalkControl;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::paths::{digest_from_blob_data_path, digest_from_link_path, path_for, PathSpec};
use crate::reference::RepositoryName;
use crate::Registry;

/// Settings for one garbage collection run.
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Log what would be deleted without deleting.
    pub dry_run: bool,

    /// Blobs modified within this window survive the sweep even when
    /// unreferenced.
    pub grace_window: Duration,

    /// Also delete repository links that point outside the live set.
    pub remove_orphan_links: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            grace_window: Duration::from_secs(60 * 60),
            remove_orphan_links: false,
        }
    }
}

/// What one run marked and swept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub repositories: usize,
    pub manifests_marked: usize,
    pub blobs_marked: usize,
    pub blobs_swept: usize,
    pub blobs_skipped_by_grace: usize,
    pub orphan_links_removed: usize,
}

/// Run a single mark-and-sweep pass. Runs must not overlap.
#[tracing::instrument(skip(registry))]
pub async fn mark_and_sweep(registry: &Registry, options: GcOptions) -> Result<GcSummary> {
    let mut summary = GcSummary::default();

    let repositories = discover_repositories(registry).await?;
    summary.repositories = repositories.len();

    let live = mark(registry, &repositories, &mut summary).await?;
    sweep(registry, &live, &options, &mut summary).await?;

    if options.remove_orphan_links {
        remove_orphan_links(registry, &repositories, &live, &options, &mut summary).await?;
    }

    tracing::info!(
        repositories = summary.repositories,
        manifests = summary.manifests_marked,
        blobs_marked = summary.blobs_marked,
        blobs_swept = summary.blobs_swept,
        skipped_by_grace = summary.blobs_skipped_by_grace,
        dry_run = options.dry_run,
        "garbage collection complete"
    );
    Ok(summary)
}

/// Every repository name under the repositories root, found by walking down
/// to the first store marker directory (`_manifests`, `_layers`,
/// `_uploads`).
async fn discover_repositories(registry: &Registry) -> Result<Vec<RepositoryName>> {
    let root = path_for(PathSpec::RepositoriesRoot);
    let mut found = Vec::new();

    let walked = registry
        .shared()
        .driver
        .walk(&root, &mut |info| {
            if !info.is_dir {
                return WalkControl::Continue;
            }
            match info.path.file_name() {
                Some("_manifests") | Some("_layers") | Some("_uploads") => {
                    if let Some(repo_dir) = info.path.parent() {
                        if let Ok(relative) = repo_dir.strip_prefix(&root) {
                            if let Ok(name) = RepositoryName::new(relative.as_str()) {
                                found.push(name);
                            }
                        }
                    }
                    WalkControl::SkipDir
                }
                _ => WalkControl::Continue,
            }
        })
        .await;
    match walked {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    }

    found.sort();
    found.dedup();
    Ok(found)
}

/// Compute the live set: every digest reachable from some tag current.
async fn mark(
    registry: &Registry,
    repositories: &[RepositoryName],
    summary: &mut GcSummary,
) -> Result<HashSet<Digest>> {
    let mut live: HashSet<Digest> = HashSet::new();
    let mut resolved: HashSet<(RepositoryName, Digest)> = HashSet::new();

    for name in repositories {
        let repo = registry.repository(name.clone());

        let tags = match repo.tags().all().await {
            Ok(tags) => tags,
            Err(Error::RepositoryUnknown { .. }) => continue,
            Err(err) => return Err(err),
        };

        // Tag currents are the roots.
        let mut work: Vec<Digest> = Vec::new();
        for tag in tags {
            match repo.tags().get(&tag).await {
                Ok(current) => work.push(current.digest),
                Err(Error::TagUnknown { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        // Iterative resolution: indexes push their members back onto the
        // work list instead of recursing.
        while let Some(digest) = work.pop() {
            if !resolved.insert((name.clone(), digest.clone())) {
                continue;
            }

            let manifest = match repo.manifests().get(&digest).await {
                Ok(manifest) => manifest,
                Err(err) if err.is_not_found() => {
                    tracing::warn!(repository = %name, %digest, "dangling manifest reference during mark");
                    continue;
                }
                Err(err) => return Err(err),
            };

            live.insert(digest);
            summary.manifests_marked += 1;

            for reference in manifest.references() {
                if manifest.is_index() {
                    work.push(reference.digest);
                } else {
                    live.insert(reference.digest);
                }
            }
        }
    }

    summary.blobs_marked = live.len();
    Ok(live)
}

/// Delete every blob outside the live set, honoring the grace window.
async fn sweep(
    registry: &Registry,
    live: &HashSet<Digest>,
    options: &GcOptions,
    summary: &mut GcSummary,
) -> Result<()> {
    let driver = &registry.shared().driver;
    let root = path_for(PathSpec::BlobsRoot);

    let mut candidates: Vec<(Utf8PathBuf, Digest)> = Vec::new();
    let walked = driver
        .walk(&root, &mut |info| {
            if !info.is_dir {
                if let Some(digest) = digest_from_blob_data_path(&info.path) {
                    if !live.contains(&digest) {
                        candidates.push((info.path.clone(), digest));
                    }
                }
            }
            WalkControl::Continue
        })
        .await;
    match walked {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err.into()),
    }

    // A window too large to represent protects everything.
    let cutoff = chrono::Duration::from_std(options.grace_window)
        .ok()
        .and_then(|grace| Utc::now().checked_sub_signed(grace));

    for (data_path, digest) in candidates {
        // Re-stat at the decision point: the walk snapshot may predate a
        // fresh write of this blob.
        let info = match driver.stat(&data_path).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err.into()),
        };
        let within_grace = match cutoff {
            Some(cutoff) => info.mod_time > cutoff,
            None => true,
        };
        if within_grace {
            summary.blobs_skipped_by_grace += 1;
            continue;
        }

        summary.blobs_swept += 1;
        if options.dry_run {
            tracing::info!(%digest, "dry run: would delete blob");
            continue;
        }

        tracing::info!(%digest, "deleting unreferenced blob");
        registry.blobs().delete_unchecked(&digest).await?;
    }
    Ok(())
}

/// Remove repository links whose target is no longer live.
async fn remove_orphan_links(
    registry: &Registry,
    repositories: &[RepositoryName],
    live: &HashSet<Digest>,
    options: &GcOptions,
    summary: &mut GcSummary,
) -> Result<()> {
    let driver = &registry.shared().driver;

    for name in repositories {
        let dirs = [
            path_for(PathSpec::Layers { name }),
            path_for(PathSpec::ManifestRevisions { name }),
        ];
        for dir in dirs {
            let mut orphans: Vec<Utf8PathBuf> = Vec::new();
            let walked = driver
                .walk(&dir, &mut |info| {
                    // Signature links live under a revision and share its
                    // fate, not their own digest's.
                    if info.is_dir && info.path.file_name() == Some("signatures") {
                        return WalkControl::SkipDir;
                    }
                    if !info.is_dir {
                        if let Some(digest) = digest_from_link_path(&info.path) {
                            if !live.contains(&digest) {
                                if let Some(parent) = info.path.parent() {
                                    orphans.push(parent.to_owned());
                                }
                            }
                        }
                    }
                    WalkControl::Continue
                })
                .await;
            match walked {
                Ok(()) => {}
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into()),
            }

            for orphan in orphans {
                summary.orphan_links_removed += 1;
                if options.dry_run {
                    tracing::info!(repository = %name, path = %orphan, "dry run: would delete orphan link");
                    continue;
                }
                match driver.delete(&orphan).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}
