//! Purging of abandoned upload sessions.
//!
//! Upload data lives outside the content-addressed namespace, so the
//! garbage collector never sees it; this pass reclaims sessions whose
//! `startedat` marker has aged past the configured limit.

use chrono::{DateTime, Utc};
use storage_driver::WalkControl;

use crate::config::UploadPurgeConfig;
use crate::error::Result;
use crate::paths::{path_for, PathSpec};
use crate::Registry;

/// What one purge pass found and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub inspected: usize,
    pub purged: usize,
}

/// Delete every upload session older than `config.age`.
///
/// A session without a readable `startedat` marker is treated as abandoned:
/// its age cannot be established and it will never commit.
#[tracing::instrument(skip(registry, config), fields(age = ?config.age, dry_run = config.dry_run))]
pub async fn purge_uploads(registry: &Registry, config: &UploadPurgeConfig) -> Result<PurgeSummary> {
    let driver = &registry.shared().driver;
    let root = path_for(PathSpec::RepositoriesRoot);

    // Collect `_uploads/<uuid>` session directories across all repositories.
    let mut sessions = Vec::new();
    let walked = driver
        .walk(&root, &mut |info| {
            if !info.is_dir {
                return WalkControl::Continue;
            }
            match info.path.parent().and_then(|parent| parent.file_name()) {
                Some("_uploads") => {
                    sessions.push(info.path.clone());
                    WalkControl::SkipDir
                }
                _ => {
                    // Do not descend into the other stores.
                    match info.path.file_name() {
                        Some("_layers") | Some("_manifests") => WalkControl::SkipDir,
                        _ => WalkControl::Continue,
                    }
                }
            }
        })
        .await;
    match walked {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Ok(PurgeSummary::default()),
        Err(err) => return Err(err.into()),
    }

    let mut summary = PurgeSummary {
        inspected: sessions.len(),
        ..Default::default()
    };
    let cutoff = chrono::Duration::from_std(config.age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age));

    for session in sessions {
        let started_at = read_started_at(registry, &session).await;
        let expired = match (started_at, cutoff) {
            // Unreadable marker: the session can never commit.
            (None, _) => true,
            (Some(started), Some(cutoff)) => started < cutoff,
            (Some(_), None) => false,
        };
        if !expired {
            continue;
        }

        summary.purged += 1;
        if config.dry_run {
            tracing::info!(path = %session, "dry run: would purge upload session");
            continue;
        }
        tracing::info!(path = %session, "purging abandoned upload session");
        match driver.delete(&session).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(summary)
}

async fn read_started_at(
    registry: &Registry,
    session: &camino::Utf8Path,
) -> Option<DateTime<Utc>> {
    let path = session.join("startedat");
    let raw = registry.shared().driver.get_content(&path).await.ok()?;
    let text = std::str::from_utf8(&raw).ok()?;
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Run the purge pass forever at the configured interval.
///
/// Spawned by the embedding process when `upload_purging.enabled` is set;
/// errors are logged, never fatal to the loop.
pub fn start_upload_purger(registry: Registry) -> tokio::task::JoinHandle<()> {
    let config = registry.shared().config.upload_purging.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match purge_uploads(&registry, &config).await {
                Ok(summary) if summary.purged > 0 => {
                    tracing::info!(purged = summary.purged, "upload purge pass complete");
                }
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, "upload purge pass failed"),
            }
        }
    })
}
