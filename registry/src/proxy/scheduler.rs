//! TTL eviction scheduling for proxied content.
//!
//! One min-heap keyed by expiry, one worker. Entries survive restarts
//! through a JSON state file written on every change; failing to persist is
//! logged and never blocks the in-memory update.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use storage_driver::Driver;
use tokio::sync::Notify;

use crate::digest::Digest;
use crate::paths::{path_for, PathSpec};
use crate::reference::RepositoryName;

/// What kind of content an entry evicts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum EntryKind {
    Blob,
    Manifest,
}

/// One pending eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerEntry {
    pub kind: EntryKind,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

/// Invoked by the scheduler worker when an entry expires.
///
/// Runs on the worker task, outside the scheduler lock; implementations
/// must not block the worker indefinitely.
#[async_trait::async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn expire(&self, kind: EntryKind, key: &str);
}

struct State {
    /// The authoritative expiry per key.
    entries: HashMap<(EntryKind, String), DateTime<Utc>>,

    /// Expiry order, with lazy deletion: a popped item counts only when it
    /// still matches `entries`.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, EntryKind, String)>>,
}

impl State {
    fn snapshot(&self) -> Vec<SchedulerEntry> {
        let mut entries: Vec<SchedulerEntry> = self
            .entries
            .iter()
            .map(|((kind, key), expires_at)| SchedulerEntry {
                kind: *kind,
                key: key.clone(),
                expires_at: *expires_at,
            })
            .collect();
        entries.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        entries
    }

    /// The earliest still-valid entry, discarding stale heap items.
    fn peek(&mut self) -> Option<(DateTime<Utc>, EntryKind, String)> {
        while let Some(Reverse((when, kind, key))) = self.heap.peek().cloned() {
            if self.entries.get(&(kind, key.clone())) == Some(&when) {
                return Some((when, kind, key));
            }
            self.heap.pop();
        }
        None
    }
}

/// Schedules TTL-based eviction of proxied blobs and manifests.
pub struct Scheduler {
    driver: Arc<dyn Driver>,
    state: Mutex<State>,
    wakeup: Notify,
    /// Serializes state-file writes.
    persist_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.state.lock().entries.len())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler, reinstating any pending evictions persisted by a
    /// previous process.
    pub async fn restore(driver: Arc<dyn Driver>) -> Arc<Self> {
        let mut state = State {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
        };

        let path = path_for(PathSpec::SchedulerState);
        match driver.get_content(&path).await {
            Ok(raw) => match serde_json::from_slice::<Vec<SchedulerEntry>>(&raw) {
                Ok(entries) => {
                    tracing::debug!(count = entries.len(), "restored scheduler state");
                    for entry in entries {
                        state
                            .heap
                            .push(Reverse((entry.expires_at, entry.kind, entry.key.clone())));
                        state.entries.insert((entry.kind, entry.key), entry.expires_at);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "scheduler state file is malformed, starting empty")
                }
            },
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                tracing::warn!(error = %err, "scheduler state unreadable, starting empty")
            }
        }

        Arc::new(Self {
            driver,
            state: Mutex::new(state),
            wakeup: Notify::new(),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Schedule (or extend) eviction of a blob.
    pub async fn add_blob(&self, digest: &Digest, ttl: Duration) {
        self.add(EntryKind::Blob, digest.to_string(), ttl).await;
    }

    /// Schedule (or extend) eviction of a repository's manifests.
    pub async fn add_manifest(&self, repository: &RepositoryName, ttl: Duration) {
        self.add(EntryKind::Manifest, repository.to_string(), ttl)
            .await;
    }

    /// Idempotent add: re-adding extends the expiry to
    /// `max(existing, now + ttl)`.
    async fn add(&self, kind: EntryKind, key: String, ttl: Duration) {
        let proposed = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));

        {
            let mut state = self.state.lock();
            let slot = state.entries.entry((kind, key.clone())).or_insert(proposed);
            let effective = (*slot).max(proposed);
            *slot = effective;
            state.heap.push(Reverse((effective, kind, key)));
        }
        self.wakeup.notify_one();
        self.persist().await;
    }

    /// Whether an entry is pending for this key.
    pub fn contains(&self, kind: EntryKind, key: &str) -> bool {
        self.state
            .lock()
            .entries
            .contains_key(&(kind, key.to_string()))
    }

    /// A sorted snapshot of the pending entries.
    pub fn entries(&self) -> Vec<SchedulerEntry> {
        self.state.lock().snapshot()
    }

    /// Write the current entries to the state file.
    async fn persist(&self) {
        let snapshot = self.state.lock().snapshot();
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "scheduler state does not serialize");
                return;
            }
        };

        let _guard = self.persist_lock.lock().await;
        let path = path_for(PathSpec::SchedulerState);
        if let Err(err) = self.driver.put_content(&path, &payload).await {
            tracing::error!(error = %err, "failed to persist scheduler state");
        }
    }

    /// Run the eviction worker until aborted.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn ExpiryHandler>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let next = scheduler.state.lock().peek();
                match next {
                    None => scheduler.wakeup.notified().await,
                    Some((when, kind, key)) => {
                        let now = Utc::now();
                        if when <= now {
                            {
                                let mut state = scheduler.state.lock();
                                // Re-check under the lock: an add may have
                                // extended this entry meanwhile.
                                if state.entries.get(&(kind, key.clone())) != Some(&when) {
                                    continue;
                                }
                                // The heap item turns stale here and is
                                // discarded by the next peek.
                                state.entries.remove(&(kind, key.clone()));
                            }
                            tracing::debug!(?kind, %key, "scheduler entry expired");
                            let callback =
                                std::panic::AssertUnwindSafe(handler.expire(kind, &key));
                            if callback.catch_unwind().await.is_err() {
                                tracing::error!(?kind, %key, "expiry handler panicked");
                            }
                            scheduler.persist().await;
                        } else {
                            let wait = (when - now)
                                .to_std()
                                .unwrap_or(Duration::from_millis(10));
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = scheduler.wakeup.notified() => {}
                            }
                        }
                    }
                }
            }
        })
    }
}
