//! Memoization of blob descriptor lookups.
//!
//! The cache is never the source of truth: a miss falls back to the backend,
//! and entries are written through only on successful stats and puts.
//! Invalidation happens on delete alone.

use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::reference::RepositoryName;

/// The scope a descriptor lookup is cached under.
///
/// Repository-scoped entries answer linked-store stats, where the answer
/// depends on the repository's links; global entries answer global stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Global,
    Repository(&'a RepositoryName),
}

/// A provider of memoized `(digest → descriptor)` lookups.
///
/// Implementations must preserve exact descriptor equality, media type
/// included. The in-tree provider is [`InMemoryDescriptorCache`]; external
/// providers (a Redis-backed cache, say) implement this trait and are
/// injected at registry construction.
#[async_trait::async_trait]
pub trait DescriptorCache: Send + Sync + fmt::Debug {
    async fn get(&self, scope: Scope<'_>, digest: &Digest) -> Option<Descriptor>;

    async fn set(&self, scope: Scope<'_>, descriptor: Descriptor);

    async fn invalidate(&self, scope: Scope<'_>, digest: &Digest);
}

/// Bounded in-process cache: one LRU for the global scope, one shared LRU
/// keyed by `(repository, digest)` for repository scopes.
pub struct InMemoryDescriptorCache {
    global: Mutex<LruCache<Digest, Descriptor>>,
    scoped: Mutex<LruCache<(RepositoryName, Digest), Descriptor>>,
}

impl fmt::Debug for InMemoryDescriptorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDescriptorCache").finish()
    }
}

impl InMemoryDescriptorCache {
    /// Create a cache bounded to `capacity` entries per scope kind.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            global: Mutex::new(LruCache::new(capacity)),
            scoped: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait::async_trait]
impl DescriptorCache for InMemoryDescriptorCache {
    async fn get(&self, scope: Scope<'_>, digest: &Digest) -> Option<Descriptor> {
        match scope {
            Scope::Global => self.global.lock().get(digest).cloned(),
            Scope::Repository(name) => self
                .scoped
                .lock()
                .get(&(name.clone(), digest.clone()))
                .cloned(),
        }
    }

    async fn set(&self, scope: Scope<'_>, descriptor: Descriptor) {
        match scope {
            Scope::Global => {
                self.global
                    .lock()
                    .put(descriptor.digest.clone(), descriptor);
            }
            Scope::Repository(name) => {
                self.scoped
                    .lock()
                    .put((name.clone(), descriptor.digest.clone()), descriptor);
            }
        }
    }

    async fn invalidate(&self, scope: Scope<'_>, digest: &Digest) {
        match scope {
            Scope::Global => {
                self.global.lock().pop(digest);
            }
            Scope::Repository(name) => {
                self.scoped.lock().pop(&(name.clone(), digest.clone()));
            }
        }
    }
}
