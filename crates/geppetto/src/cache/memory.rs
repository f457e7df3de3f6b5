//! In-process LRU cache.

use std::num::NonZeroUsize;
use std::sync::{PoisonError, RwLock};

use lru::LruCache;

use super::{CacheEntry, InferenceCache};
use crate::error::GeppettoError;

pub(crate) const DEFAULT_MAX_ENTRIES: usize = 1000;

/// An LRU cache bounded by entry count.
///
/// Lookups promote the entry, so they take the write lock like
/// insertions; [`contains`](Self::contains) and [`len`](Self::len) only
/// read.
pub struct MemoryCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries())
            .finish()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryCache {
    /// A cache holding at most `max_entries` (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(cap)),
        }
    }

    /// Whether `key` is cached, without promoting it.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry bound.
    pub fn max_entries(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cap()
            .get()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl InferenceCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, GeppettoError> {
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), GeppettoError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .put(key.to_string(), entry.clone());
        Ok(())
    }
}
