//! LRU cache of leaf records by path.

use crate::record::LeafRecord;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Bounded cache of flushed leaf records. A capacity of zero disables it.
pub struct LeafCache {
    inner: Option<Mutex<LruCache<u64, LeafRecord>>>,
}

impl LeafCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|c| Mutex::new(LruCache::new(c))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self, path: u64) -> Option<LeafRecord> {
        self.inner.as_ref()?.lock().get(&path).cloned()
    }

    pub fn put(&self, path: u64, record: LeafRecord) {
        if let Some(inner) = &self.inner {
            inner.lock().put(path, record);
        }
    }

    pub fn remove(&self, path: u64) {
        if let Some(inner) = &self.inner {
            inner.lock().pop(&path);
        }
    }

    /// Drops every cached path at or above `from`.
    pub fn retain_below(&self, from: u64) {
        if let Some(inner) = &self.inner {
            let mut cache = inner.lock();
            let stale: Vec<u64> = cache.iter().map(|(p, _)| *p).filter(|p| *p >= from).collect();
            for path in stale {
                cache.pop(&path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |c| c.lock().len())
    }
}
