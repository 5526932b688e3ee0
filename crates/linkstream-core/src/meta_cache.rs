//! File metadata cache
//!
//! LRU-bounded, TTL-expiring map from `FileRef` to `FileMeta`. Concurrent
//! misses for the same file are coalesced into one upstream call.

use crate::Result;
use linkstream_upstream::{FileMeta, FileRef};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Cache counters for status reporting
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct MetadataCache {
    entries: Mutex<LruCache<FileRef, (FileMeta, Instant)>>,
    inflight: Mutex<HashMap<FileRef, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataCache {
    /// Create a cache holding at most `capacity` entries for `ttl` each
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh entry for `file`; an expired entry is evicted
    pub fn get(&self, file: &FileRef) -> Option<FileMeta> {
        let fresh = self.peek_fresh(file, true);
        if fresh.is_none() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    pub fn insert(&self, meta: FileMeta) {
        let mut entries = self.entries.lock();
        entries.put(meta.file_ref.clone(), (meta, Instant::now()));
    }

    /// Remove `file`; returns whether it was cached
    pub fn invalidate(&self, file: &FileRef) -> bool {
        let removed = self.entries.lock().pop(file).is_some();
        if removed {
            debug!(file = %file, "metadata invalidated");
        }
        removed
    }

    /// Cached metadata, or the result of `fetch` which is then cached.
    ///
    /// Only one `fetch` runs per file at a time; other callers wait for it and
    /// read the fresh entry. Errors are not cached.
    pub async fn get_or_fetch<F, Fut>(&self, file: &FileRef, fetch: F) -> Result<FileMeta>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FileMeta>>,
    {
        if let Some(meta) = self.peek_fresh(file, true) {
            return Ok(meta);
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(inflight.entry(file.clone()).or_default())
        };

        let outcome = {
            let _turn = gate.lock().await;
            match self.peek_fresh(file, false) {
                Some(meta) => Ok(meta),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(file = %file, "metadata miss, fetching upstream");
                    fetch().await.map(|meta| {
                        self.insert(meta.clone());
                        meta
                    })
                }
            }
        };

        let mut inflight = self.inflight.lock();
        // the map holds one reference and we hold another
        if Arc::strong_count(&gate) <= 2 {
            inflight.remove(file);
        }
        outcome
    }

    /// Like `get` but only counts a hit; misses are counted by the caller
    fn peek_fresh(&self, file: &FileRef, count_hit: bool) -> Option<FileMeta> {
        let mut entries = self.entries.lock();
        let fresh = match entries.get(file) {
            Some((meta, inserted)) if inserted.elapsed() < self.ttl => Some(meta.clone()),
            Some(_) => {
                entries.pop(file);
                trace!(file = %file, "metadata expired");
                None
            }
            None => None,
        };
        if fresh.is_some() && count_hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
