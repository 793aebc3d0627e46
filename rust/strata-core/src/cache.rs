// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Cache of file byte ranges shared by concurrent scans

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use moka::sync::Cache;
use object_store::path::Path;

type CacheKey = (Path, u64, u64);

#[derive(Debug)]
struct CacheEntry {
    data: Bytes,
    uses: AtomicU64,
}

/// Whether a read should leave a trace in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Misses are inserted and hits bump the entry's use count
    #[default]
    Retain,
    /// Hits are served but not counted, misses are not inserted
    DoNotRetain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Cache for byte ranges of data files.
///
/// Entries are keyed by the file path and the exact byte range that was
/// requested. Every entry tracks how often it was used so that eviction
/// policies (and tests) can tell which data a scan touched.
#[derive(Clone, Debug)]
pub struct ScanCache {
    cache: Option<Arc<Cache<CacheKey, Arc<CacheEntry>>>>,
    counters: Arc<Counters>,
}

impl ScanCache {
    /// Instantiates a new cache holding at most `capacity_bytes` bytes
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self {
            cache: Some(Arc::new(
                Cache::builder()
                    .max_capacity(capacity_bytes)
                    .weigher(|_, v: &Arc<CacheEntry>| {
                        v.data.len().try_into().unwrap_or(u32::MAX)
                    })
                    .build(),
            )),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Instantiates a dummy cache that will never cache anything.
    pub fn no_cache() -> Self {
        Self {
            cache: None,
            counters: Arc::new(Counters::default()),
        }
    }

    fn key(path: &Path, range: &Range<u64>) -> CacheKey {
        (path.clone(), range.start, range.end)
    }

    /// Fetch a range from the cache
    pub fn get(&self, path: &Path, range: &Range<u64>, retention: Retention) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        match cache.get(&Self::key(path, range)) {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                if retention == Retention::Retain {
                    entry.uses.fetch_add(1, Ordering::Relaxed);
                }
                Some(entry.data.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a range into the cache
    pub fn insert(&self, path: &Path, range: &Range<u64>, data: Bytes, retention: Retention) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        if retention == Retention::DoNotRetain {
            return;
        }
        cache.insert(
            Self::key(path, range),
            Arc::new(CacheEntry {
                data,
                uses: AtomicU64::new(1),
            }),
        );
    }

    /// Number of times the entry was used, `None` if it is not cached
    pub fn use_count(&self, path: &Path, range: &Range<u64>) -> Option<u64> {
        let cache = self.cache.as_ref()?;
        cache
            .get(&Self::key(path, range))
            .map(|entry| entry.uses.load(Ordering::Relaxed))
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes) = if let Some(cache) = self.cache.as_ref() {
            cache.run_pending_tasks();
            (cache.entry_count(), cache.weighted_size())
        } else {
            (0, 0)
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            entries,
            bytes,
        }
    }
}
