//! Reverse-lookup cache owned by a geocoder.
//!
//! Context assembly asks every index "which feature covers this tile?" over and
//! over while verifying candidates. Answers are memoized per (index, index
//! generation, tile); an update bumps the generation so stale answers are never
//! served, and [`TileCache::reset`] drops everything explicitly.

use crate::search::grid::Tile;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Default number of tile answers kept.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Cache key: index position, index generation and the looked-up tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub index: usize,
    pub generation: u64,
    pub tile: Tile,
}

/// Hit/miss counters since construction or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU of tile lookups.
pub struct TileCache<V> {
    entries: Mutex<LruCache<TileKey, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TileCache<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &TileKey) -> Option<V> {
        let found = self.entries.lock().await.get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(index = key.index, tile = %key.tile, "tile cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub async fn insert(&self, key: TileKey, value: V) {
        self.entries.lock().await.put(key, value);
    }

    /// Drops every entry and zeroes the counters.
    pub async fn reset(&self) {
        self.entries.lock().await.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        tracing::debug!("tile cache reset");
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }
}

impl<V: Clone> Default for TileCache<V> {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl<V> std::fmt::Debug for TileCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
