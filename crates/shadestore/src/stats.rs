//! Engine statistics tracking

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by commits, rollbacks and the memory pool
#[derive(Debug, Default)]
pub(crate) struct EngineStats {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    pages_written: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
}

impl EngineStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record a commit that wrote `pages` pages
    pub(crate) fn record_commit(&self, pages: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.pages_written.fetch_add(pages, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer served from the pool
    pub(crate) fn record_pool_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer that had to be allocated
    pub(crate) fn record_pool_miss(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub(crate) fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub(crate) fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    pub(crate) fn pool_hits(&self) -> u64 {
        self.pool_hits.load(Ordering::Relaxed)
    }

    pub(crate) fn pool_misses(&self) -> u64 {
        self.pool_misses.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a database, returned by [`ShadeStore::stats`](crate::ShadeStore::stats)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Page size of the file
    pub page_size: u32,
    /// Pages in use, meta slots included
    pub page_count: u32,
    /// Generation of the last commit
    pub generation: u64,
    /// Pages waiting for reuse, including those still visible to readers
    pub free_pages: u64,
    /// Pages holding the persisted free list
    pub freelist_pages: u64,
    /// Live read transactions and cursors
    pub active_readers: u64,
    /// Write transactions committed since open
    pub commits: u64,
    /// Write transactions rolled back since open
    pub rollbacks: u64,
    /// Pages written by commits since open
    pub pages_written: u64,
    /// Staging buffers served from the memory pool
    pub pool_hits: u64,
    /// Staging buffers freshly allocated
    pub pool_misses: u64,
}

impl Stats {
    /// Share of staging buffers served from the pool (0.0 to 1.0)
    pub fn pool_hit_ratio(&self) -> f64 {
        let total = self.pool_hits + self.pool_misses;
        if total == 0 {
            0.0
        } else {
            self.pool_hits as f64 / total as f64
        }
    }
}
