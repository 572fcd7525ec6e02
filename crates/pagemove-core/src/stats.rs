//! Aggregate migration counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of the migration counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Pages migrated successfully
    pub succeeded: u64,
    /// Pages that failed permanently
    pub failed: u64,
    /// Individual retry outcomes
    pub retried: u64,
    /// Batches driven to completion or abort
    pub batches: u64,
    /// Pages moved by the locality path
    pub numa_migrated: u64,
}

/// Live counters shared by every migration driven through one migrator
#[derive(Debug, Default)]
pub struct MigrationStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    batches: AtomicU64,
    numa_migrated: AtomicU64,
}

impl MigrationStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_succeeded(&self, pages: u64) {
        if pages > 0 {
            self.succeeded.fetch_add(pages, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn add_failed(&self, pages: u64) {
        if pages > 0 {
            self.failed.fetch_add(pages, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn add_retried(&self, pages: u64) {
        self.retried.fetch_add(pages, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_numa_migrated(&self, pages: u64) {
        self.numa_migrated.fetch_add(pages, Ordering::Relaxed);
    }

    /// Take a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            numa_migrated: self.numa_migrated.load(Ordering::Relaxed),
        }
    }
}
