//! Memory partitions (residency domains)
//!
//! A partition owns its zones, its page-state counters and the locality
//! migration window. The window lives behind the partition's own lock and is
//! reset whenever the configured interval elapses.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::LocalityConfig;
use crate::page::{FrameId, PartitionId};

/// Per-partition page-state counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStat {
    /// Cache-indexed pages (file, shmem and swap cache)
    FilePages,
    /// Shared-memory pages
    Shmem,
    /// Mapped anonymous pages
    AnonPages,
    /// Mapped file pages
    FileMapped,
    /// Anonymous pages isolated from reclaim
    IsolatedAnon,
    /// File pages isolated from reclaim
    IsolatedFile,
    /// Pages pinned in physical memory
    Mlocked,
}

impl PartitionStat {
    const COUNT: usize = 7;

    #[inline]
    fn slot(self) -> usize {
        self as usize
    }

    /// Isolation counter matching a frame's backing type
    #[inline]
    pub fn isolated(file_cache: bool) -> Self {
        if file_cache {
            PartitionStat::IsolatedFile
        } else {
            PartitionStat::IsolatedAnon
        }
    }
}

/// A zone: a run of frames with its own free list and watermark
#[derive(Debug)]
pub struct Zone {
    free_list: Mutex<Vec<FrameId>>,
    free_pages: AtomicU64,
    present_pages: u64,
    high_watermark: u64,
    reclaimable: bool,
}

impl Zone {
    pub(crate) fn new(
        frames: Vec<FrameId>,
        present_pages: u64,
        high_watermark: u64,
        reclaimable: bool,
    ) -> Self {
        Self {
            free_list: Mutex::new(frames),
            free_pages: AtomicU64::new(present_pages),
            present_pages,
            high_watermark,
            reclaimable,
        }
    }

    /// Whether the zone has any memory
    #[inline]
    pub fn is_populated(&self) -> bool {
        self.present_pages > 0
    }

    /// Whether reclaim can make progress in this zone
    #[inline]
    pub fn is_reclaimable(&self) -> bool {
        self.reclaimable
    }

    /// Free base pages
    #[inline]
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    /// High watermark in base pages
    #[inline]
    pub fn high_watermark(&self) -> u64 {
        self.high_watermark
    }

    /// Whether free pages stay above `mark`
    #[inline]
    pub fn watermark_ok(&self, mark: u64) -> bool {
        self.free_pages() > mark
    }

    pub(crate) fn take(&self, pages: u64) -> Option<FrameId> {
        let mut free = self.free_list.lock();
        if self.free_pages() < pages {
            return None;
        }
        let id = free.pop()?;
        self.free_pages.fetch_sub(pages, Ordering::Relaxed);
        Some(id)
    }

    pub(crate) fn give(&self, id: FrameId, pages: u64) {
        let mut free = self.free_list.lock();
        free.push(id);
        self.free_pages.fetch_add(pages, Ordering::Relaxed);
    }
}

/// Rate-limit window for locality-driven migration into one partition
#[derive(Debug, Clone, Copy)]
pub struct PartitionMigrationState {
    /// Start of the current window
    pub window_start: Instant,
    /// Pages admitted in the current window
    pub pages_this_window: u64,
}

impl PartitionMigrationState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            pages_this_window: 0,
        }
    }
}

/// A memory partition
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    zones: Vec<Zone>,
    stats: [AtomicI64; PartitionStat::COUNT],
    migration: Mutex<PartitionMigrationState>,
}

impl Partition {
    pub(crate) fn new(id: PartitionId, zones: Vec<Zone>) -> Self {
        Self {
            id,
            zones,
            stats: Default::default(),
            migration: Mutex::new(PartitionMigrationState::new(Instant::now())),
        }
    }

    /// Partition identifier
    #[inline]
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Zones of this partition
    #[inline]
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Whether any zone of the partition has memory
    pub fn has_memory(&self) -> bool {
        self.zones.iter().any(Zone::is_populated)
    }

    /// Total free base pages
    pub fn free_pages(&self) -> u64 {
        self.zones.iter().map(Zone::free_pages).sum()
    }

    /// Adjust a page-state counter
    #[inline]
    pub fn mod_stat(&self, stat: PartitionStat, delta: i64) {
        self.stats[stat.slot()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a page-state counter
    #[inline]
    pub fn stat(&self, stat: PartitionStat) -> i64 {
        self.stats[stat.slot()].load(Ordering::Relaxed)
    }

    /// Snapshot of the migration window
    pub fn migration_state(&self) -> PartitionMigrationState {
        *self.migration.lock()
    }

    /// Charge `nr_pages` against the current window.
    ///
    /// Returns true when the migration must be skipped because the window's
    /// budget would be exceeded. Admitted pages never push the window past
    /// `ratelimit_pages`.
    pub fn update_ratelimit(&self, nr_pages: u64, now: Instant, cfg: &LocalityConfig) -> bool {
        let mut state = self.migration.lock();
        if now.saturating_duration_since(state.window_start) >= cfg.window() {
            trace!(partition = %self.id, "rate-limit window reset");
            *state = PartitionMigrationState::new(now);
        }
        if state.pages_this_window + nr_pages > cfg.ratelimit_pages {
            return true;
        }
        state.pages_this_window += nr_pages;
        false
    }

    /// Whether the partition is throttled: the window is full and has not
    /// been stale for longer than the table-update interval
    pub fn ratelimited(&self, now: Instant, cfg: &LocalityConfig) -> bool {
        let state = self.migration.lock();
        let horizon = state.window_start + cfg.window() + cfg.pte_update_interval();
        if now > horizon {
            return false;
        }
        state.pages_this_window >= cfg.ratelimit_pages
    }

    /// Whether some reclaimable zone can take `nr_pages` without dropping
    /// below its high watermark
    pub fn migrate_balanced(&self, nr_pages: u64) -> bool {
        self.zones.iter().rev().any(|zone| {
            zone.is_populated()
                && zone.is_reclaimable()
                && zone.watermark_ok(zone.high_watermark() + nr_pages)
        })
    }
}
