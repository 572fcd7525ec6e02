//! Batch retry driver
//!
//! [`Migrator::migrate_pages`] drives a list of isolated frames through the
//! single-page state machine for a bounded number of passes. Later passes
//! force blocking lock and writeback waits so contended frames still make
//! progress. Frames that keep asking for a retry stay on the list for the
//! caller to put back.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::BackingStore;
use crate::charge::{ChargeHook, NoCharge};
use crate::config::MigrateConfig;
use crate::error::{MigrateError, Result};
use crate::frame::Owner;
use crate::machine::Migrated;
use crate::memory::PhysMemory;
use crate::page::{FrameId, PartitionId};
use crate::reclaim::ReclaimList;
use crate::stats::MigrationStats;

/// How hard a migration may try
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrateMode {
    /// Never block
    Async,
    /// Block on locks, never on writeback
    SyncLight,
    /// Block on locks and writeback, write dirty frames out
    Sync,
}

/// Why a batch is migrated; carried for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrateReason {
    /// Defragmentation
    Compaction,
    /// Moving data off a failing frame
    MemoryFailure,
    /// Emptying a region that is about to go away
    MemoryHotplug,
    /// Explicit user request
    Syscall,
    /// Memory policy rebinding
    MempolicyMbind,
    /// Access from a non-resident partition
    NumaMisplaced,
    /// Clearing a contiguous allocation region
    Cma,
}

/// Destination-frame source for the batch driver
pub trait NewFrame {
    /// Allocate a destination for `source`; `None` aborts the batch
    fn new_frame(&mut self, mem: &PhysMemory, source: FrameId) -> Option<FrameId>;

    /// Outcome of the attempt on `source`: the destination's partition on
    /// success, the failure otherwise
    fn record(&mut self, _source: FrameId, _outcome: &Result<PartitionId>) {}
}

impl<F> NewFrame for F
where
    F: FnMut(&PhysMemory, FrameId) -> Option<FrameId>,
{
    fn new_frame(&mut self, mem: &PhysMemory, source: FrameId) -> Option<FrameId> {
        self(mem, source)
    }
}

/// Migration engine bound to one physical memory
pub struct Migrator {
    mem: Arc<PhysMemory>,
    config: MigrateConfig,
    reclaim: Arc<dyn ReclaimList>,
    charge: Arc<dyn ChargeHook>,
    stats: MigrationStats,
}

impl Migrator {
    /// Create a migrator, validating `config`
    pub fn new(
        mem: Arc<PhysMemory>,
        reclaim: Arc<dyn ReclaimList>,
        config: MigrateConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mem,
            config,
            reclaim,
            charge: Arc::new(NoCharge),
            stats: MigrationStats::new(),
        })
    }

    /// Replace the accounting hook
    pub fn with_charge(mut self, charge: Arc<dyn ChargeHook>) -> Self {
        self.charge = charge;
        self
    }

    /// Physical memory
    #[inline]
    pub fn memory(&self) -> &Arc<PhysMemory> {
        &self.mem
    }

    /// Reclaim-list collaborator
    #[inline]
    pub fn reclaim(&self) -> &Arc<dyn ReclaimList> {
        &self.reclaim
    }

    /// Active configuration
    #[inline]
    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    /// Aggregate counters
    #[inline]
    pub fn stats(&self) -> &MigrationStats {
        &self.stats
    }

    #[inline]
    pub(crate) fn charge(&self) -> &dyn ChargeHook {
        self.charge.as_ref()
    }

    /// Store owning a cache-indexed frame
    pub(crate) fn owner_store(&self, frame: FrameId) -> Option<Arc<BackingStore>> {
        match self.mem.frame(frame).owner() {
            Owner::File { store, .. } => Some(store),
            _ => None,
        }
    }

    /// Migrate every frame of `list`.
    ///
    /// Frames must have been isolated with [`Migrator::isolate`]. Moved and
    /// permanently failed frames leave the list; frames still asking for a
    /// retry after the last pass stay on it for the caller to put back.
    /// Returns the number of frames that were not migrated.
    ///
    /// When no destination can be allocated the batch stops at once with
    /// [`MigrateError::OutOfMemory`]: frames already moved stay moved and
    /// every remaining frame is still on the list, untouched.
    #[tracing::instrument(skip(self, list, new), fields(pages = list.len()))]
    pub fn migrate_pages(
        &self,
        list: &mut Vec<FrameId>,
        new: &mut dyn NewFrame,
        mode: MigrateMode,
        reason: MigrateReason,
    ) -> Result<usize> {
        debug!("batch migration started");
        self.stats.add_batch();

        let mut nr_succeeded = 0u64;
        let mut nr_failed = 0usize;
        let mut retry = 1usize;
        let mut out_of_memory = false;

        'passes: for pass in 0..self.config.max_passes {
            if retry == 0 {
                break;
            }
            retry = 0;
            let force = pass > self.config.force_after_pass;

            let mut i = 0;
            while i < list.len() {
                let src = list[i];
                let pages = self.mem.frame(src).nr_pages() as u64;
                match self.unmap_and_move(new, src, force, mode) {
                    Ok(_) => {
                        list.remove(i);
                        nr_succeeded += pages;
                    }
                    Err(err) if err.is_retry() => {
                        trace!(%src, pass, %err, "page deferred");
                        self.stats.add_retried(1);
                        retry += 1;
                        i += 1;
                    }
                    Err(MigrateError::OutOfMemory) => {
                        debug!(%src, pass, "no destination frame, aborting batch");
                        out_of_memory = true;
                        break 'passes;
                    }
                    Err(err) => {
                        debug!(%src, %err, "page migration failed");
                        list.remove(i);
                        nr_failed += 1;
                    }
                }
            }
        }

        self.stats.add_succeeded(nr_succeeded);
        self.stats.add_failed(nr_failed as u64);
        debug!(
            succeeded = nr_succeeded,
            failed = nr_failed,
            retrying = retry,
            "batch migration finished"
        );

        if out_of_memory {
            return Err(MigrateError::OutOfMemory);
        }
        Ok(nr_failed + retry)
    }

    /// Allocate a destination for `src`, run one attempt and settle both
    /// frames.
    ///
    /// A source that is done with (moved or permanently failed) leaves the
    /// isolated set: it goes back to its list, or is freed when nothing else
    /// references it. A destination that did not receive the frame is
    /// released the same way.
    fn unmap_and_move(
        &self,
        new: &mut dyn NewFrame,
        src: FrameId,
        force: bool,
        mode: MigrateMode,
    ) -> Result<Migrated> {
        let mem = &self.mem;
        let Some(dst) = new.new_frame(mem, src) else {
            return Err(MigrateError::OutOfMemory);
        };

        let result = if mem.frame(src).refcount() == 1 {
            // every other reference went away while the frame was isolated
            self.migrate_orphan(src, dst)
        } else {
            self.unmap_and_move_page(src, dst, force, mode)
        };

        let outcome = match &result {
            Ok(_) => Ok(mem.frame(dst).partition()),
            Err(err) => Err(err.clone()),
        };
        new.record(src, &outcome);

        match &result {
            Err(err) if err.is_retry() => {}
            Ok(Migrated::Delegated) => {
                self.account_putback(src);
                mem.put(src);
            }
            _ => self.putback_one(src),
        }
        if result != Ok(Migrated::Delegated) {
            self.reclaim.putback(mem, dst);
        }
        result
    }

    /// Migrate one compound frame, escalating like a batch pass.
    ///
    /// The frame must have been isolated. Stops on success, on
    /// [`MigrateError::OutOfMemory`] and on any permanent failure, which is
    /// reported as an I/O error. A frame still contended after the last pass
    /// stays isolated and the retry is returned.
    #[tracing::instrument(skip(self, new))]
    pub fn migrate_huge_page(
        &self,
        src: FrameId,
        new: &mut dyn NewFrame,
        mode: MigrateMode,
        reason: MigrateReason,
    ) -> Result<Migrated> {
        if !self.mem.frame(src).is_huge() {
            return Err(MigrateError::Unsupported);
        }
        self.stats.add_batch();

        let pages = self.mem.frame(src).nr_pages() as u64;
        let mut last = Err(MigrateError::OutOfMemory);
        for pass in 0..self.config.max_passes {
            let force = pass > self.config.force_after_pass;
            last = self.unmap_and_move_huge(new, src, force, mode);
            match &last {
                Err(err) if err.is_retry() => {
                    trace!(%src, pass, %err, "huge page deferred");
                    self.stats.add_retried(1);
                }
                Ok(_) => {
                    self.stats.add_succeeded(pages);
                    break;
                }
                Err(MigrateError::OutOfMemory) => break,
                Err(err) => {
                    debug!(%src, %err, "huge page migration failed");
                    self.stats.add_failed(1);
                    last = Err(MigrateError::Io(err.to_string()));
                    break;
                }
            }
        }
        last
    }

    fn unmap_and_move_huge(
        &self,
        new: &mut dyn NewFrame,
        src: FrameId,
        force: bool,
        mode: MigrateMode,
    ) -> Result<Migrated> {
        let mem = &self.mem;
        let Some(dst) = new.new_frame(mem, src) else {
            return Err(MigrateError::OutOfMemory);
        };

        let result = self.unmap_and_move_huge_page(src, dst, force, mode);

        let outcome = match &result {
            Ok(_) => Ok(mem.frame(dst).partition()),
            Err(err) => Err(err.clone()),
        };
        new.record(src, &outcome);

        if !matches!(&result, Err(err) if err.is_retry()) {
            self.putback_one(src);
        }
        self.reclaim.putback(mem, dst);
        result
    }
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
