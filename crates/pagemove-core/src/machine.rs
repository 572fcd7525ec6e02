//! Single-page migration state machine
//!
//! One invocation moves one isolated source frame into a freshly allocated
//! destination:
//!
//! ```text
//! Start -> LockHeld -> Prepared -> (WritebackDrained) -> UnmapAttempted
//!       -> Relocated | RolledBack -> Done
//! ```
//!
//! The source's frame lock is held from `LockHeld` to `Done`. Every
//! placeholder installed while unmapping is resolved before the lock is
//! dropped: towards the destination on success, back to the source on
//! failure.

use tracing::trace;

use crate::copy::copy_frame;
use crate::driver::{MigrateMode, Migrator};
use crate::error::{MigrateError, Result, RetryReason};
use crate::flags::FrameFlags;
use crate::frame::Owner;
use crate::page::FrameId;
use crate::placeholder::{remove_placeholders, unmap_for_migration};
use crate::reclaim::in_reclaim;
use crate::relocate::{
    delegated_protocol, fallback_relocate, GenericRelocator, Relocatable, RelocateCtx,
};
use crate::rmap::anon_chain_if_mapped;

/// Phases of one page migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Nothing held yet
    Start,
    /// Source frame lock taken
    LockHeld,
    /// Accounting charge begun
    Prepared,
    /// Writeback waited out
    WritebackDrained,
    /// Translations replaced by placeholders, as far as possible
    UnmapAttempted,
    /// Destination committed
    Relocated,
    /// Source restored
    RolledBack,
    /// Lock released
    Done,
}

/// Successful migration outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Migrated {
    /// Mappings and cache slot now refer to the destination
    Moved,
    /// The frame's owner relocated it through its movable-object protocol
    Delegated,
}

struct PageMigration {
    src: FrameId,
    dst: FrameId,
    phase: MigrationPhase,
}

impl PageMigration {
    fn new(src: FrameId, dst: FrameId) -> Self {
        Self {
            src,
            dst,
            phase: MigrationPhase::Start,
        }
    }

    fn enter(&mut self, phase: MigrationPhase) {
        trace!(
            src = %self.src,
            dst = %self.dst,
            from = ?self.phase,
            to = ?phase,
            "migration phase"
        );
        self.phase = phase;
    }
}

impl Migrator {
    /// Run the state machine for an isolated `src` and an allocated `dst`.
    ///
    /// With `force` the source lock and writeback are waited for, except in
    /// `Async` mode and on threads running under reclaim.
    pub fn unmap_and_move_page(
        &self,
        src: FrameId,
        dst: FrameId,
        force: bool,
        mode: MigrateMode,
    ) -> Result<Migrated> {
        let s = self.memory().frame(src);
        let mut m = PageMigration::new(src, dst);

        if !s.try_lock() {
            if !force || mode == MigrateMode::Async || in_reclaim() {
                return Err(MigrateError::Retry(RetryReason::LockContention));
            }
            s.lock();
        }
        m.enter(MigrationPhase::LockHeld);

        let token = self.charge().prepare(src, dst);
        m.enter(MigrationPhase::Prepared);

        let result = self.migrate_locked(&mut m, force, mode);

        self.charge().end(token, result.is_ok());
        s.unlock();
        m.enter(MigrationPhase::Done);
        result
    }

    fn migrate_locked(
        &self,
        m: &mut PageMigration,
        force: bool,
        mode: MigrateMode,
    ) -> Result<Migrated> {
        let mem = self.memory();
        let (src, dst) = (m.src, m.dst);
        let s = mem.frame(src);

        if s.test(FrameFlags::WRITEBACK) {
            if mode != MigrateMode::Sync || !force {
                return Err(MigrateError::Retry(RetryReason::Writeback));
            }
            s.wait_on(FrameFlags::WRITEBACK);
            m.enter(MigrationPhase::WritebackDrained);
        }

        if let Some(store) = self.owner_store(src) {
            if let Some(protocol) = delegated_protocol(&store) {
                let d = mem.frame(dst);
                if !d.try_lock() {
                    return Err(MigrateError::Retry(RetryReason::DestinationBusy));
                }
                let result = protocol.migrate(mem, dst, src, mode);
                d.unlock();
                m.enter(if result.is_ok() {
                    MigrationPhase::Relocated
                } else {
                    MigrationPhase::RolledBack
                });
                return result.map(|()| Migrated::Delegated);
            }
        }

        // Held until the placeholders are resolved so the mapping set
        // cannot vanish underneath the walk.
        let mut chain = None;
        let mut remap = true;
        if s.is_anon() && !s.test(FrameFlags::KSM) {
            chain = anon_chain_if_mapped(mem, src);
            if chain.is_none() {
                if !s.test(FrameFlags::SWAP_CACHE) {
                    return Err(MigrateError::Retry(RetryReason::ChainUnavailable));
                }
                remap = false;
            }
        }

        if s.has_no_owner() {
            if s.test(FrameFlags::PRIVATE) && !mem.try_release_private(src) {
                return Err(MigrateError::Retry(RetryReason::PrivateState));
            }
        } else if s.is_mapped() {
            unmap_for_migration(mem, src);
        }
        m.enter(MigrationPhase::UnmapAttempted);

        let result = if s.is_mapped() {
            Err(MigrateError::Retry(RetryReason::StillMapped))
        } else {
            self.move_to_new_frame(dst, src, remap, mode)
        };

        match &result {
            Ok(()) => m.enter(MigrationPhase::Relocated),
            Err(err) => {
                if remap {
                    remove_placeholders(mem, src, src);
                }
                trace!(%src, %err, "migration rolled back");
                m.enter(MigrationPhase::RolledBack);
            }
        }
        drop(chain);
        result.map(|()| Migrated::Moved)
    }

    /// Hand `dst` the identity of `src` and relocate through the store's
    /// declared capability.
    ///
    /// On success the placeholders are pointed at `dst` (unless `remap` is
    /// off) and `src` loses its identity; on failure `dst` does.
    pub(crate) fn move_to_new_frame(
        &self,
        dst: FrameId,
        src: FrameId,
        remap: bool,
        mode: MigrateMode,
    ) -> Result<()> {
        let mem = self.memory();
        let s = mem.frame(src);
        let d = mem.frame(dst);

        if !d.try_lock() {
            return Err(MigrateError::Retry(RetryReason::DestinationBusy));
        }
        d.meta().owner = s.owner();
        if s.test(FrameFlags::SWAP_BACKED) {
            d.set(FrameFlags::SWAP_BACKED);
        }

        let store = mem.cache_identity(src).map(|(store, _)| store);
        let ctx = RelocateCtx {
            mem,
            store: store.as_ref(),
        };
        let result = match (&store, store.as_ref().and_then(|st| st.relocator())) {
            (_, Some(relocator)) => relocator.relocate(&ctx, dst, src, mode),
            (Some(_), None) => fallback_relocate(&ctx, dst, src, mode),
            (None, None) => GenericRelocator.relocate(&ctx, dst, src, mode),
        };

        match result {
            Ok(()) => {
                if remap {
                    remove_placeholders(mem, src, dst);
                }
                s.meta().owner = Owner::None;
            }
            Err(_) => d.meta().owner = Owner::None,
        }
        d.unlock();
        result
    }

    /// A source whose last outside reference went away while isolated: only
    /// the bytes and flags are carried over, nothing is locked or remapped
    pub(crate) fn migrate_orphan(&self, src: FrameId, dst: FrameId) -> Result<Migrated> {
        let token = self.charge().prepare(src, dst);
        copy_frame(self.memory(), dst, src);
        self.charge().end(token, true);
        trace!(%src, %dst, "orphaned source copied");
        Ok(Migrated::Moved)
    }

    /// State machine for a compound frame.
    ///
    /// The lock is only waited for when forced in `Sync` mode; writeback and
    /// delegated protocols do not apply to compound frames.
    pub fn unmap_and_move_huge_page(
        &self,
        src: FrameId,
        dst: FrameId,
        force: bool,
        mode: MigrateMode,
    ) -> Result<Migrated> {
        let mem = self.memory();
        let s = mem.frame(src);
        let mut m = PageMigration::new(src, dst);

        if !s.try_lock() {
            if !force || mode != MigrateMode::Sync {
                return Err(MigrateError::Retry(RetryReason::LockContention));
            }
            s.lock();
        }
        m.enter(MigrationPhase::LockHeld);
        let token = self.charge().prepare(src, dst);
        m.enter(MigrationPhase::Prepared);

        let chain = if s.is_anon() {
            anon_chain_if_mapped(mem, src)
        } else {
            None
        };
        if s.is_mapped() {
            unmap_for_migration(mem, src);
        }
        m.enter(MigrationPhase::UnmapAttempted);

        let result = if s.is_mapped() {
            Err(MigrateError::Retry(RetryReason::StillMapped))
        } else {
            self.move_to_new_frame(dst, src, true, mode)
        };
        if result.is_err() {
            remove_placeholders(mem, src, src);
            m.enter(MigrationPhase::RolledBack);
        } else {
            m.enter(MigrationPhase::Relocated);
        }
        drop(chain);

        self.charge().end(token, result.is_ok());
        s.unlock();
        m.enter(MigrationPhase::Done);
        result.map(|()| Migrated::Moved)
    }
}
