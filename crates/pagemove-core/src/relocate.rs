//! Relocation capabilities
//!
//! A backing store declares how its frames move by carrying a
//! [`Relocatable`]. Stores without one go through the fallback path, which
//! writes dirty frames out first and releases private state before the
//! generic move.
//!
//! # Cache-slot relocation
//!
//! [`move_mapping`] swaps the store's slot from the source to the
//! destination under the index lock. The source count must equal
//! `2 + has_private` (slot, caller, attached buffers); it is frozen during
//! the swap and handed back as `expected - 1` once the slot's reference
//! belongs to the destination.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffers::BufferRing;
use crate::cache::BackingStore;
use crate::copy::copy_frame;
use crate::driver::MigrateMode;
use crate::error::{MigrateError, Result, RetryReason};
use crate::flags::FrameFlags;
use crate::memory::PhysMemory;
use crate::page::FrameId;
use crate::partition::PartitionStat;
use crate::placeholder::remove_placeholders;

/// Arguments shared by every relocation
#[derive(Clone, Copy)]
pub struct RelocateCtx<'a> {
    /// Physical memory
    pub mem: &'a PhysMemory,
    /// Store holding the source's slot, if cache-indexed
    pub store: Option<&'a Arc<BackingStore>>,
}

/// Protocol of frames whose relocation is entirely delegated to their owner
pub trait MovableProtocol: Send + Sync {
    /// Take a frame out of the owner's list for migration, with a reference
    fn isolate(&self, mem: &PhysMemory, frame: FrameId) -> bool;

    /// Return an isolated frame to the owner, dropping the isolation reference
    fn putback(&self, mem: &PhysMemory, frame: FrameId);

    /// Move the owner's bookkeeping and bytes from `src` to `dst`.
    ///
    /// Both frames are locked. On success the owner keeps the destination's
    /// allocation reference and drops its own reference on the source.
    fn migrate(&self, mem: &PhysMemory, dst: FrameId, src: FrameId, mode: MigrateMode)
        -> Result<()>;
}

/// How a store's frames are relocated
pub trait Relocatable: Send + Sync {
    /// Relocate `src` into `dst`; both are locked by the caller
    fn relocate(&self, ctx: &RelocateCtx<'_>, dst: FrameId, src: FrameId, mode: MigrateMode)
        -> Result<()>;

    /// Delegated protocol, for stores whose frames skip the unmap path
    fn movable(&self) -> Option<&dyn MovableProtocol> {
        None
    }
}

/// Swap the cache slot of `src` to `dst`.
///
/// In `Async` mode the source's buffers are try-locked under the index lock
/// and stay locked on success; the caller releases them.
pub(crate) fn move_mapping(
    ctx: &RelocateCtx<'_>,
    dst: FrameId,
    src: FrameId,
    buffers: Option<&BufferRing>,
    mode: MigrateMode,
) -> Result<()> {
    let mem = ctx.mem;
    let s = mem.frame(src);
    let d = mem.frame(dst);

    let Some(store) = ctx.store else {
        if s.refcount() != 1 {
            return Err(MigrateError::Retry(RetryReason::RefCount));
        }
        return Ok(());
    };
    let Some(key) = cache_key(mem, store, src) else {
        return Err(MigrateError::Retry(RetryReason::SlotMoved));
    };

    let expected = 2 + u32::from(s.test(FrameFlags::PRIVATE));
    let mut index = store.lock_index();

    if index.get(key) != Some(src) {
        return Err(MigrateError::Retry(RetryReason::SlotMoved));
    }
    if !s.freeze(expected) {
        return Err(MigrateError::Retry(RetryReason::RefCount));
    }
    if mode == MigrateMode::Async {
        if let Some(ring) = buffers {
            if !ring.lock_all(mode) {
                s.unfreeze(expected);
                return Err(MigrateError::Retry(RetryReason::BufferContention));
            }
        }
    }

    d.get();
    if s.test(FrameFlags::SWAP_CACHE) {
        d.set(FrameFlags::SWAP_CACHE);
        d.meta().private = s.private();
    }
    index.insert(key, dst);
    s.unfreeze(expected - 1);
    drop(index);

    let pages = s.nr_pages() as i64;
    mem.mod_frame_stat(src, PartitionStat::FilePages, -pages);
    mem.mod_frame_stat(dst, PartitionStat::FilePages, pages);
    if !s.test(FrameFlags::SWAP_CACHE) && s.test(FrameFlags::SWAP_BACKED) {
        mem.mod_frame_stat(src, PartitionStat::Shmem, -pages);
        mem.mod_frame_stat(dst, PartitionStat::Shmem, pages);
    }
    trace!(%src, %dst, key, "cache slot moved");
    Ok(())
}

fn cache_key(mem: &PhysMemory, store: &Arc<BackingStore>, src: FrameId) -> Option<u64> {
    mem.cache_identity(src)
        .filter(|(owner, _)| Arc::ptr_eq(owner, store))
        .map(|(_, key)| key)
}

/// Slot move followed by a content copy
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericRelocator;

impl Relocatable for GenericRelocator {
    fn relocate(
        &self,
        ctx: &RelocateCtx<'_>,
        dst: FrameId,
        src: FrameId,
        mode: MigrateMode,
    ) -> Result<()> {
        move_mapping(ctx, dst, src, None, mode)?;
        copy_frame(ctx.mem, dst, src);
        Ok(())
    }
}

/// Slot move that also carries attached block buffers over
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferedRelocator;

impl Relocatable for BufferedRelocator {
    fn relocate(
        &self,
        ctx: &RelocateCtx<'_>,
        dst: FrameId,
        src: FrameId,
        mode: MigrateMode,
    ) -> Result<()> {
        let mem = ctx.mem;
        let Some(ring) = mem.frame(src).buffers() else {
            return GenericRelocator.relocate(ctx, dst, src, mode);
        };

        move_mapping(ctx, dst, src, Some(&ring), mode)?;
        if mode != MigrateMode::Async {
            let locked = ring.lock_all(mode);
            debug_assert!(locked, "blocking buffer lock cannot fail");
        }

        let s = mem.frame(src);
        let d = mem.frame(dst);
        s.clear(FrameFlags::PRIVATE);
        s.meta().buffers = None;
        d.meta().buffers = Some(Arc::clone(&ring));
        d.set(FrameFlags::PRIVATE);
        mem.put(src);
        mem.get(dst);
        ring.retarget(dst);

        copy_frame(mem, dst, src);
        ring.unlock_all();
        Ok(())
    }
}

/// Hands relocation to a [`MovableProtocol`]
pub struct DelegatedRelocator {
    protocol: Arc<dyn MovableProtocol>,
}

impl DelegatedRelocator {
    /// Wrap a movable-object protocol
    pub fn new(protocol: Arc<dyn MovableProtocol>) -> Self {
        Self { protocol }
    }
}

impl Relocatable for DelegatedRelocator {
    fn relocate(
        &self,
        ctx: &RelocateCtx<'_>,
        dst: FrameId,
        src: FrameId,
        mode: MigrateMode,
    ) -> Result<()> {
        self.protocol.migrate(ctx.mem, dst, src, mode)
    }

    fn movable(&self) -> Option<&dyn MovableProtocol> {
        Some(self.protocol.as_ref())
    }
}

/// Refuses every relocation
#[derive(Debug, Default, Clone, Copy)]
pub struct RefusingRelocator;

impl Relocatable for RefusingRelocator {
    fn relocate(
        &self,
        _ctx: &RelocateCtx<'_>,
        _dst: FrameId,
        src: FrameId,
        _mode: MigrateMode,
    ) -> Result<()> {
        debug!(%src, "relocation refused by backing store");
        Err(MigrateError::Refused)
    }
}

/// Relocation for stores that declare no capability.
///
/// A dirty frame cannot be moved: in `Sync` mode it is written out and the
/// migration retried later, otherwise it is retried right away. Private
/// state must be released before the generic move.
pub(crate) fn fallback_relocate(
    ctx: &RelocateCtx<'_>,
    dst: FrameId,
    src: FrameId,
    mode: MigrateMode,
) -> Result<()> {
    let mem = ctx.mem;
    if mem.frame(src).test(FrameFlags::DIRTY) {
        if mode != MigrateMode::Sync {
            return Err(MigrateError::Retry(RetryReason::Dirty));
        }
        return writeout(ctx, src);
    }

    if mem.frame(src).test(FrameFlags::PRIVATE) && !mem.try_release_private(src) {
        return Err(MigrateError::Retry(RetryReason::PrivateState));
    }

    GenericRelocator.relocate(ctx, dst, src, mode)
}

/// Write a dirty frame out through its store.
///
/// Placeholders are resolved back to the source first so the frame is usable
/// while the write runs. Success still means the migration must be retried.
pub(crate) fn writeout(ctx: &RelocateCtx<'_>, src: FrameId) -> Result<()> {
    let mem = ctx.mem;
    let Some(writer) = ctx.store.and_then(|store| store.writeback()) else {
        return Err(MigrateError::NoWriteback);
    };
    if !mem.clear_dirty_for_io(src) {
        return Err(MigrateError::Retry(RetryReason::WrittenOut));
    }

    remove_placeholders(mem, src, src);

    match writer.writepage(mem, src) {
        Ok(()) => {
            debug!(%src, "dirty frame written out");
            Err(MigrateError::Retry(RetryReason::WrittenOut))
        }
        Err(err) => {
            mem.set_dirty(src);
            Err(MigrateError::Io(err.to_string()))
        }
    }
}

/// Whether frames of `store` bypass the unmap path
pub(crate) fn delegated_protocol(store: &BackingStore) -> Option<&dyn MovableProtocol> {
    store.relocator().and_then(|r| r.movable())
}
