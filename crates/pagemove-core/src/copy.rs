//! Content and descriptor-state transfer from a source frame to its
//! destination

use crate::flags::FrameFlags;
use crate::memory::PhysMemory;
use crate::page::FrameId;
use crate::partition::PartitionStat;

/// Flags copied verbatim when set on the source
const TRANSIENT: [FrameFlags; 5] = [
    FrameFlags::ERROR,
    FrameFlags::REFERENCED,
    FrameFlags::UPTODATE,
    FrameFlags::CHECKED,
    FrameFlags::MAPPED_TO_DISK,
];

/// Source state that [`copy_frame`] clears and [`revert_copy`] restores
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SourceState {
    swap_cache: bool,
    private_flag: bool,
    private: u64,
}

/// Copy the bytes and transferable state of `src` into `dst`.
///
/// The source ends up inert: no swap-cache membership, no private word.
/// Dirtiness moves to the destination without scheduling a second write.
/// Returns what was cleared on the source.
pub(crate) fn copy_frame(mem: &PhysMemory, dst: FrameId, src: FrameId) -> SourceState {
    let s = mem.frame(src);
    let d = mem.frame(dst);

    {
        let from = s.content();
        let mut to = d.content_mut();
        if to.len() == from.len() {
            to.copy_from_slice(&from);
        } else {
            to.clear();
            to.extend_from_slice(&from);
        }
    }

    for flag in TRANSIENT {
        if s.test(flag) {
            d.set(flag);
        }
    }

    if s.test_and_clear(FrameFlags::ACTIVE) {
        d.set(FrameFlags::ACTIVE);
    } else if s.test_and_clear(FrameFlags::UNEVICTABLE) {
        d.set(FrameFlags::UNEVICTABLE);
    }

    if s.test(FrameFlags::DIRTY) {
        mem.clear_dirty_for_io(src);
        if s.test(FrameFlags::SWAP_BACKED) {
            d.set(FrameFlags::DIRTY);
        } else {
            mem.set_dirty(dst);
        }
    }

    migrate_mlock(mem, dst, src);

    if s.test(FrameFlags::KSM) {
        d.set(FrameFlags::KSM);
    }

    let last = s.xchg_last_partition(None);
    d.xchg_last_partition(last);

    let cleared = SourceState {
        swap_cache: s.test_and_clear(FrameFlags::SWAP_CACHE),
        private_flag: s.test_and_clear(FrameFlags::PRIVATE),
        private: std::mem::take(&mut s.meta().private),
    };

    if d.test(FrameFlags::WRITEBACK) {
        d.end_writeback();
    }
    cleared
}

/// Move the mlock state and its accounting from `src` to `dst`
pub(crate) fn migrate_mlock(mem: &PhysMemory, dst: FrameId, src: FrameId) {
    let s = mem.frame(src);
    if !s.test_and_clear(FrameFlags::MLOCKED) {
        return;
    }
    let pages = s.nr_pages() as i64;
    mem.mod_frame_stat(src, PartitionStat::Mlocked, -pages);
    mem.frame(dst).set(FrameFlags::MLOCKED);
    mem.mod_frame_stat(dst, PartitionStat::Mlocked, pages);
}

/// Undo the flag transfers of [`copy_frame`] on a destination that will be
/// discarded, giving `src` back the state it lost
pub(crate) fn revert_copy(mem: &PhysMemory, dst: FrameId, src: FrameId, cleared: SourceState) {
    let s = mem.frame(src);
    let d = mem.frame(dst);
    if cleared.swap_cache {
        s.set(FrameFlags::SWAP_CACHE);
    }
    if cleared.private_flag {
        s.set(FrameFlags::PRIVATE);
    }
    s.meta().private = cleared.private;
    if d.test_and_clear(FrameFlags::ACTIVE) {
        s.set(FrameFlags::ACTIVE);
    }
    if d.test_and_clear(FrameFlags::UNEVICTABLE) {
        s.set(FrameFlags::UNEVICTABLE);
    }
    migrate_mlock(mem, src, dst);
    if d.test_and_clear(FrameFlags::DIRTY) {
        s.set(FrameFlags::DIRTY);
    }
    let last = d.xchg_last_partition(None);
    s.xchg_last_partition(last);
}
