//! Migration placeholders
//!
//! While a frame is in transit, every translation that mapped it is replaced
//! by a placeholder carrying the frame's identity and the original write bit.
//! Faulting threads that decode a placeholder wait for the frame lock to be
//! released and then restart the fault.
//!
//! Placeholders exist only while the migrating thread holds the frame lock.
//! Base frames use leaf placeholders under the leaf table lock; compound
//! frames use a directory placeholder under the page-table lock.

use std::ops::ControlFlow;

use tracing::trace;

use crate::flags::Perms;
use crate::memory::PhysMemory;
use crate::page::{dir_index, huge_align_down, leaf_index, FrameId};
use crate::rmap::{add_rmap, remove_rmap, rmap_walk};
use crate::vm::{AddressSpace, DirEntry, LeafEntry, Vma};

/// Replace every present translation of `frame` with a placeholder.
///
/// Each removed translation drops its reference; the caller's own reference
/// keeps the frame alive. Returns true once the frame is no longer mapped.
pub(crate) fn unmap_for_migration(mem: &PhysMemory, frame: FrameId) -> bool {
    let f = mem.frame(frame);
    rmap_walk(mem, frame, |vma, addr| {
        if f.is_huge() {
            unmap_one_huge(mem, vma, addr, frame);
        } else {
            unmap_one(mem, vma, addr, frame);
        }
        if f.is_mapped() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    });
    !f.is_mapped()
}

fn unmap_one(mem: &PhysMemory, vma: &Vma, addr: u64, frame: FrameId) {
    let Some(mm) = vma.mm() else {
        return;
    };
    let Some(table) = mm.leaf_table(addr, false) else {
        return;
    };
    let dirty = {
        let mut entries = table.lock();
        let slot = &mut entries[leaf_index(addr)];
        let LeafEntry::Present { frame: mapped, perms } = *slot else {
            return;
        };
        if mapped != frame {
            return;
        }
        *slot = LeafEntry::MigrationPlaceholder {
            frame,
            write: perms.contains(Perms::WRITE),
        };
        mm.flush_tlb_page(addr);
        remove_rmap(mem, frame);
        perms.contains(Perms::DIRTY)
    };
    if dirty {
        mem.set_dirty(frame);
    }
    trace!(%frame, addr, "placeholder installed");
    mem.put(frame);
}

fn unmap_one_huge(mem: &PhysMemory, vma: &Vma, addr: u64, frame: FrameId) {
    let Some(mm) = vma.mm() else {
        return;
    };
    let haddr = huge_align_down(addr);
    let dirty = {
        let mut dir = mm.page_table_lock();
        let Some(slot) = dir.get_mut(&dir_index(haddr)) else {
            return;
        };
        let DirEntry::Huge { frame: mapped, perms } = *slot else {
            return;
        };
        if mapped != frame {
            return;
        }
        *slot = DirEntry::MigrationPlaceholder {
            frame,
            write: perms.contains(Perms::WRITE),
        };
        mm.flush_tlb_page(haddr);
        remove_rmap(mem, frame);
        perms.contains(Perms::DIRTY)
    };
    if dirty {
        mem.set_dirty(frame);
    }
    trace!(%frame, addr = haddr, "huge placeholder installed");
    mem.put(frame);
}

/// Translation bits restored from a placeholder
#[inline]
fn restored_perms(vma: &Vma, write: bool) -> Perms {
    let mut perms = vma.prot() - (Perms::WRITE | Perms::ACCESSED | Perms::DIRTY);
    if write {
        perms |= Perms::WRITE;
    }
    perms
}

/// Resolve every placeholder for `old` into a present translation of `new`.
///
/// Walks the reverse map of `new`, which carries the owner identity of
/// `old` after a relocation. With `old == new` this is the rollback path.
/// Translations that changed shape since the unmap are skipped.
pub(crate) fn remove_placeholders(mem: &PhysMemory, old: FrameId, new: FrameId) {
    let huge = mem.frame(new).is_huge();
    rmap_walk(mem, new, |vma, addr| {
        if huge {
            remove_one_huge(mem, vma, addr, old, new);
        } else {
            remove_one(mem, vma, addr, old, new);
        }
        ControlFlow::Continue(())
    });
}

fn remove_one(mem: &PhysMemory, vma: &Vma, addr: u64, old: FrameId, new: FrameId) {
    let Some(mm) = vma.mm() else {
        return;
    };
    let Some(table) = mm.leaf_table(addr, false) else {
        return;
    };
    let mut entries = table.lock();
    let slot = &mut entries[leaf_index(addr)];
    let LeafEntry::MigrationPlaceholder { frame, write } = *slot else {
        return;
    };
    if frame != old {
        return;
    }
    mem.get(new);
    *slot = LeafEntry::Present {
        frame: new,
        perms: restored_perms(vma, write),
    };
    add_rmap(mem, new, vma, addr);
    mm.flush_tlb_page(addr);
}

fn remove_one_huge(mem: &PhysMemory, vma: &Vma, addr: u64, old: FrameId, new: FrameId) {
    let Some(mm) = vma.mm() else {
        return;
    };
    let haddr = huge_align_down(addr);
    let mut dir = mm.page_table_lock();
    let Some(slot) = dir.get_mut(&dir_index(haddr)) else {
        return;
    };
    let DirEntry::MigrationPlaceholder { frame, write } = *slot else {
        return;
    };
    if frame != old {
        return;
    }
    mem.get(new);
    *slot = DirEntry::Huge {
        frame: new,
        perms: restored_perms(vma, write),
    };
    add_rmap(mem, new, vma, haddr);
    mm.flush_tlb_page(haddr);
}

/// Wait for the migration behind the leaf placeholder at `addr`.
///
/// Returns true if the caller slept. Either way the caller must restart the
/// fault and re-read the translation.
pub fn migration_entry_wait(mem: &PhysMemory, mm: &AddressSpace, addr: u64) -> bool {
    let Some(table) = mm.leaf_table(addr, false) else {
        return false;
    };
    let entries = table.lock();
    let LeafEntry::MigrationPlaceholder { frame, .. } = entries[leaf_index(addr)] else {
        return false;
    };
    wait_for(mem, frame, entries)
}

/// Wait for the migration behind the directory placeholder covering `addr`
pub fn migration_entry_wait_huge(mem: &PhysMemory, mm: &AddressSpace, addr: u64) -> bool {
    let dir = mm.page_table_lock();
    let Some(DirEntry::MigrationPlaceholder { frame, .. }) = dir.get(&dir_index(addr)) else {
        return false;
    };
    let frame = *frame;
    wait_for(mem, frame, dir)
}

/// Pin `frame`, drop the table lock, sleep on the frame lock.
///
/// A frame that cannot be pinned has already moved on, or is frozen for the
/// slot swap; the caller simply retries.
fn wait_for<G>(mem: &PhysMemory, frame: FrameId, table_guard: G) -> bool {
    let f = mem.frame(frame);
    if !f.get_unless_zero() {
        return false;
    }
    drop(table_guard);
    f.wait_unlocked();
    mem.put(frame);
    true
}

/// Whether any translation in `mm` is a placeholder for `frame`
pub fn has_placeholder(mm: &AddressSpace, frame: FrameId) -> bool {
    let dir = mm.page_table_lock();
    dir.values().any(|entry| match entry {
        DirEntry::MigrationPlaceholder { frame: f, .. } => *f == frame,
        DirEntry::Table(table) => table.lock().iter().any(|e| {
            matches!(e, LeafEntry::MigrationPlaceholder { frame: f, .. } if *f == frame)
        }),
        DirEntry::Huge { .. } => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{AllocFlags, FrameFlags};
    use crate::memory::MemoryConfig;
    use crate::page::PartitionId;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn mapped_frame(perms: Perms) -> (Arc<PhysMemory>, Arc<AddressSpace>, Arc<Vma>, FrameId) {
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let mm = AddressSpace::new();
        let vma = mm.map_anon(0x10_0000, 8, Perms::RW).unwrap();
        let id = mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
        vma.map_frame_with(&mem, 0x10_1000, id, perms).unwrap();
        (mem, mm, vma, id)
    }

    #[test]
    fn test_unmap_installs_placeholder() {
        let (mem, mm, _vma, id) = mapped_frame(Perms::RW | Perms::DIRTY);
        assert!(unmap_for_migration(&mem, id));
        assert_eq!(
            mm.read_leaf(0x10_1000),
            LeafEntry::MigrationPlaceholder {
                frame: id,
                write: true
            }
        );
        assert_eq!(mem.frame(id).refcount(), 1);
        assert!(mem.frame(id).test(FrameFlags::DIRTY));
        assert!(has_placeholder(&mm, id));
    }

    #[test]
    fn test_rollback_preserves_write_bit() {
        let (mem, mm, _vma, id) = mapped_frame(Perms::RO);
        assert!(unmap_for_migration(&mem, id));
        remove_placeholders(&mem, id, id);
        assert_eq!(
            mm.read_leaf(0x10_1000),
            LeafEntry::Present {
                frame: id,
                perms: Perms::RO
            }
        );
        assert_eq!(mem.frame(id).refcount(), 2);
        assert_eq!(mem.frame(id).mapcount(), 1);
        assert!(!has_placeholder(&mm, id));
    }

    #[test]
    fn test_wait_returns_after_unlock() {
        let (mem, mm, _vma, id) = mapped_frame(Perms::RW);
        assert!(mem.frame(id).try_lock());
        assert!(unmap_for_migration(&mem, id));

        let waiter = {
            let mem = Arc::clone(&mem);
            let mm = Arc::clone(&mm);
            thread::spawn(move || migration_entry_wait(&mem, &mm, 0x10_1000))
        };

        thread::sleep(Duration::from_millis(20));
        mem.frame(id).unlock();
        assert!(waiter.join().unwrap());

        remove_placeholders(&mem, id, id);
        assert!(!migration_entry_wait(&mem, &mm, 0x10_1000));
    }

    #[test]
    fn test_wait_skips_frozen_frame() {
        let (mem, mm, _vma, id) = mapped_frame(Perms::RW);
        assert!(unmap_for_migration(&mem, id));
        assert!(mem.frame(id).freeze(1));
        assert!(!migration_entry_wait(&mem, &mm, 0x10_1000));
        mem.frame(id).unfreeze(1);
    }
}
