//! Locality-driven migration
//!
//! When a fault reports that a frame is accessed from a partition it does
//! not reside in, the frame may be moved there opportunistically. Moves are
//! admitted only for privately mapped frames, only within the target
//! partition's page budget for the current window, and only while the
//! target has room above its high watermark.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::copy::{copy_frame, revert_copy};
use crate::driver::{MigrateMode, MigrateReason, Migrator, NewFrame};
use crate::flags::{AllocFlags, FrameFlags, Perms};
use crate::frame::Owner;
use crate::memory::PhysMemory;
use crate::page::{dir_index, huge_align_down, FrameId, PartitionId, HPAGE_NR, HPAGE_ORDER};
use crate::rmap::{add_rmap, remove_rmap};
use crate::vm::{AddressSpace, DirEntry, Vma};

/// Destination source for misplaced frames: the target partition only,
/// without warnings
struct MisplacedAlloc {
    target: PartitionId,
}

impl NewFrame for MisplacedAlloc {
    fn new_frame(&mut self, mem: &PhysMemory, source: FrameId) -> Option<FrameId> {
        let order = mem.frame(source).order();
        mem.alloc(self.target, order, AllocFlags::THIS_NODE | AllocFlags::NO_WARN)
    }
}

impl Migrator {
    /// Whether `partition` is currently throttled
    pub fn migrate_ratelimited(&self, partition: PartitionId) -> bool {
        self.memory()
            .partition(partition)
            .is_some_and(|p| p.ratelimited(Instant::now(), &self.config().locality))
    }

    /// Move a misplaced frame to `target`.
    ///
    /// The caller holds one reference on `frame`, which is consumed. Returns
    /// true when the frame was migrated.
    pub fn migrate_misplaced_page(&self, frame: FrameId, vma: &Vma, target: PartitionId) -> bool {
        self.migrate_misplaced_page_at(frame, vma, target, Instant::now())
    }

    /// [`Migrator::migrate_misplaced_page`] at an explicit time
    pub fn migrate_misplaced_page_at(
        &self,
        frame: FrameId,
        vma: &Vma,
        target: PartitionId,
        now: Instant,
    ) -> bool {
        let mem = self.memory();
        let pages = mem.frame(frame).nr_pages() as u64;

        if !self.admit_misplaced(frame, vma, target, now) {
            mem.put(frame);
            return false;
        }

        let mut list = vec![frame];
        let mut alloc = MisplacedAlloc { target };
        let remaining = self
            .migrate_pages(
                &mut list,
                &mut alloc,
                MigrateMode::Async,
                MigrateReason::NumaMisplaced,
            )
            .unwrap_or(1);

        if remaining > 0 {
            if !list.is_empty() {
                self.putback_isolated(&mut list);
            }
            debug!(%frame, %target, "misplaced page not migrated");
            return false;
        }
        self.stats().add_numa_migrated(pages);
        true
    }

    fn admit_misplaced(
        &self,
        frame: FrameId,
        vma: &Vma,
        target: PartitionId,
        now: Instant,
    ) -> bool {
        let mem = self.memory();
        let f = mem.frame(frame);

        // a mapping plus the caller
        if f.refcount() != 2 {
            debug!(%frame, count = f.refcount(), "shared page not migrated");
            return false;
        }
        if f.mapcount() != 1 && f.is_file_cache() && vma.prot().contains(Perms::EXEC) {
            return false;
        }

        let Some(partition) = mem.partition(target) else {
            return false;
        };
        if partition.update_ratelimit(f.nr_pages() as u64, now, &self.config().locality) {
            debug!(%target, "migration rate limited");
            return false;
        }
        self.isolate_misplaced(frame, target)
    }

    /// Isolate a misplaced frame if `target` has room for it.
    ///
    /// On success the isolation reference replaces the caller's.
    pub fn isolate_misplaced(&self, frame: FrameId, target: PartitionId) -> bool {
        let mem = self.memory();
        let f = mem.frame(frame);
        let Some(partition) = mem.partition(target) else {
            return false;
        };
        if !partition.migrate_balanced(f.nr_pages() as u64) {
            debug!(%target, "target partition below watermark");
            return false;
        }
        if !self.isolate(frame) {
            return false;
        }
        // mapping, caller and isolation
        if f.is_trans_huge() && f.refcount() != 3 {
            self.putback_one(frame);
            return false;
        }
        mem.put(frame);
        true
    }

    /// Move a misplaced compound frame mapped by the directory entry at
    /// `addr`.
    ///
    /// The caller holds the frame lock and one reference, both released here.
    /// `entry` is the directory entry the caller observed; the swap is
    /// abandoned if it changed before the commit.
    pub fn migrate_misplaced_huge(
        &self,
        mm: &AddressSpace,
        vma: &Arc<Vma>,
        addr: u64,
        entry: &DirEntry,
        frame: FrameId,
        target: PartitionId,
    ) -> bool {
        self.migrate_misplaced_huge_at(mm, vma, addr, entry, frame, target, Instant::now())
    }

    /// [`Migrator::migrate_misplaced_huge`] at an explicit time
    #[allow(clippy::too_many_arguments)]
    pub fn migrate_misplaced_huge_at(
        &self,
        mm: &AddressSpace,
        vma: &Arc<Vma>,
        addr: u64,
        entry: &DirEntry,
        frame: FrameId,
        target: PartitionId,
        now: Instant,
    ) -> bool {
        let mem = self.memory();
        let s = mem.frame(frame);
        let haddr = huge_align_down(addr);

        let drop_ref = || {
            s.unlock();
            mem.put(frame);
            false
        };

        if s.mapcount() != 1 {
            debug!(%frame, mapcount = s.mapcount(), "shared huge page not migrated");
            return drop_ref();
        }
        let Some(partition) = mem.partition(target) else {
            return drop_ref();
        };
        if partition.update_ratelimit(HPAGE_NR as u64, now, &self.config().locality) {
            debug!(%target, "huge migration rate limited");
            return drop_ref();
        }

        let Some(dst) = mem.alloc(target, HPAGE_ORDER, AllocFlags::THIS_NODE | AllocFlags::NO_WARN)
        else {
            self.stats().add_failed(1);
            return drop_ref();
        };
        if !self.isolate_misplaced(frame, target) {
            mem.put(dst);
            self.stats().add_failed(1);
            return drop_ref();
        }

        let d = mem.frame(dst);
        d.lock();
        d.set(FrameFlags::SWAP_BACKED);
        d.meta().owner = s.owner();
        let cleared = copy_frame(mem, dst, frame);

        let key = dir_index(haddr);
        let mut dir = mm.page_table_lock();
        if dir.get(&key) != Some(entry) {
            drop(dir);
            revert_copy(mem, dst, frame, cleared);
            d.meta().owner = Owner::None;
            d.unlock();
            mem.put(dst);
            s.unlock();
            self.putback_one(frame);
            self.stats().add_failed(1);
            debug!(%frame, addr = haddr, "huge entry changed, migration abandoned");
            return false;
        }

        let token = self.charge().prepare(frame, dst);
        dir.insert(
            key,
            DirEntry::Huge {
                frame: dst,
                perms: vma.prot() | Perms::DIRTY,
            },
        );
        add_rmap(mem, dst, vma, haddr);
        mm.flush_tlb_page(haddr);
        remove_rmap(mem, frame);
        self.charge().end(token, true);
        drop(dir);

        s.meta().owner = Owner::None;
        d.unlock();
        s.unlock();

        self.account_putback(frame);
        // the translation's reference, then the isolation's
        mem.put(frame);
        mem.put(frame);

        mem.get(dst);
        self.reclaim().putback(mem, dst);

        self.stats().add_succeeded(HPAGE_NR as u64);
        self.stats().add_numa_migrated(HPAGE_NR as u64);
        debug!(src = %frame, %dst, addr = haddr, "huge page migrated");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{LocalityConfig, MigrateConfig};
    use crate::memory::MemoryConfig;
    use crate::reclaim::LruLists;
    use crate::vm::LeafEntry;

    struct Fixture {
        mem: Arc<PhysMemory>,
        lru: Arc<LruLists>,
        migrator: Migrator,
        mm: Arc<AddressSpace>,
        vma: Arc<Vma>,
    }

    fn fixture(locality: LocalityConfig) -> Fixture {
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let lru = Arc::new(LruLists::for_memory(&mem));
        let config = MigrateConfig::default().locality(locality);
        let migrator = Migrator::new(Arc::clone(&mem), lru.clone(), config).unwrap();
        let mm = AddressSpace::new();
        let vma = mm.map_anon(0x100_0000, 1024, Perms::RW).unwrap();
        Fixture {
            mem,
            lru,
            migrator,
            mm,
            vma,
        }
    }

    /// A privately mapped frame on partition 0 with the caller's reference
    fn fault_in(fx: &Fixture, addr: u64) -> FrameId {
        let id = fx
            .mem
            .alloc(PartitionId::new(0), 0, AllocFlags::empty())
            .unwrap();
        fx.vma.map_frame(&fx.mem, addr, id).unwrap();
        fx.lru.add(&fx.mem, id);
        id
    }

    #[test]
    fn test_misplaced_page_moves_to_target() {
        let fx = fixture(LocalityConfig::default());
        let src = fault_in(&fx, 0x100_0000);

        assert!(fx
            .migrator
            .migrate_misplaced_page(src, &fx.vma, PartitionId::new(1)));
        let LeafEntry::Present { frame, .. } = fx.mm.read_leaf(0x100_0000) else {
            panic!("expected a present translation");
        };
        assert_eq!(fx.mem.frame(frame).partition(), PartitionId::new(1));
        assert_eq!(fx.migrator.stats().snapshot().numa_migrated, 1);
    }

    #[test]
    fn test_shared_page_is_not_moved() {
        let fx = fixture(LocalityConfig::default());
        let src = fault_in(&fx, 0x100_0000);
        fx.mem.get(src);

        assert!(!fx
            .migrator
            .migrate_misplaced_page(src, &fx.vma, PartitionId::new(1)));
        assert_eq!(fx.mem.frame(src).refcount(), 2);
        assert!(fx.lru.contains(&fx.mem, src));
    }

    #[test]
    fn test_rate_limit_caps_window() {
        let fx = fixture(LocalityConfig::default().ratelimit_pages(2).window_ms(100));
        let now = Instant::now();
        let target = PartitionId::new(1);

        let moved = (0..4u64)
            .map(|i| fault_in(&fx, 0x100_0000 + i * 0x1000))
            .filter(|&id| fx.migrator.migrate_misplaced_page_at(id, &fx.vma, target, now))
            .count();
        assert_eq!(moved, 2);

        let later = now + Duration::from_millis(150);
        let id = fault_in(&fx, 0x100_8000);
        assert!(fx.migrator.migrate_misplaced_page_at(id, &fx.vma, target, later));
    }

    #[test]
    fn test_huge_entry_change_abandons_swap() {
        let fx = fixture(LocalityConfig::default());
        let src = fx
            .mem
            .alloc(PartitionId::new(0), HPAGE_ORDER, AllocFlags::empty())
            .unwrap();
        fx.vma.map_frame(&fx.mem, 0x120_0000, src).unwrap();
        fx.lru.add(&fx.mem, src);
        let stale = DirEntry::Huge {
            frame: src,
            perms: Perms::RO,
        };

        assert!(fx.mem.frame(src).try_lock());
        assert!(!fx.migrator.migrate_misplaced_huge(
            &fx.mm,
            &fx.vma,
            0x120_0000,
            &stale,
            src,
            PartitionId::new(1),
        ));
        assert_eq!(
            fx.mm.dir_entry(0x120_0000),
            Some(DirEntry::Huge {
                frame: src,
                perms: Perms::RW
            })
        );
        assert!(!fx.mem.frame(src).is_locked());
        assert!(fx.lru.contains(&fx.mem, src));
        // translation only; the caller's reference went with the isolation
        assert_eq!(fx.mem.frame(src).refcount(), 1);
    }

    #[test]
    fn test_huge_entry_swapped_when_unchanged() {
        let fx = fixture(LocalityConfig::default());
        let src = fx
            .mem
            .alloc(PartitionId::new(0), HPAGE_ORDER, AllocFlags::empty())
            .unwrap();
        fx.mem.frame(src).write_bytes(4096 * 7, b"tail page");
        fx.vma.map_frame(&fx.mem, 0x120_0000, src).unwrap();
        fx.lru.add(&fx.mem, src);
        let entry = fx.mm.dir_entry(0x120_0000).unwrap();

        assert!(fx.mem.frame(src).try_lock());
        assert!(fx.migrator.migrate_misplaced_huge(
            &fx.mm,
            &fx.vma,
            0x120_0000,
            &entry,
            src,
            PartitionId::new(1),
        ));

        let Some(DirEntry::Huge { frame: dst, perms }) = fx.mm.dir_entry(0x120_0000) else {
            panic!("expected a huge translation");
        };
        assert_eq!(fx.mem.frame(dst).partition(), PartitionId::new(1));
        assert!(perms.contains(Perms::DIRTY | Perms::WRITE));
        assert_eq!(
            fx.mem.frame(dst).read_bytes(4096 * 7, 9).unwrap(),
            b"tail page"
        );
        assert_eq!(fx.mem.frame(src).refcount(), 0);
        assert_eq!(fx.mem.frame(dst).mapcount(), 1);
        assert!(fx.lru.contains(&fx.mem, dst));

        let window = fx.mem.partition(PartitionId::new(1)).unwrap().migration_state();
        assert_eq!(window.pages_this_window, HPAGE_NR as u64);
    }

    #[test]
    fn test_shared_huge_frame_leaves_budget_untouched() {
        let fx = fixture(LocalityConfig::default());
        let child = AddressSpace::new();
        let forked = child.fork_anon(&fx.vma).unwrap();
        let src = fx
            .mem
            .alloc(PartitionId::new(0), HPAGE_ORDER, AllocFlags::empty())
            .unwrap();
        fx.vma.map_frame(&fx.mem, 0x120_0000, src).unwrap();
        forked.map_frame(&fx.mem, 0x120_0000, src).unwrap();
        fx.lru.add(&fx.mem, src);
        let entry = fx.mm.dir_entry(0x120_0000).unwrap();

        assert!(fx.mem.frame(src).try_lock());
        assert!(!fx.migrator.migrate_misplaced_huge(
            &fx.mm,
            &fx.vma,
            0x120_0000,
            &entry,
            src,
            PartitionId::new(1),
        ));

        let window = fx.mem.partition(PartitionId::new(1)).unwrap().migration_state();
        assert_eq!(window.pages_this_window, 0);
        assert_eq!(fx.mm.dir_entry(0x120_0000), Some(entry));
        assert!(!fx.mem.frame(src).is_locked());
        assert_eq!(fx.mem.frame(src).refcount(), 2);
        assert!(fx.lru.contains(&fx.mem, src));
    }

    #[test]
    fn test_huge_frame_exceeding_budget_is_not_moved() {
        let fx = fixture(LocalityConfig::default().ratelimit_pages(HPAGE_NR as u64 / 2));
        let src = fx
            .mem
            .alloc(PartitionId::new(0), HPAGE_ORDER, AllocFlags::empty())
            .unwrap();
        fx.vma.map_frame(&fx.mem, 0x120_0000, src).unwrap();
        fx.lru.add(&fx.mem, src);
        let entry = fx.mm.dir_entry(0x120_0000).unwrap();

        assert!(fx.mem.frame(src).try_lock());
        assert!(!fx.migrator.migrate_misplaced_huge(
            &fx.mm,
            &fx.vma,
            0x120_0000,
            &entry,
            src,
            PartitionId::new(1),
        ));

        let window = fx.mem.partition(PartitionId::new(1)).unwrap().migration_state();
        assert_eq!(window.pages_this_window, 0);
        assert_eq!(fx.mm.dir_entry(0x120_0000), Some(entry));
        assert!(!fx.mem.frame(src).is_locked());
        assert_eq!(fx.mem.frame(src).refcount(), 1);
    }
}
