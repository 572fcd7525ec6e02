//! End-to-end migration scenarios driven through the public API.
//!
//! Each test builds a small address space over two partitions, isolates
//! frames the way a caller would and checks translations, cache slots and
//! reference counts after the batch driver is done with them.

mod common;

use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pagemove_core::partition::PartitionStat;
use pagemove_core::{
    AllocFlags, BackingStore, BufferedRelocator, DelegatedRelocator, FrameFlags, FrameId,
    LeafEntry, MemoryConfig, MigrateConfig, MigrateError, MigrateMode, MigrateReason,
    MovableProtocol, PartitionId, Perms, PhysMemory, RefusingRelocator, StatsSnapshot, StoreKind,
    WritePage, PAGE_SIZE,
};

use common::{to_partition, Harness};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Balloon driver: owns its frames through a cache-indexed store and moves
/// them itself.
#[derive(Default)]
struct Balloon {
    store: Mutex<Weak<BackingStore>>,
    pages: Mutex<Vec<FrameId>>,
}

impl Balloon {
    fn attach(self: &Arc<Self>) -> Arc<BackingStore> {
        let store = Arc::new(
            BackingStore::new(StoreKind::Balloon)
                .with_relocator(Arc::new(DelegatedRelocator::new(self.clone()))),
        );
        *self.store.lock() = Arc::downgrade(&store);
        store
    }

    fn inflate(&self, mem: &PhysMemory, store: &Arc<BackingStore>, key: u64) -> FrameId {
        let id = mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
        store.add_frame(mem, id, key).unwrap();
        mem.frame(id).write_bytes(0, b"balloon");
        mem.put(id);
        self.pages.lock().push(id);
        id
    }
}

impl MovableProtocol for Balloon {
    fn isolate(&self, mem: &PhysMemory, frame: FrameId) -> bool {
        let mut pages = self.pages.lock();
        let Some(pos) = pages.iter().position(|&p| p == frame) else {
            return false;
        };
        pages.swap_remove(pos);
        mem.get(frame);
        true
    }

    fn putback(&self, mem: &PhysMemory, frame: FrameId) {
        self.pages.lock().push(frame);
        mem.put(frame);
    }

    fn migrate(
        &self,
        mem: &PhysMemory,
        dst: FrameId,
        src: FrameId,
        _mode: MigrateMode,
    ) -> pagemove_core::Result<()> {
        let store = self.store.lock().upgrade().ok_or(MigrateError::Refused)?;
        let key = mem.frame(src).owner().index().ok_or(MigrateError::Refused)?;
        let bytes = mem.frame(src).read_bytes(0, PAGE_SIZE).unwrap_or_default();
        mem.frame(dst).write_bytes(0, &bytes);

        store.remove_frame(mem, key);
        store.add_frame(mem, dst, key)?;
        // the slot takes over the allocation reference
        mem.put(dst);
        self.pages.lock().push(dst);
        Ok(())
    }
}

/// Write path recording the first bytes of every frame it writes
#[derive(Default)]
struct RecordingWriter {
    written: Mutex<Vec<(FrameId, Vec<u8>)>>,
}

impl WritePage for RecordingWriter {
    fn writepage(&self, mem: &PhysMemory, frame: FrameId) -> io::Result<()> {
        let bytes = mem.frame(frame).read_bytes(0, 8).unwrap_or_default();
        self.written.lock().push((frame, bytes));
        Ok(())
    }
}

/// Cache a frame of `store` at `key` on partition 0; the slot holds the
/// only reference afterwards
fn cached_frame(h: &Harness, store: &Arc<BackingStore>, key: u64, data: &[u8]) -> FrameId {
    let id = h.mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
    store.add_frame(&h.mem, id, key).unwrap();
    h.mem.frame(id).write_bytes(0, data);
    h.lru.add(&h.mem, id);
    h.mem.put(id);
    id
}

// ---------------------------------------------------------------------------
// Batch driver
// ---------------------------------------------------------------------------

#[test]
fn test_orphaned_source_is_copied_without_remap() {
    let h = Harness::new();
    let vma = h.mm.map_anon(0x100_0000, 4, Perms::RW).unwrap();
    let src = h.anon_page(&vma, 0x100_0000, b"orphan");
    let mut list = h.isolate_all(&[src]);
    // the process lets go while the frame sits isolated
    vma.unmap_frame(&h.mem, 0x100_0000).unwrap();
    assert_eq!(h.mem.frame(src).refcount(), 1);

    let mut dst = None;
    let mut factory = |mem: &PhysMemory, _src: FrameId| {
        let id = mem.alloc(PartitionId::new(1), 0, AllocFlags::THIS_NODE)?;
        mem.get(id);
        dst = Some(id);
        Some(id)
    };
    let failed = h
        .migrator
        .migrate_pages(&mut list, &mut factory, MigrateMode::Sync, MigrateReason::Compaction)
        .unwrap();
    assert_eq!(failed, 0);
    assert!(list.is_empty());

    let dst = dst.unwrap();
    assert_eq!(h.mem.frame(dst).read_bytes(0, 6).unwrap(), b"orphan");
    assert_eq!(h.mem.frame(src).refcount(), 0);
    // only the factory's pin is left
    assert_eq!(h.mem.frame(dst).refcount(), 1);
    assert_eq!(h.mm.read_leaf(0x100_0000), LeafEntry::Absent);
    h.mem.put(dst);
}

#[test]
fn test_dirty_cached_frame_async_is_retried_untouched() {
    let h = Harness::new();
    let store = Arc::new(BackingStore::new(StoreKind::File));
    let src = cached_frame(&h, &store, 9, b"dirty!");
    h.mem.set_dirty(src);
    let mut list = h.isolate_all(&[src]);

    let remaining = h
        .migrator
        .migrate_pages(
            &mut list,
            &mut to_partition(1),
            MigrateMode::Async,
            MigrateReason::Compaction,
        )
        .unwrap();
    assert_eq!(remaining, 1);
    assert_eq!(list, vec![src]);

    let f = h.mem.frame(src);
    assert!(f.test(FrameFlags::DIRTY));
    assert!(store.is_tagged_dirty(9));
    assert_eq!(store.lookup(9), Some(src));
    assert_eq!(f.read_bytes(0, 6).unwrap(), b"dirty!");
    assert_eq!(f.refcount(), 2);
    assert!(!f.is_locked());

    let snap = h.migrator.stats().snapshot();
    assert_eq!(snap.retried, MigrateConfig::default().max_passes as u64);
    assert_eq!(snap.succeeded, 0);

    h.migrator.putback_isolated(&mut list);
    assert_eq!(f.refcount(), 1);
    assert!(h.lru.contains(&h.mem, src));
}

#[test]
fn test_out_of_memory_stops_batch_and_keeps_the_rest() {
    let h = Harness::new();
    let vma = h.mm.map_anon(0x100_0000, 8, Perms::RW).unwrap();
    let frames: Vec<FrameId> = (0..5u64)
        .map(|i| h.anon_page(&vma, 0x100_0000 + i * PAGE_SIZE as u64, &[i as u8; 4]))
        .collect();
    let mut list = h.isolate_all(&frames);

    let mut calls = 0;
    let mut factory = |mem: &PhysMemory, src: FrameId| {
        calls += 1;
        if calls == 3 {
            return None;
        }
        mem.alloc(PartitionId::new(1), mem.frame(src).order(), AllocFlags::THIS_NODE)
    };
    let err = h
        .migrator
        .migrate_pages(&mut list, &mut factory, MigrateMode::Sync, MigrateReason::Syscall)
        .unwrap_err();
    assert_eq!(err, MigrateError::OutOfMemory);
    assert_eq!(list, frames[2..].to_vec());

    for (i, &frame) in frames.iter().enumerate() {
        let addr = 0x100_0000 + i as u64 * PAGE_SIZE as u64;
        let mapped = h.mapped_at(addr);
        assert_eq!(h.mem.frame(mapped).read_bytes(0, 4).unwrap(), vec![i as u8; 4]);
        if i < 2 {
            assert_ne!(mapped, frame);
            assert_eq!(h.mem.frame(mapped).partition(), PartitionId::new(1));
        } else {
            assert_eq!(mapped, frame);
            // mapping plus isolation
            assert_eq!(h.mem.frame(frame).refcount(), 2);
        }
    }
    assert_eq!(h.migrator.stats().snapshot().succeeded, 2);

    h.migrator.putback_isolated(&mut list);
    let p0 = h.mem.partition(PartitionId::new(0)).unwrap();
    assert_eq!(p0.stat(PartitionStat::IsolatedAnon), 0);
    assert_eq!(h.lru.len(0), 3);
}

#[test]
fn test_batch_converges_once_contention_clears() {
    let h = Harness::new();
    let vma = h.mm.map_anon(0x100_0000, 4, Perms::RW).unwrap();
    let frames: Vec<FrameId> = (0..3u64)
        .map(|i| h.anon_page(&vma, 0x100_0000 + i * PAGE_SIZE as u64, b"batch"))
        .collect();
    let held = frames[1];
    assert!(h.mem.frame(held).try_lock());
    let mut list = h.isolate_all(&frames);

    let mut attempts = 0;
    let mut factory = |mem: &PhysMemory, src: FrameId| {
        if src == held {
            attempts += 1;
            if attempts == 2 {
                mem.frame(held).unlock();
            }
        }
        mem.alloc(PartitionId::new(1), 0, AllocFlags::THIS_NODE)
    };
    let failed = h
        .migrator
        .migrate_pages(&mut list, &mut factory, MigrateMode::SyncLight, MigrateReason::Compaction)
        .unwrap();
    assert_eq!(failed, 0);
    assert!(list.is_empty());

    assert_eq!(
        h.migrator.stats().snapshot(),
        StatsSnapshot {
            succeeded: 3,
            failed: 0,
            retried: 1,
            batches: 1,
            numa_migrated: 0,
        }
    );
    for i in 0..3u64 {
        let mapped = h.mapped_at(0x100_0000 + i * PAGE_SIZE as u64);
        assert_eq!(h.mem.frame(mapped).partition(), PartitionId::new(1));
        assert!(h.lru.contains(&h.mem, mapped));
    }
    assert_eq!(h.lru.len(0), 0);
}

#[test]
fn test_refused_relocation_restores_every_translation() {
    let h = Harness::new();
    let store =
        Arc::new(BackingStore::new(StoreKind::File).with_relocator(Arc::new(RefusingRelocator)));
    let other = pagemove_core::AddressSpace::new();
    let rw = h.mm.map_file(&store, 0x200_0000, 4, 0, Perms::RW).unwrap();
    let ro = other.map_file(&store, 0x300_0000, 4, 0, Perms::RO).unwrap();

    let src = cached_frame(&h, &store, 1, b"pinned");
    rw.map_frame(&h.mem, 0x200_1000, src).unwrap();
    ro.map_frame(&h.mem, 0x300_1000, src).unwrap();
    let before = (h.mm.read_leaf(0x200_1000), other.read_leaf(0x300_1000));
    let free = h.mem.partition(PartitionId::new(1)).unwrap().free_pages();
    let mut list = h.isolate_all(&[src]);

    let failed = h
        .migrator
        .migrate_pages(&mut list, &mut to_partition(1), MigrateMode::Sync, MigrateReason::Syscall)
        .unwrap();
    assert_eq!(failed, 1);
    assert!(list.is_empty());

    assert_eq!((h.mm.read_leaf(0x200_1000), other.read_leaf(0x300_1000)), before);
    assert_eq!(
        before.0,
        LeafEntry::Present {
            frame: src,
            perms: Perms::RW
        }
    );
    assert_eq!(store.lookup(1), Some(src));
    let f = h.mem.frame(src);
    assert_eq!(f.mapcount(), 2);
    // slot and both translations
    assert_eq!(f.refcount(), 3);
    assert!(!f.is_locked());
    assert!(h.lru.contains(&h.mem, src));
    assert_eq!(h.mem.partition(PartitionId::new(1)).unwrap().free_pages(), free);
    assert_eq!(h.migrator.stats().snapshot().failed, 1);
}

// ---------------------------------------------------------------------------
// Relocation capabilities
// ---------------------------------------------------------------------------

#[test]
fn test_delegated_protocol_moves_balloon_page() {
    let h = Harness::new();
    let balloon = Arc::new(Balloon::default());
    let store = balloon.attach();
    let src = balloon.inflate(&h.mem, &store, 4);

    let mut list = h.isolate_all(&[src]);
    assert!(balloon.pages.lock().is_empty());
    let failed = h
        .migrator
        .migrate_pages(
            &mut list,
            &mut to_partition(1),
            MigrateMode::Sync,
            MigrateReason::Compaction,
        )
        .unwrap();
    assert_eq!(failed, 0);

    let dst = store.lookup(4).unwrap();
    assert_ne!(dst, src);
    assert_eq!(balloon.pages.lock().as_slice(), &[dst]);
    assert_eq!(h.mem.frame(dst).partition(), PartitionId::new(1));
    assert_eq!(h.mem.frame(dst).read_bytes(0, 7).unwrap(), b"balloon");
    assert_eq!(h.mem.frame(dst).refcount(), 1);
    assert_eq!(h.mem.frame(src).refcount(), 0);
    // delegated frames never touch the reclaim lists
    assert!(h.lru.is_empty());
    let p0 = h.mem.partition(PartitionId::new(0)).unwrap();
    assert_eq!(p0.stat(PartitionStat::IsolatedFile), 0);
}

#[test]
fn test_delegated_putback_returns_to_protocol() {
    let h = Harness::new();
    let balloon = Arc::new(Balloon::default());
    let store = balloon.attach();
    let page = balloon.inflate(&h.mem, &store, 0);

    let mut list = h.isolate_all(&[page]);
    assert_eq!(h.mem.frame(page).refcount(), 2);
    h.migrator.putback_movable(&mut list);
    assert!(list.is_empty());
    assert_eq!(balloon.pages.lock().as_slice(), &[page]);
    assert_eq!(h.mem.frame(page).refcount(), 1);
    assert!(h.lru.is_empty());
}

#[test]
fn test_buffered_store_carries_buffers() {
    let h = Harness::new();
    let store =
        Arc::new(BackingStore::new(StoreKind::File).with_relocator(Arc::new(BufferedRelocator)));
    let vma = h.mm.map_file(&store, 0x200_0000, 4, 0, Perms::RO).unwrap();
    let src = cached_frame(&h, &store, 2, b"blocks");
    let ring = h.mem.attach_buffers(src, 4).unwrap();
    vma.map_frame(&h.mem, 0x200_2000, src).unwrap();
    let mut list = h.isolate_all(&[src]);

    let failed = h
        .migrator
        .migrate_pages(
            &mut list,
            &mut to_partition(1),
            MigrateMode::Sync,
            MigrateReason::Compaction,
        )
        .unwrap();
    assert_eq!(failed, 0);

    let dst = h.mapped_at(0x200_2000);
    assert_eq!(store.lookup(2), Some(dst));
    let d = h.mem.frame(dst);
    assert!(d.test(FrameFlags::PRIVATE));
    assert!(d.buffers().is_some_and(|b| Arc::ptr_eq(&b, &ring)));
    assert!(ring.heads().iter().all(|bh| bh.frame() == dst && !bh.is_locked()));
    // slot, buffers and the translation
    assert_eq!(d.refcount(), 3);
    assert_eq!(d.read_bytes(0, 6).unwrap(), b"blocks");
    assert_eq!(h.mem.frame(src).refcount(), 0);
}

#[test]
fn test_dirty_frame_is_written_out_then_moved() {
    let h = Harness::new();
    let writer = Arc::new(RecordingWriter::default());
    let store = Arc::new(BackingStore::new(StoreKind::File).with_writeback(writer.clone()));
    let src = cached_frame(&h, &store, 5, b"flushme!");
    h.mem.set_dirty(src);
    let mut list = h.isolate_all(&[src]);

    let failed = h
        .migrator
        .migrate_pages(
            &mut list,
            &mut to_partition(1),
            MigrateMode::Sync,
            MigrateReason::MemoryHotplug,
        )
        .unwrap();
    assert_eq!(failed, 0);

    assert_eq!(
        writer.written.lock().as_slice(),
        &[(src, b"flushme!".to_vec())]
    );
    let dst = store.lookup(5).unwrap();
    assert_ne!(dst, src);
    assert!(!h.mem.frame(dst).test(FrameFlags::DIRTY));
    assert!(!store.is_tagged_dirty(5));
    assert_eq!(h.mem.frame(dst).read_bytes(0, 8).unwrap(), b"flushme!");
    assert_eq!(h.migrator.stats().snapshot().retried, 1);
}

#[test]
fn test_swap_cached_frames_keep_their_entry() {
    let h = Harness::new();
    let vma = h.mm.map_anon(0x100_0000, 4, Perms::RW).unwrap();
    let mapped = h.anon_page(&vma, 0x100_0000, b"swapA");
    h.mem.add_to_swap_cache(mapped, 70).unwrap();

    // swap-cached but no longer mapped anywhere
    let loose = h.anon_page(&vma, 0x100_1000, b"swapB");
    h.mem.add_to_swap_cache(loose, 71).unwrap();
    vma.unmap_frame(&h.mem, 0x100_1000).unwrap();

    let mut list = h.isolate_all(&[mapped, loose]);
    let failed = h
        .migrator
        .migrate_pages(
            &mut list,
            &mut to_partition(1),
            MigrateMode::Sync,
            MigrateReason::Compaction,
        )
        .unwrap();
    assert_eq!(failed, 0);

    let swap = h.mem.swap_cache();
    let new_mapped = h.mapped_at(0x100_0000);
    assert_eq!(swap.lookup(70), Some(new_mapped));
    let new_loose = swap.lookup(71).unwrap();
    assert_ne!(new_loose, loose);
    assert_eq!(h.mm.read_leaf(0x100_1000), LeafEntry::Absent);

    for (dst, entry, data) in [(new_mapped, 70, b"swapA"), (new_loose, 71, b"swapB")] {
        let d = h.mem.frame(dst);
        assert!(d.test(FrameFlags::SWAP_CACHE));
        assert_eq!(d.private(), entry);
        assert_eq!(d.read_bytes(0, 5).unwrap(), data);
        assert_eq!(d.partition(), PartitionId::new(1));
    }
    assert_eq!(h.mem.frame(mapped).refcount(), 0);
    assert_eq!(h.mem.frame(loose).refcount(), 0);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn test_configuration_from_json() {
    let config: MigrateConfig =
        serde_json::from_str(r#"{"max_passes": 4, "locality": {"ratelimit_pages": 64}}"#).unwrap();
    assert_eq!(config.max_passes, 4);
    assert_eq!(config.force_after_pass, 2);
    assert_eq!(config.locality.ratelimit_pages, 64);
    assert_eq!(config.locality.window_ms, 100);
    assert!(config.validate().is_ok());

    let layout: MemoryConfig =
        serde_json::from_str(r#"{"partitions": [{}, {"zones": []}]}"#).unwrap();
    let mem = PhysMemory::new(layout).unwrap();
    assert_eq!(mem.partitions().len(), 2);
    assert!(!mem.partition(PartitionId::new(1)).unwrap().has_memory());

    let snapshot = StatsSnapshot {
        succeeded: 3,
        ..StatsSnapshot::default()
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"succeeded\":3"));
}
