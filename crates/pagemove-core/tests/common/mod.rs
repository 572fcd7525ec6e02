//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use pagemove_core::{
    AddressSpace, AllocFlags, FrameId, LeafEntry, LruLists, MemoryConfig, MigrateConfig,
    Migrator, PartitionId, PhysMemory, Vma,
};

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Two partitions, reclaim lists and a migrator over them.
pub struct Harness {
    pub mem: Arc<PhysMemory>,
    pub lru: Arc<LruLists>,
    pub migrator: Migrator,
    pub mm: Arc<AddressSpace>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(MigrateConfig::default())
    }

    pub fn with_config(config: MigrateConfig) -> Self {
        init_tracing();
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let lru = Arc::new(LruLists::for_memory(&mem));
        let migrator = Migrator::new(Arc::clone(&mem), lru.clone(), config).unwrap();
        Self {
            mem,
            lru,
            migrator,
            mm: AddressSpace::new(),
        }
    }

    /// Allocate a frame on partition 0, map it at `addr`, fill it with
    /// `data` and put it on its reclaim list. The mapping holds the only
    /// reference afterwards.
    pub fn anon_page(&self, vma: &Vma, addr: u64, data: &[u8]) -> FrameId {
        let id = self
            .mem
            .alloc(PartitionId::new(0), 0, AllocFlags::empty())
            .unwrap();
        vma.map_frame(&self.mem, addr, id).unwrap();
        assert!(self.mem.frame(id).write_bytes(0, data));
        self.lru.add(&self.mem, id);
        self.mem.put(id);
        id
    }

    /// Isolate every frame, panicking if one is not on a list
    pub fn isolate_all(&self, frames: &[FrameId]) -> Vec<FrameId> {
        for &frame in frames {
            assert!(self.migrator.isolate(frame), "{frame} was not isolated");
        }
        frames.to_vec()
    }

    /// Frame currently mapped at `addr`
    pub fn mapped_at(&self, addr: u64) -> FrameId {
        match self.mm.read_leaf(addr) {
            LeafEntry::Present { frame, .. } => frame,
            other => panic!("expected a present translation at {addr:#x}, found {other:?}"),
        }
    }
}

/// Destination factory allocating on `target`
pub fn to_partition(target: u16) -> impl FnMut(&PhysMemory, FrameId) -> Option<FrameId> {
    move |mem, src| {
        let order = mem.frame(src).order();
        mem.alloc(PartitionId::new(target), order, AllocFlags::THIS_NODE)
    }
}
