//! Reverse maps: from a frame to every translation that maps it

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::flags::FrameFlags;
use crate::frame::Owner;
use crate::memory::PhysMemory;
use crate::page::FrameId;
use crate::partition::PartitionStat;
use crate::vm::{Vma, VmaBacking};

/// Stable chain object of anonymous memory.
///
/// Lists every mapping that may map frames of the chain. Holding an `Arc` to
/// the chain keeps it alive across a migration even if all mappings go away.
#[derive(Debug, Default)]
pub struct AnonChain {
    vmas: RwLock<Vec<Weak<Vma>>>,
}

impl AnonChain {
    /// Create an empty chain
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn link(&self, vma: &Arc<Vma>) {
        let mut vmas = self.vmas.write();
        vmas.retain(|v| v.strong_count() > 0);
        vmas.push(Arc::downgrade(vma));
    }

    /// Snapshot of the live mappings
    pub fn mappings(&self) -> Vec<Arc<Vma>> {
        self.vmas.read().iter().filter_map(Weak::upgrade).collect()
    }
}

/// Chain reference of an anonymous frame, only while it is mapped
pub(crate) fn anon_chain_if_mapped(mem: &PhysMemory, frame: FrameId) -> Option<Arc<AnonChain>> {
    let f = mem.frame(frame);
    let meta = f.meta();
    match &meta.owner {
        Owner::Anon { chain, .. } if f.is_mapped() => Some(Arc::clone(chain)),
        _ => None,
    }
}

/// Visit every mapping that may map `frame`, with the address it would be
/// mapped at.
///
/// The mapping set is snapshotted first; no set or frame lock is held while
/// `visit` runs, so the visitor is free to take table locks.
pub(crate) fn rmap_walk<F>(mem: &PhysMemory, frame: FrameId, mut visit: F)
where
    F: FnMut(&Arc<Vma>, u64) -> ControlFlow<()>,
{
    let (vmas, index) = match mem.frame(frame).owner() {
        Owner::Anon { chain, index } => (chain.mappings(), index),
        Owner::File { store, index } => (store.mappings(), index),
        Owner::None => return,
    };

    for vma in &vmas {
        let Some(addr) = vma.address_of(index) else {
            continue;
        };
        if visit(vma, addr).is_break() {
            break;
        }
    }
}

/// Account a new translation of `frame` in `vma`.
///
/// The first anonymous mapping of an unowned frame makes the mapping's chain
/// its owner.
pub(crate) fn add_rmap(mem: &PhysMemory, frame: FrameId, vma: &Vma, addr: u64) {
    let f = mem.frame(frame);
    let pages = f.nr_pages() as i64;
    match vma.backing() {
        VmaBacking::Anon(chain) => {
            if f.inc_mapcount() {
                {
                    let mut meta = f.meta();
                    if matches!(meta.owner, Owner::None) {
                        meta.owner = Owner::Anon {
                            chain: Arc::clone(chain),
                            index: vma.index_of(addr),
                        };
                        f.set(FrameFlags::SWAP_BACKED);
                    }
                }
                mem.mod_frame_stat(frame, PartitionStat::AnonPages, pages);
            }
        }
        VmaBacking::File(_) => {
            if f.inc_mapcount() {
                mem.mod_frame_stat(frame, PartitionStat::FileMapped, pages);
            }
        }
    }
}

/// Account the removal of one translation of `frame`
pub(crate) fn remove_rmap(mem: &PhysMemory, frame: FrameId) {
    let f = mem.frame(frame);
    if f.dec_mapcount() {
        let stat = if f.is_anon() {
            PartitionStat::AnonPages
        } else {
            PartitionStat::FileMapped
        };
        mem.mod_frame_stat(frame, stat, -(f.nr_pages() as i64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{AllocFlags, Perms};
    use crate::memory::MemoryConfig;
    use crate::page::PartitionId;
    use crate::vm::AddressSpace;

    #[test]
    fn test_walk_visits_forked_mappings() {
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let parent = AddressSpace::new();
        let child = AddressSpace::new();
        let vma = parent.map_anon(0x10_0000, 4, Perms::RW).unwrap();
        let id = mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
        vma.map_frame(&mem, 0x10_2000, id).unwrap();
        let forked = child.fork_anon(&vma).unwrap();
        forked.map_frame(&mem, 0x10_2000, id).unwrap();

        let mut seen = Vec::new();
        rmap_walk(&mem, id, |vma, addr| {
            seen.push((Arc::as_ptr(vma), addr));
            ControlFlow::Continue(())
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, addr)| *addr == 0x10_2000));
        assert_eq!(mem.frame(id).mapcount(), 2);

        let part = mem.partition(PartitionId::new(0)).unwrap();
        assert_eq!(part.stat(PartitionStat::AnonPages), 1);
        assert!(anon_chain_if_mapped(&mem, id).is_some());
    }

    #[test]
    fn test_chain_requires_mapping() {
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let mm = AddressSpace::new();
        let vma = mm.map_anon(0x10_0000, 4, Perms::RW).unwrap();
        let id = mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
        vma.map_frame(&mem, 0x10_0000, id).unwrap();
        vma.unmap_frame(&mem, 0x10_0000).unwrap();

        assert!(mem.frame(id).is_anon());
        assert!(anon_chain_if_mapped(&mem, id).is_none());
        let part = mem.partition(PartitionId::new(0)).unwrap();
        assert_eq!(part.stat(PartitionStat::AnonPages), 0);
    }

    #[test]
    fn test_walk_stops_on_break() {
        let mem = PhysMemory::new(MemoryConfig::default()).unwrap();
        let a = AddressSpace::new();
        let b = AddressSpace::new();
        let vma = a.map_anon(0x10_0000, 1, Perms::RW).unwrap();
        b.fork_anon(&vma).unwrap();
        let id = mem.alloc(PartitionId::new(0), 0, AllocFlags::empty()).unwrap();
        vma.map_frame(&mem, 0x10_0000, id).unwrap();

        let mut visits = 0;
        rmap_walk(&mem, id, |_, _| {
            visits += 1;
            ControlFlow::Break(())
        });
        assert_eq!(visits, 1);
    }
}
