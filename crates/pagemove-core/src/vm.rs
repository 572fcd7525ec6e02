//! Address spaces, translation tables and mappings
//!
//! Translations are two-level. The directory holds one [`DirEntry`] per 2MB
//! and is guarded by the address space's page-table lock. Leaf tables carry
//! their own lock, so placeholder installation in one table never contends
//! with faults in another.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::cache::BackingStore;
use crate::error::{MigrateError, Result};
use crate::flags::Perms;
use crate::frame::Owner;
use crate::memory::PhysMemory;
use crate::page::{
    dir_index, huge_align_down, leaf_index, FrameId, ENTRIES_PER_TABLE, HPAGE_SIZE, PAGE_SHIFT,
    PAGE_SIZE,
};
use crate::rmap::{add_rmap, remove_rmap, AnonChain};

/// A leaf translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeafEntry {
    /// Nothing mapped
    #[default]
    Absent,
    /// A present translation
    Present {
        /// Mapped frame
        frame: FrameId,
        /// Protection and status bits
        perms: Perms,
    },
    /// The frame is being migrated; faulting threads must wait
    MigrationPlaceholder {
        /// Frame under migration
        frame: FrameId,
        /// Write permission of the replaced translation
        write: bool,
    },
}

/// A leaf table: 512 translations under one lock
#[derive(Debug)]
pub struct LeafTable {
    entries: Mutex<Vec<LeafEntry>>,
}

impl LeafTable {
    fn new() -> Self {
        Self {
            entries: Mutex::new(vec![LeafEntry::Absent; ENTRIES_PER_TABLE]),
        }
    }

    /// Take the table lock
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Vec<LeafEntry>> {
        self.entries.lock()
    }
}

/// A directory slot covering 2MB
#[derive(Debug, Clone)]
pub enum DirEntry {
    /// Points to a leaf table
    Table(Arc<LeafTable>),
    /// Maps a huge frame as one unit
    Huge {
        /// Mapped compound frame
        frame: FrameId,
        /// Protection and status bits
        perms: Perms,
    },
    /// The huge frame is being migrated
    MigrationPlaceholder {
        /// Frame under migration
        frame: FrameId,
        /// Write permission of the replaced translation
        write: bool,
    },
}

impl PartialEq for DirEntry {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DirEntry::Table(a), DirEntry::Table(b)) => Arc::ptr_eq(a, b),
            (
                DirEntry::Huge { frame: fa, perms: pa },
                DirEntry::Huge { frame: fb, perms: pb },
            ) => fa == fb && pa == pb,
            (
                DirEntry::MigrationPlaceholder { frame: fa, write: wa },
                DirEntry::MigrationPlaceholder { frame: fb, write: wb },
            ) => fa == fb && wa == wb,
            _ => false,
        }
    }
}

/// What backs a mapping
#[derive(Debug, Clone)]
pub enum VmaBacking {
    /// Private anonymous memory
    Anon(Arc<AnonChain>),
    /// A backing store
    File(Arc<BackingStore>),
}

/// A mapping: a range of one address space with protection and backing
#[derive(Debug)]
pub struct Vma {
    mm: Weak<AddressSpace>,
    start: u64,
    end: u64,
    pgoff: u64,
    prot: Perms,
    backing: VmaBacking,
}

impl Vma {
    /// First address
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last address
    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Protection of the mapping
    #[inline]
    pub fn prot(&self) -> Perms {
        self.prot
    }

    /// Backing of the mapping
    #[inline]
    pub fn backing(&self) -> &VmaBacking {
        &self.backing
    }

    /// Owning address space, unless it was torn down
    #[inline]
    pub fn mm(&self) -> Option<Arc<AddressSpace>> {
        self.mm.upgrade()
    }

    /// Whether `addr` falls inside the mapping
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Page index backing `addr`
    #[inline]
    pub fn index_of(&self, addr: u64) -> u64 {
        self.pgoff + ((addr - self.start) >> PAGE_SHIFT)
    }

    /// Address at which page `index` is mapped, if inside the mapping
    pub fn address_of(&self, index: u64) -> Option<u64> {
        let offset = index.checked_sub(self.pgoff)?;
        let addr = self.start.checked_add(offset.checked_mul(PAGE_SIZE as u64)?)?;
        self.contains(addr).then_some(addr)
    }

    /// Map `frame` at `addr` with the mapping's protection
    pub fn map_frame(&self, mem: &PhysMemory, addr: u64, frame: FrameId) -> Result<()> {
        self.map_frame_with(mem, addr, frame, self.prot)
    }

    /// Map `frame` at `addr` with explicit translation bits.
    ///
    /// Takes a reference for the translation and links the reverse map.
    /// Compound frames are mapped by their directory entry.
    pub fn map_frame_with(
        &self,
        mem: &PhysMemory,
        addr: u64,
        frame: FrameId,
        perms: Perms,
    ) -> Result<()> {
        if !self.contains(addr) {
            return Err(MigrateError::Fault(addr));
        }
        self.check_owner(mem, addr, frame)?;
        let mm = self.mm().ok_or(MigrateError::Fault(addr))?;
        let f = mem.frame(frame);

        if f.is_huge() {
            let haddr = huge_align_down(addr);
            if haddr < self.start || haddr + HPAGE_SIZE as u64 > self.end {
                return Err(MigrateError::InvalidArgument(format!(
                    "huge frame at {haddr:#x} does not fit the mapping"
                )));
            }
            let mut dir = mm.page_table_lock();
            if dir.contains_key(&dir_index(haddr)) {
                return Err(MigrateError::InvalidArgument(format!(
                    "{haddr:#x} is already populated"
                )));
            }
            f.get();
            add_rmap(mem, frame, self, haddr);
            dir.insert(dir_index(haddr), DirEntry::Huge { frame, perms });
            return Ok(());
        }

        let table = mm
            .leaf_table(addr, true)
            .ok_or_else(|| MigrateError::InvalidArgument(format!("{addr:#x} is mapped huge")))?;
        let mut entries = table.lock();
        let slot = &mut entries[leaf_index(addr)];
        if *slot != LeafEntry::Absent {
            return Err(MigrateError::InvalidArgument(format!(
                "{addr:#x} is already mapped"
            )));
        }
        f.get();
        add_rmap(mem, frame, self, addr);
        *slot = LeafEntry::Present { frame, perms };
        Ok(())
    }

    fn check_owner(&self, mem: &PhysMemory, addr: u64, frame: FrameId) -> Result<()> {
        let owner = mem.frame(frame).owner();
        let consistent = match (&self.backing, &owner) {
            (VmaBacking::Anon(_), Owner::None) => true,
            (VmaBacking::Anon(chain), Owner::Anon { chain: owned, index }) => {
                Arc::ptr_eq(chain, owned) && *index == self.index_of(addr)
            }
            (VmaBacking::File(store), Owner::File { store: owned, index }) => {
                Arc::ptr_eq(store, owned) && *index == self.index_of(addr)
            }
            _ => false,
        };
        if consistent {
            Ok(())
        } else {
            Err(MigrateError::InvalidArgument(format!(
                "{frame} cannot be mapped at {addr:#x}"
            )))
        }
    }

    /// Zap the base-page translation at `addr`
    pub fn unmap_frame(&self, mem: &PhysMemory, addr: u64) -> Result<FrameId> {
        let mm = self.mm().ok_or(MigrateError::Fault(addr))?;
        let table = mm.leaf_table(addr, false).ok_or(MigrateError::NoEntry(addr))?;
        let frame = {
            let mut entries = table.lock();
            let slot = &mut entries[leaf_index(addr)];
            let LeafEntry::Present { frame, .. } = *slot else {
                return Err(MigrateError::NoEntry(addr));
            };
            *slot = LeafEntry::Absent;
            remove_rmap(mem, frame);
            frame
        };
        mm.flush_tlb_page(addr);
        mem.put(frame);
        Ok(frame)
    }
}

/// An address space
#[derive(Debug, Default)]
pub struct AddressSpace {
    directory: Mutex<BTreeMap<u64, DirEntry>>,
    vmas: RwLock<Vec<Arc<Vma>>>,
    tlb_flushes: AtomicU64,
}

impl AddressSpace {
    /// Create an empty address space
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the page-table lock guarding the directory
    #[inline]
    pub fn page_table_lock(&self) -> MutexGuard<'_, BTreeMap<u64, DirEntry>> {
        self.directory.lock()
    }

    /// Directory entry covering `addr`
    pub fn dir_entry(&self, addr: u64) -> Option<DirEntry> {
        self.directory.lock().get(&dir_index(addr)).cloned()
    }

    /// Leaf table covering `addr`.
    ///
    /// Returns `None` when the directory maps a huge unit there, or when no
    /// table exists and `create` is false.
    pub fn leaf_table(&self, addr: u64, create: bool) -> Option<Arc<LeafTable>> {
        let mut dir = self.directory.lock();
        match dir.get(&dir_index(addr)) {
            Some(DirEntry::Table(table)) => Some(Arc::clone(table)),
            Some(_) => None,
            None if create => {
                let table = Arc::new(LeafTable::new());
                dir.insert(dir_index(addr), DirEntry::Table(Arc::clone(&table)));
                Some(table)
            }
            None => None,
        }
    }

    /// Leaf translation at `addr`
    pub fn read_leaf(&self, addr: u64) -> LeafEntry {
        self.leaf_table(addr, false)
            .map(|table| table.lock()[leaf_index(addr)])
            .unwrap_or_default()
    }

    /// Invalidate the cached translation of `addr`
    #[inline]
    pub fn flush_tlb_page(&self, _addr: u64) {
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Cached-translation invalidations so far
    #[inline]
    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }

    /// Mapping containing `addr`
    pub fn find_vma(&self, addr: u64) -> Option<Arc<Vma>> {
        self.vmas.read().iter().find(|v| v.contains(addr)).cloned()
    }

    fn insert_vma(self: &Arc<Self>, vma: Vma) -> Result<Arc<Vma>> {
        if vma.start >= vma.end || vma.start % PAGE_SIZE as u64 != 0 {
            return Err(MigrateError::InvalidArgument(format!(
                "bad mapping range {:#x}..{:#x}",
                vma.start, vma.end
            )));
        }
        let mut vmas = self.vmas.write();
        if vmas.iter().any(|v| v.start < vma.end && vma.start < v.end) {
            return Err(MigrateError::InvalidArgument(format!(
                "mapping {:#x}..{:#x} overlaps",
                vma.start, vma.end
            )));
        }
        let vma = Arc::new(vma);
        vmas.push(Arc::clone(&vma));
        Ok(vma)
    }

    /// Create a private anonymous mapping of `pages` base pages
    pub fn map_anon(self: &Arc<Self>, start: u64, pages: u64, prot: Perms) -> Result<Arc<Vma>> {
        let chain = AnonChain::new();
        let vma = self.insert_vma(Vma {
            mm: Arc::downgrade(self),
            start,
            end: start + pages * PAGE_SIZE as u64,
            pgoff: start >> PAGE_SHIFT,
            prot,
            backing: VmaBacking::Anon(Arc::clone(&chain)),
        })?;
        chain.link(&vma);
        Ok(vma)
    }

    /// Duplicate an anonymous mapping of another address space into this
    /// one, sharing its reverse-map chain
    pub fn fork_anon(self: &Arc<Self>, parent: &Vma) -> Result<Arc<Vma>> {
        let VmaBacking::Anon(chain) = &parent.backing else {
            return Err(MigrateError::InvalidArgument(
                "not an anonymous mapping".to_string(),
            ));
        };
        let vma = self.insert_vma(Vma {
            mm: Arc::downgrade(self),
            start: parent.start,
            end: parent.end,
            pgoff: parent.pgoff,
            prot: parent.prot,
            backing: VmaBacking::Anon(Arc::clone(chain)),
        })?;
        chain.link(&vma);
        Ok(vma)
    }

    /// Map `pages` pages of `store` starting at page `pgoff`
    pub fn map_file(
        self: &Arc<Self>,
        store: &Arc<BackingStore>,
        start: u64,
        pages: u64,
        pgoff: u64,
        prot: Perms,
    ) -> Result<Arc<Vma>> {
        let vma = self.insert_vma(Vma {
            mm: Arc::downgrade(self),
            start,
            end: start + pages * PAGE_SIZE as u64,
            pgoff,
            prot,
            backing: VmaBacking::File(Arc::clone(store)),
        })?;
        store.add_mapping(&vma);
        Ok(vma)
    }
}
