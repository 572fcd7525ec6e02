//! Backing stores and their cache index
//!
//! Every store keeps an offset-to-frame index behind a single lock. Slots are
//! only read and swapped under that lock. A store also declares how its
//! frames are relocated and, optionally, how dirty frames are written back.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{MigrateError, Result};
use crate::flags::FrameFlags;
use crate::frame::Owner;
use crate::memory::PhysMemory;
use crate::page::FrameId;
use crate::partition::PartitionStat;
use crate::relocate::Relocatable;
use crate::vm::Vma;

/// Kind of backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Regular file
    File,
    /// Shared anonymous memory
    Shmem,
    /// The swap cache
    Swap,
    /// Frames lent to a balloon device
    Balloon,
}

/// Write path for dirty frames.
///
/// Called with the frame locked; implementations must not unlock it.
pub trait WritePage: Send + Sync {
    /// Write the frame's bytes to backing storage
    fn writepage(&self, mem: &PhysMemory, frame: FrameId) -> io::Result<()>;
}

/// Slots of a store, guarded by the index lock
#[derive(Debug, Default)]
pub struct CacheIndex {
    slots: HashMap<u64, FrameId>,
    dirty: HashSet<u64>,
}

impl CacheIndex {
    /// Frame in slot `key`
    #[inline]
    pub fn get(&self, key: u64) -> Option<FrameId> {
        self.slots.get(&key).copied()
    }

    /// Whether slot `key` is occupied
    #[inline]
    pub fn contains(&self, key: u64) -> bool {
        self.slots.contains_key(&key)
    }

    /// Occupied slots
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot is occupied
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn insert(&mut self, key: u64, frame: FrameId) -> Option<FrameId> {
        self.slots.insert(key, frame)
    }

    pub(crate) fn remove(&mut self, key: u64) -> Option<FrameId> {
        self.dirty.remove(&key);
        self.slots.remove(&key)
    }
}

/// A backing store: file, shmem segment, swap or balloon
pub struct BackingStore {
    kind: StoreKind,
    index: Mutex<CacheIndex>,
    mappings: RwLock<Vec<Weak<Vma>>>,
    relocator: Option<Arc<dyn Relocatable>>,
    writeback: Option<Arc<dyn WritePage>>,
}

impl BackingStore {
    /// Create a store with no relocation capability and no write path
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            index: Mutex::new(CacheIndex::default()),
            mappings: RwLock::new(Vec::new()),
            relocator: None,
            writeback: None,
        }
    }

    /// Declare the store's relocation capability
    pub fn with_relocator(mut self, relocator: Arc<dyn Relocatable>) -> Self {
        self.relocator = Some(relocator);
        self
    }

    /// Attach a write path
    pub fn with_writeback(mut self, writeback: Arc<dyn WritePage>) -> Self {
        self.writeback = Some(writeback);
        self
    }

    /// Store kind
    #[inline]
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// Declared relocation capability
    #[inline]
    pub fn relocator(&self) -> Option<&Arc<dyn Relocatable>> {
        self.relocator.as_ref()
    }

    /// Write path, if any
    #[inline]
    pub fn writeback(&self) -> Option<&Arc<dyn WritePage>> {
        self.writeback.as_ref()
    }

    /// Take the index lock
    #[inline]
    pub fn lock_index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock()
    }

    /// Frame currently in slot `key`
    pub fn lookup(&self, key: u64) -> Option<FrameId> {
        self.index.lock().get(key)
    }

    /// Look up slot `key` and take a reference on its frame.
    ///
    /// Fails while the frame's count is frozen by a relocation.
    pub fn find_get(&self, mem: &PhysMemory, key: u64) -> Option<FrameId> {
        let index = self.index.lock();
        let id = index.get(key)?;
        mem.frame(id).get_unless_zero().then_some(id)
    }

    /// Insert a frame at `key`, making the store its owner
    pub fn add_frame(self: &Arc<Self>, mem: &PhysMemory, frame: FrameId, key: u64) -> Result<()> {
        let f = mem.frame(frame);
        if !f.has_no_owner() {
            return Err(MigrateError::InvalidArgument(format!(
                "{frame} already has an owner"
            )));
        }
        {
            let mut index = self.index.lock();
            if index.contains(key) {
                return Err(MigrateError::InvalidArgument(format!(
                    "slot {key} is occupied"
                )));
            }
            f.get();
            f.meta().owner = Owner::File {
                store: Arc::clone(self),
                index: key,
            };
            f.set(FrameFlags::UPTODATE);
            if self.kind == StoreKind::Shmem {
                f.set(FrameFlags::SWAP_BACKED);
            }
            index.insert(key, frame);
        }
        let pages = f.nr_pages() as i64;
        if self.kind != StoreKind::Balloon {
            mem.mod_frame_stat(frame, PartitionStat::FilePages, pages);
        }
        if self.kind == StoreKind::Shmem {
            mem.mod_frame_stat(frame, PartitionStat::Shmem, pages);
        }
        Ok(())
    }

    /// Remove the frame at `key`, dropping the slot's reference
    pub fn remove_frame(&self, mem: &PhysMemory, key: u64) -> Option<FrameId> {
        let id = self.index.lock().remove(key)?;
        let f = mem.frame(id);
        f.meta().owner = Owner::None;
        let pages = f.nr_pages() as i64;
        if self.kind != StoreKind::Balloon {
            mem.mod_frame_stat(id, PartitionStat::FilePages, -pages);
        }
        if self.kind == StoreKind::Shmem {
            mem.mod_frame_stat(id, PartitionStat::Shmem, -pages);
        }
        mem.put(id);
        Some(id)
    }

    /// Tag slot `key` dirty
    pub fn tag_dirty(&self, key: u64) {
        let mut index = self.index.lock();
        if index.contains(key) {
            index.dirty.insert(key);
        }
    }

    /// Clear the dirty tag of slot `key`
    pub fn clear_dirty_tag(&self, key: u64) {
        self.index.lock().dirty.remove(&key);
    }

    /// Whether slot `key` is tagged dirty
    pub fn is_tagged_dirty(&self, key: u64) -> bool {
        self.index.lock().dirty.contains(&key)
    }

    /// Register a file mapping of this store
    pub fn add_mapping(&self, vma: &Arc<Vma>) {
        let mut mappings = self.mappings.write();
        mappings.retain(|m| m.strong_count() > 0);
        mappings.push(Arc::downgrade(vma));
    }

    /// Live mappings of this store
    pub fn mappings(&self) -> Vec<Arc<Vma>> {
        self.mappings
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl std::fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingStore")
            .field("kind", &self.kind)
            .field("slots", &self.index.lock().len())
            .field("relocator", &self.relocator.is_some())
            .field("writeback", &self.writeback.is_some())
            .finish()
    }
}
