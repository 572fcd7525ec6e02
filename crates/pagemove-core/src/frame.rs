//! Physical frame descriptors
//!
//! A [`Frame`] carries everything the migration core inspects or transfers:
//! reference and mapping counts, the flag word, the exclusive lock bit with
//! its wait queue, the owner identity and the frame's bytes.
//!
//! # Reference counting
//!
//! The count is the sole arbiter of deallocation. Cache slots, live mappings,
//! reclaim isolation, attached block buffers and transient pins each hold one
//! reference. During slot relocation the count is *frozen*: it is atomically
//! swapped to zero against an expected value, which makes every
//! `get_unless_zero` fail until it is unfrozen.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::buffers::BufferRing;
use crate::cache::BackingStore;
use crate::flags::FrameFlags;
use crate::page::{pages_in_order, FrameId, PartitionId, HPAGE_ORDER};
use crate::rmap::AnonChain;

/// Identity of a frame's contents
#[derive(Clone, Default)]
pub enum Owner {
    /// Free, or allocated but not yet mapped or cached
    #[default]
    None,
    /// Anonymous memory reachable through a reverse-map chain
    Anon {
        /// Chain listing every mapping that may map the frame
        chain: Arc<AnonChain>,
        /// Linear page index used to locate the frame in each mapping
        index: u64,
    },
    /// Cache-indexed frame of a backing store
    File {
        /// Owning store
        store: Arc<BackingStore>,
        /// Offset of the frame in the store, in pages
        index: u64,
    },
}

impl Owner {
    /// Whether this is an anonymous owner
    #[inline]
    pub fn is_anon(&self) -> bool {
        matches!(self, Owner::Anon { .. })
    }

    /// Page index within the owner
    pub fn index(&self) -> Option<u64> {
        match self {
            Owner::None => None,
            Owner::Anon { index, .. } | Owner::File { index, .. } => Some(*index),
        }
    }
}

impl std::fmt::Debug for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::None => write!(f, "None"),
            Owner::Anon { index, .. } => write!(f, "Anon({index})"),
            Owner::File { store, index } => write!(f, "File({:?}, {index})", store.kind()),
        }
    }
}

/// Metadata guarded by the descriptor's metadata lock
#[derive(Debug, Default)]
pub struct FrameMeta {
    /// Content identity
    pub owner: Owner,
    /// Private word: the swap entry of a swap-cached frame
    pub private: u64,
    /// Block buffers attached as private state
    pub buffers: Option<Arc<BufferRing>>,
    /// Partition that last touched the frame
    pub last_partition: Option<PartitionId>,
}

/// Physical frame descriptor
pub struct Frame {
    id: FrameId,
    partition: PartitionId,
    zone: usize,
    order: AtomicU8,
    flags: AtomicU32,
    refcount: AtomicU32,
    mapcount: AtomicU32,
    meta: Mutex<FrameMeta>,
    content: RwLock<Vec<u8>>,
    waitq: Mutex<()>,
    wake: Condvar,
}

impl Frame {
    pub(crate) fn new(id: FrameId, partition: PartitionId, zone: usize) -> Self {
        Self {
            id,
            partition,
            zone,
            order: AtomicU8::new(0),
            flags: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
            mapcount: AtomicU32::new(0),
            meta: Mutex::new(FrameMeta::default()),
            content: RwLock::new(Vec::new()),
            waitq: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Frame identifier
    #[inline]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Residency partition
    #[inline]
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    #[inline]
    pub(crate) fn zone(&self) -> usize {
        self.zone
    }

    /// Compound order (0 for a base page)
    #[inline]
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Acquire)
    }

    /// Number of base pages this frame spans
    #[inline]
    pub fn nr_pages(&self) -> usize {
        pages_in_order(self.order())
    }

    /// Whether the frame is a compound unit of huge order
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.order() == HPAGE_ORDER
    }

    /// Transparent huge frame (not from the explicit huge pool)
    #[inline]
    pub fn is_trans_huge(&self) -> bool {
        self.is_huge() && !self.test(FrameFlags::HUGETLB)
    }

    /// Frame from the explicit huge pool
    #[inline]
    pub fn is_hugetlb(&self) -> bool {
        self.test(FrameFlags::HUGETLB)
    }

    // ---- flags ----

    /// Current flag word
    #[inline]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Test whether every bit of `flag` is set
    #[inline]
    pub fn test(&self, flag: FrameFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Set flag bits
    #[inline]
    pub fn set(&self, flag: FrameFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    /// Clear flag bits
    #[inline]
    pub fn clear(&self, flag: FrameFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Clear flag bits, returning whether they were set
    #[inline]
    pub fn test_and_clear(&self, flag: FrameFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        old & flag.bits() == flag.bits()
    }

    /// Set flag bits, returning whether they were already set
    #[inline]
    pub fn test_and_set(&self, flag: FrameFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        old & flag.bits() == flag.bits()
    }

    // ---- lock bit ----

    /// Try to take the frame lock without blocking
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.test_and_set(FrameFlags::LOCKED)
    }

    /// Take the frame lock, sleeping until it is released
    pub fn lock(&self) {
        while !self.try_lock() {
            self.wait_on(FrameFlags::LOCKED);
        }
    }

    /// Release the frame lock and wake waiters
    pub fn unlock(&self) {
        self.clear_and_wake(FrameFlags::LOCKED);
    }

    /// Whether the frame lock is held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.test(FrameFlags::LOCKED)
    }

    /// Block until the frame lock is released, without taking it
    pub fn wait_unlocked(&self) {
        self.wait_on(FrameFlags::LOCKED);
    }

    /// Block while `flag` is set
    pub fn wait_on(&self, flag: FrameFlags) {
        let mut guard = self.waitq.lock();
        while self.test(flag) {
            self.wake.wait(&mut guard);
        }
    }

    /// Clear `WRITEBACK` and wake waiters
    pub fn end_writeback(&self) {
        self.clear_and_wake(FrameFlags::WRITEBACK);
    }

    fn clear_and_wake(&self, flag: FrameFlags) {
        {
            let _guard = self.waitq.lock();
            self.clear(flag);
        }
        self.wake.notify_all();
    }

    // ---- reference count ----

    /// Current reference count (zero while frozen)
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Take a reference on a frame already known to be live
    #[inline]
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a reference unless the count is zero (freed or frozen)
    pub fn get_unless_zero(&self) -> bool {
        let mut count = self.refcount.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Drop a reference, returning true when it was the last one
    #[inline]
    pub(crate) fn put_testzero(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Atomically swap the count from `expected` to zero
    pub fn freeze(&self, expected: u32) -> bool {
        self.refcount
            .compare_exchange(expected, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Restore a frozen count
    pub fn unfreeze(&self, count: u32) {
        self.refcount.store(count, Ordering::Release);
    }

    // ---- mapping count ----

    /// Number of translations mapping this frame
    #[inline]
    pub fn mapcount(&self) -> u32 {
        self.mapcount.load(Ordering::Acquire)
    }

    /// Whether any translation maps this frame
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapcount() > 0
    }

    /// Returns true for the first mapping
    #[inline]
    pub(crate) fn inc_mapcount(&self) -> bool {
        self.mapcount.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Returns true when the last mapping went away
    #[inline]
    pub(crate) fn dec_mapcount(&self) -> bool {
        self.mapcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    // ---- metadata ----

    /// Lock the metadata
    #[inline]
    pub fn meta(&self) -> MutexGuard<'_, FrameMeta> {
        self.meta.lock()
    }

    /// Clone of the current owner
    pub fn owner(&self) -> Owner {
        self.meta.lock().owner.clone()
    }

    /// Whether the frame belongs to anonymous memory
    pub fn is_anon(&self) -> bool {
        self.meta.lock().owner.is_anon()
    }

    /// Whether the frame has no owner at all
    pub fn has_no_owner(&self) -> bool {
        matches!(self.meta.lock().owner, Owner::None)
    }

    /// Page-cache (not swap-backed) frame
    #[inline]
    pub fn is_file_cache(&self) -> bool {
        !self.test(FrameFlags::SWAP_BACKED)
    }

    /// Private word
    pub fn private(&self) -> u64 {
        self.meta.lock().private
    }

    /// Attached block buffers
    pub fn buffers(&self) -> Option<Arc<BufferRing>> {
        self.meta.lock().buffers.clone()
    }

    /// Partition that last touched the frame
    pub fn last_partition(&self) -> Option<PartitionId> {
        self.meta.lock().last_partition
    }

    /// Record the partition touching the frame, returning the previous one
    pub fn xchg_last_partition(&self, partition: Option<PartitionId>) -> Option<PartitionId> {
        std::mem::replace(&mut self.meta.lock().last_partition, partition)
    }

    // ---- content ----

    /// Read access to the frame bytes
    #[inline]
    pub fn content(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.content.read()
    }

    /// Write access to the frame bytes
    #[inline]
    pub fn content_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.content.write()
    }

    /// Fill the frame bytes from `data`, starting at `offset`
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> bool {
        let mut content = self.content.write();
        match content.get_mut(offset..offset + data.len()) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Copy of the frame bytes in `offset..offset + len`
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        self.content
            .read()
            .get(offset..offset + len)
            .map(|bytes| bytes.to_vec())
    }

    // ---- lifecycle ----

    pub(crate) fn init(&self, order: u8, size: usize) {
        self.order.store(order, Ordering::Release);
        let head = if order > 0 {
            FrameFlags::HEAD.bits()
        } else {
            0
        };
        self.flags.store(head, Ordering::Release);
        self.mapcount.store(0, Ordering::Release);
        *self.meta.lock() = FrameMeta::default();
        *self.content.write() = vec![0; size];
        self.refcount.store(1, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        *self.meta.lock() = FrameMeta::default();
        *self.content.write() = Vec::new();
        self.mapcount.store(0, Ordering::Release);
        self.order.store(0, Ordering::Release);
        {
            let _guard = self.waitq.lock();
            self.flags.store(0, Ordering::Release);
        }
        self.wake.notify_all();
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("order", &self.order())
            .field("flags", &self.flags())
            .field("refcount", &self.refcount())
            .field("mapcount", &self.mapcount())
            .finish()
    }
}
