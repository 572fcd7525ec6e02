//! Reclaim-list collaborator and isolation accounting
//!
//! List membership does not hold a reference; isolation does. The migrator
//! keeps the per-partition isolated counters in step with every isolate and
//! putback it performs.

use std::cell::Cell;
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::driver::Migrator;
use crate::flags::FrameFlags;
use crate::memory::PhysMemory;
use crate::page::FrameId;
use crate::partition::PartitionStat;
use crate::relocate::delegated_protocol;

/// Reclaim-list membership
pub trait ReclaimList: Send + Sync {
    /// Take a frame off its list, with a reference. False if it was not on one.
    fn isolate(&self, mem: &PhysMemory, frame: FrameId) -> bool;

    /// Return an isolated frame to its list, dropping the isolation reference
    fn putback(&self, mem: &PhysMemory, frame: FrameId);
}

/// One LRU list per partition
#[derive(Debug)]
pub struct LruLists {
    lists: Vec<Mutex<VecDeque<FrameId>>>,
}

impl LruLists {
    /// Lists for `partitions` partitions
    pub fn new(partitions: usize) -> Self {
        Self {
            lists: (0..partitions).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    /// Lists sized for `mem`
    pub fn for_memory(mem: &PhysMemory) -> Self {
        Self::new(mem.partitions().len())
    }

    fn list(&self, mem: &PhysMemory, frame: FrameId) -> Option<&Mutex<VecDeque<FrameId>>> {
        self.lists.get(mem.frame(frame).partition().index())
    }

    /// Add a frame to the list of its partition
    pub fn add(&self, mem: &PhysMemory, frame: FrameId) {
        let Some(list) = self.list(mem, frame) else {
            return;
        };
        let mut list = list.lock();
        mem.frame(frame).set(FrameFlags::LRU);
        if !list.contains(&frame) {
            list.push_back(frame);
        }
    }

    /// Whether a frame is currently on a list
    pub fn contains(&self, mem: &PhysMemory, frame: FrameId) -> bool {
        mem.frame(frame).test(FrameFlags::LRU)
            && self
                .list(mem, frame)
                .is_some_and(|list| list.lock().contains(&frame))
    }

    /// Frames on the list of a partition
    pub fn len(&self, partition: usize) -> usize {
        self.lists.get(partition).map_or(0, |list| list.lock().len())
    }

    /// Whether every list is empty
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(|list| list.lock().is_empty())
    }
}

impl ReclaimList for LruLists {
    fn isolate(&self, mem: &PhysMemory, frame: FrameId) -> bool {
        let Some(list) = self.list(mem, frame) else {
            return false;
        };
        let mut list = list.lock();
        let f = mem.frame(frame);
        if !f.test(FrameFlags::LRU) {
            return false;
        }
        let Some(pos) = list.iter().position(|&id| id == frame) else {
            return false;
        };
        if !f.get_unless_zero() {
            return false;
        }
        list.remove(pos);
        f.clear(FrameFlags::LRU);
        true
    }

    fn putback(&self, mem: &PhysMemory, frame: FrameId) {
        let f = mem.frame(frame);
        if f.refcount() == 1 {
            // last reference: the frame is freed instead
            mem.put(frame);
            return;
        }
        self.add(mem, frame);
        mem.put(frame);
    }
}

thread_local! {
    static IN_RECLAIM: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running memory-pressure reclaim while alive
#[derive(Debug)]
pub struct ReclaimScope {
    previous: bool,
}

impl ReclaimScope {
    /// Enter reclaim on this thread
    pub fn enter() -> Self {
        let previous = IN_RECLAIM.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for ReclaimScope {
    fn drop(&mut self) {
        IN_RECLAIM.with(|flag| flag.set(self.previous));
    }
}

/// Whether the current thread runs under reclaim
#[inline]
pub fn in_reclaim() -> bool {
    IN_RECLAIM.with(Cell::get)
}

impl Migrator {
    /// Isolate a frame for migration, accounting it as isolated.
    ///
    /// Frames with a delegated relocation protocol are isolated through it.
    pub fn isolate(&self, frame: FrameId) -> bool {
        let mem = self.memory();
        let f = mem.frame(frame);
        let store = self.owner_store(frame);
        let isolated = match store.as_deref().and_then(delegated_protocol) {
            Some(protocol) => protocol.isolate(mem, frame),
            None => self.reclaim().isolate(mem, frame),
        };
        if isolated {
            mem.mod_frame_stat(
                frame,
                PartitionStat::isolated(f.is_file_cache()),
                f.nr_pages() as i64,
            );
        }
        isolated
    }

    /// Return every frame of `list` to its reclaim list
    pub fn putback_isolated(&self, list: &mut Vec<FrameId>) {
        let mem = self.memory();
        for frame in list.drain(..) {
            self.account_putback(frame);
            self.reclaim().putback(mem, frame);
        }
    }

    /// Return every frame of `list` to its owner: frames relocated through a
    /// delegated protocol go back to that protocol, the rest to their
    /// reclaim list
    pub fn putback_movable(&self, list: &mut Vec<FrameId>) {
        for frame in list.drain(..) {
            self.putback_one(frame);
        }
    }

    /// Return one isolated frame to whoever isolated it
    pub(crate) fn putback_one(&self, frame: FrameId) {
        let mem = self.memory();
        self.account_putback(frame);
        let store = self.owner_store(frame);
        match store.as_deref().and_then(delegated_protocol) {
            Some(protocol) => protocol.putback(mem, frame),
            None => self.reclaim().putback(mem, frame),
        }
    }

    pub(crate) fn account_putback(&self, frame: FrameId) {
        let mem = self.memory();
        let f = mem.frame(frame);
        mem.mod_frame_stat(
            frame,
            PartitionStat::isolated(f.is_file_cache()),
            -(f.nr_pages() as i64),
        );
    }
}
