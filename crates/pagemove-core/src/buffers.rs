//! Block buffers attached to a frame as private state
//!
//! The ring is locked in order. In `Async` mode a contended buffer makes the
//! whole acquisition fail and every lock taken so far is released again.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::driver::MigrateMode;
use crate::page::FrameId;

/// One block buffer
#[derive(Debug)]
pub struct BufferHead {
    locked: Mutex<bool>,
    unlocked: Condvar,
    count: AtomicU32,
    frame: AtomicU32,
}

impl BufferHead {
    fn new(frame: FrameId) -> Self {
        Self {
            locked: Mutex::new(false),
            unlocked: Condvar::new(),
            count: AtomicU32::new(0),
            frame: AtomicU32::new(frame.raw()),
        }
    }

    /// Try to lock without blocking
    pub fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock();
        if *locked {
            return false;
        }
        *locked = true;
        true
    }

    /// Lock, sleeping while someone else holds it
    pub fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.unlocked.wait(&mut locked);
        }
        *locked = true;
    }

    /// Unlock and wake one waiter
    pub fn unlock(&self) {
        *self.locked.lock() = false;
        self.unlocked.notify_one();
    }

    /// Whether the buffer is locked
    pub fn is_locked(&self) -> bool {
        *self.locked.lock()
    }

    /// Take a reference on the buffer
    #[inline]
    pub fn get(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference on the buffer
    #[inline]
    pub fn put(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Outstanding references
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Frame this buffer points into
    #[inline]
    pub fn frame(&self) -> FrameId {
        FrameId::new(self.frame.load(Ordering::Acquire))
    }
}

/// The circular list of buffers covering one frame
#[derive(Debug)]
pub struct BufferRing {
    heads: Vec<BufferHead>,
}

impl BufferRing {
    pub(crate) fn new(frame: FrameId, count: usize) -> Self {
        Self {
            heads: (0..count.max(1)).map(|_| BufferHead::new(frame)).collect(),
        }
    }

    /// Buffers in ring order
    #[inline]
    pub fn heads(&self) -> &[BufferHead] {
        &self.heads
    }

    /// Number of buffers
    #[inline]
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Rings always hold at least one buffer
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Whether any buffer is locked or referenced
    pub fn is_busy(&self) -> bool {
        self.heads.iter().any(|bh| bh.is_locked() || bh.count() > 0)
    }

    /// Lock every buffer, taking a reference on each.
    ///
    /// Blocks unless `mode` is `Async`. In `Async` mode the first contended
    /// buffer fails the call and every buffer locked before it is unlocked
    /// and released.
    pub fn lock_all(&self, mode: MigrateMode) -> bool {
        if mode != MigrateMode::Async {
            for bh in &self.heads {
                bh.get();
                bh.lock();
            }
            return true;
        }

        for (i, bh) in self.heads.iter().enumerate() {
            bh.get();
            if !bh.try_lock() {
                bh.put();
                for taken in &self.heads[..i] {
                    taken.unlock();
                    taken.put();
                }
                return false;
            }
        }
        true
    }

    /// Unlock and release every buffer locked by [`lock_all`](Self::lock_all)
    pub fn unlock_all(&self) {
        for bh in &self.heads {
            bh.unlock();
            bh.put();
        }
    }

    /// Point every buffer at a new frame
    pub fn retarget(&self, frame: FrameId) {
        for bh in &self.heads {
            bh.frame.store(frame.raw(), Ordering::Release);
        }
    }
}
