//! Reference fault handler
//!
//! Resolves an address to a pinned frame the way a fault path would:
//! translations are read under their table lock and the frame is pinned
//! before the lock is dropped. A migration placeholder sends the thread to
//! the wait primitive, after which the walk restarts from the directory.

use std::sync::Arc;

use crate::error::FaultError;
use crate::flags::Perms;
use crate::memory::PhysMemory;
use crate::page::{dir_index, leaf_index, FrameId};
use crate::placeholder::{migration_entry_wait, migration_entry_wait_huge};
use crate::vm::{AddressSpace, DirEntry, LeafEntry};

/// Kind of access being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Load
    Read,
    /// Store
    Write,
}

/// A frame pinned by a resolved fault; the reference is dropped with it
#[derive(Debug)]
pub struct FramePin {
    mem: Arc<PhysMemory>,
    frame: FrameId,
    writable: bool,
}

impl FramePin {
    /// The pinned frame
    #[inline]
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    /// Read `len` bytes at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        self.mem.frame(self.frame).read_bytes(offset, len)
    }

    /// Write `data` at `offset`, dirtying the frame.
    ///
    /// Fails for pins resolved for reading and for out-of-range writes.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        if !self.writable || !self.mem.frame(self.frame).write_bytes(offset, data) {
            return false;
        }
        self.mem.set_dirty(self.frame);
        true
    }
}

impl Drop for FramePin {
    fn drop(&mut self) {
        self.mem.put(self.frame);
    }
}

/// Resolve `addr` in `mm` for `access`, waiting out in-flight migrations
pub fn resolve(
    mem: &Arc<PhysMemory>,
    mm: &AddressSpace,
    addr: u64,
    access: Access,
) -> Result<FramePin, FaultError> {
    loop {
        let table = {
            let dir = mm.page_table_lock();
            match dir.get(&dir_index(addr)) {
                None => return Err(FaultError::NotMapped(addr)),
                Some(DirEntry::Huge { frame, perms }) => {
                    if let Some(pin) = pin(mem, *frame, *perms, addr, access)? {
                        return Ok(pin);
                    }
                    continue;
                }
                Some(DirEntry::MigrationPlaceholder { .. }) => None,
                Some(DirEntry::Table(table)) => Some(Arc::clone(table)),
            }
        };
        let Some(table) = table else {
            migration_entry_wait_huge(mem, mm, addr);
            continue;
        };

        let placeholder = {
            let entries = table.lock();
            match entries[leaf_index(addr)] {
                LeafEntry::Absent => return Err(FaultError::NotMapped(addr)),
                LeafEntry::Present { frame, perms } => {
                    if let Some(pin) = pin(mem, frame, perms, addr, access)? {
                        return Ok(pin);
                    }
                    false
                }
                LeafEntry::MigrationPlaceholder { .. } => true,
            }
        };
        if placeholder {
            migration_entry_wait(mem, mm, addr);
        }
    }
}

/// Pin a present translation; `None` when the frame is frozen and the walk
/// has to restart
fn pin(
    mem: &Arc<PhysMemory>,
    frame: FrameId,
    perms: Perms,
    addr: u64,
    access: Access,
) -> Result<Option<FramePin>, FaultError> {
    let writable = access == Access::Write;
    if writable && !perms.contains(Perms::WRITE) {
        return Err(FaultError::Protection(addr));
    }
    if !mem.frame(frame).get_unless_zero() {
        return Ok(None);
    }
    Ok(Some(FramePin {
        mem: Arc::clone(mem),
        frame,
        writable,
    }))
}
