//! Bulk move request
//!
//! Moves the frames behind a list of addresses of one address space to the
//! requested partitions, or reports where they currently reside. Requests
//! are processed in fixed-size chunks; each chunk is resolved, isolated and
//! handed to the batch driver as a unit.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::driver::{MigrateMode, MigrateReason, Migrator, NewFrame};
use crate::error::{MigrateError, Result};
use crate::flags::{AllocFlags, FrameFlags, MoveFlags};
use crate::memory::PhysMemory;
use crate::page::{dir_index, leaf_index, FrameId, PartitionId};
use crate::partition::Partition;
use crate::vm::{AddressSpace, DirEntry, LeafEntry};

/// Entries resolved and migrated together
pub const MOVE_CHUNK: usize = 169;

/// Entries resolved together by a status query
pub const STAT_CHUNK: usize = 16;

/// Per-address outcome of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStatus {
    /// The frame resides on this partition
    Resident(PartitionId),
    /// The address could not be moved or queried
    Failed(MigrateError),
}

impl PageStatus {
    /// Partition id, or a negative error code
    pub fn code(&self) -> i32 {
        match self {
            PageStatus::Resident(partition) => i32::from(partition.raw()),
            PageStatus::Failed(err) => err.errno(),
        }
    }
}

/// Move the frames mapped at `addrs` to `targets`, or report their
/// partitions when `targets` is `None`.
///
/// `flags` is the raw [`MoveFlags`] word; unknown bits are rejected. A
/// missing or memoryless target partition aborts the request with
/// [`MigrateError::NoDevice`], leaving earlier chunks moved.
pub fn move_pages(
    migrator: &Migrator,
    mm: &AddressSpace,
    addrs: &[u64],
    targets: Option<&[PartitionId]>,
    flags: u32,
) -> Result<Vec<PageStatus>> {
    let flags = MoveFlags::from_bits(flags)
        .ok_or_else(|| MigrateError::InvalidArgument(format!("unknown move flags {flags:#x}")))?;

    let Some(targets) = targets else {
        return Ok(pages_stat(migrator.memory(), mm, addrs));
    };
    if targets.len() != addrs.len() {
        return Err(MigrateError::InvalidArgument(format!(
            "{} addresses but {} targets",
            addrs.len(),
            targets.len()
        )));
    }

    debug!(pages = addrs.len(), ?flags, "move request");
    let migrate_all = flags.contains(MoveFlags::MOVE_ALL);
    let mut status = Vec::with_capacity(addrs.len());
    for (addrs, targets) in addrs.chunks(MOVE_CHUNK).zip(targets.chunks(MOVE_CHUNK)) {
        for &target in targets {
            let usable = migrator
                .memory()
                .partition(target)
                .is_some_and(Partition::has_memory);
            if !usable {
                return Err(MigrateError::NoDevice(target));
            }
        }
        status.extend(move_chunk(migrator, mm, addrs, targets, migrate_all)?);
    }
    Ok(status)
}

fn move_chunk(
    migrator: &Migrator,
    mm: &AddressSpace,
    addrs: &[u64],
    targets: &[PartitionId],
    migrate_all: bool,
) -> Result<Vec<PageStatus>> {
    let mem = migrator.memory();
    let mut status = Vec::with_capacity(addrs.len());
    let mut slots = HashMap::new();
    let mut list = Vec::new();

    for (slot, (&addr, &target)) in addrs.iter().zip(targets).enumerate() {
        match isolate_for_move(migrator, mm, addr, target, migrate_all) {
            Ok(frame) => {
                status.push(PageStatus::Resident(mem.frame(frame).partition()));
                slots.insert(frame, (slot, target));
                list.push(frame);
            }
            Err(failed) => status.push(failed),
        }
    }

    if list.is_empty() {
        return Ok(status);
    }

    let mut alloc = PageTargets {
        slots,
        status: &mut status,
    };
    let result = migrator.migrate_pages(
        &mut list,
        &mut alloc,
        MigrateMode::Sync,
        MigrateReason::Syscall,
    );
    migrator.putback_isolated(&mut list);
    result?;
    Ok(status)
}

/// Resolve and isolate the frame at `addr`, or say why it stays
fn isolate_for_move(
    migrator: &Migrator,
    mm: &AddressSpace,
    addr: u64,
    target: PartitionId,
    migrate_all: bool,
) -> std::result::Result<FrameId, PageStatus> {
    let mem = migrator.memory();
    if mm.find_vma(addr).is_none() {
        return Err(PageStatus::Failed(MigrateError::Fault(addr)));
    }
    let Some(frame) = follow_frame(mem, mm, addr) else {
        return Err(PageStatus::Failed(MigrateError::NoEntry(addr)));
    };

    let f = mem.frame(frame);
    let outcome = if f.test(FrameFlags::RESERVED) {
        Err(PageStatus::Failed(MigrateError::NoEntry(addr)))
    } else if f.partition() == target {
        Err(PageStatus::Resident(target))
    } else if f.mapcount() > 1 && !migrate_all {
        Err(PageStatus::Failed(MigrateError::Access))
    } else if !migrator.isolate(frame) {
        Err(PageStatus::Failed(MigrateError::Busy))
    } else {
        Ok(frame)
    };
    mem.put(frame);
    outcome
}

/// Frame mapped at `addr`, with a reference
fn follow_frame(mem: &PhysMemory, mm: &AddressSpace, addr: u64) -> Option<FrameId> {
    let table = {
        let dir = mm.page_table_lock();
        match dir.get(&dir_index(addr))? {
            DirEntry::Huge { frame, .. } => {
                return mem.frame(*frame).get_unless_zero().then_some(*frame);
            }
            DirEntry::MigrationPlaceholder { .. } => return None,
            DirEntry::Table(table) => Arc::clone(table),
        }
    };
    let entries = table.lock();
    match entries[leaf_index(addr)] {
        LeafEntry::Present { frame, .. } => mem.frame(frame).get_unless_zero().then_some(frame),
        LeafEntry::Absent | LeafEntry::MigrationPlaceholder { .. } => None,
    }
}

fn pages_stat(mem: &PhysMemory, mm: &AddressSpace, addrs: &[u64]) -> Vec<PageStatus> {
    let mut status = Vec::with_capacity(addrs.len());
    for chunk in addrs.chunks(STAT_CHUNK) {
        status.extend(chunk.iter().map(|&addr| page_status(mem, mm, addr)));
    }
    status
}

fn page_status(mem: &PhysMemory, mm: &AddressSpace, addr: u64) -> PageStatus {
    if mm.find_vma(addr).is_none() {
        return PageStatus::Failed(MigrateError::Fault(addr));
    }
    match follow_frame(mem, mm, addr) {
        Some(frame) => {
            let partition = mem.frame(frame).partition();
            mem.put(frame);
            PageStatus::Resident(partition)
        }
        None => PageStatus::Failed(MigrateError::NoEntry(addr)),
    }
}

/// Destinations of one chunk; outcomes land in the chunk's status slots
struct PageTargets<'a> {
    slots: HashMap<FrameId, (usize, PartitionId)>,
    status: &'a mut [PageStatus],
}

impl NewFrame for PageTargets<'_> {
    fn new_frame(&mut self, mem: &PhysMemory, source: FrameId) -> Option<FrameId> {
        let &(slot, target) = self.slots.get(&source)?;
        let frame = mem.alloc(target, mem.frame(source).order(), AllocFlags::THIS_NODE);
        if frame.is_none() {
            self.status[slot] = PageStatus::Failed(MigrateError::OutOfMemory);
        }
        frame
    }

    fn record(&mut self, source: FrameId, outcome: &Result<PartitionId>) {
        if let Some(&(slot, _)) = self.slots.get(&source) {
            self.status[slot] = match outcome {
                Ok(partition) => PageStatus::Resident(*partition),
                Err(err) => PageStatus::Failed(err.clone()),
            };
        }
    }
}
