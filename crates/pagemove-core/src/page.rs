//! Frame and partition identifiers, page geometry
//!
//! This module defines the identifiers shared by every other part of the
//! migration core.

use serde::{Deserialize, Serialize};

/// log2 of the base page size
pub const PAGE_SHIFT: u32 = 12;

/// Base page size: 4KB
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Order of a huge (directory-level) frame
pub const HPAGE_ORDER: u8 = 9;

/// Base pages per huge frame
pub const HPAGE_NR: usize = 1 << HPAGE_ORDER;

/// Huge frame size: 2MB
pub const HPAGE_SIZE: usize = PAGE_SIZE << HPAGE_ORDER;

/// Leaf entries per leaf table
pub const ENTRIES_PER_TABLE: usize = 512;

/// Unique identifier for a physical frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    /// Create a new frame ID
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for FrameId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame({})", self.0)
    }
}

/// Identifier of a memory partition (NUMA-style residency domain)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PartitionId(pub u16);

impl PartitionId {
    /// Create a new partition ID
    #[inline]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Number of base pages in a frame of the given order
#[inline]
pub const fn pages_in_order(order: u8) -> usize {
    1 << order
}

/// Round an address down to its base page
#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !((PAGE_SIZE as u64) - 1)
}

/// Round an address down to its huge frame
#[inline]
pub const fn huge_align_down(addr: u64) -> u64 {
    addr & !((HPAGE_SIZE as u64) - 1)
}

/// Directory slot covering an address
#[inline]
pub(crate) const fn dir_index(addr: u64) -> u64 {
    addr >> (PAGE_SHIFT + HPAGE_ORDER as u32)
}

/// Leaf slot of an address within its table
#[inline]
pub(crate) const fn leaf_index(addr: u64) -> usize {
    ((addr >> PAGE_SHIFT) as usize) & (ENTRIES_PER_TABLE - 1)
}
