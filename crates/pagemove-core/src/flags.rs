//! Frame, permission and allocation flag sets

use bitflags::bitflags;

bitflags! {
    /// State bits of a frame descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u32 {
        /// Exclusive lock protecting identity transitions
        const LOCKED = 1 << 0;
        const ERROR = 1 << 1;
        const REFERENCED = 1 << 2;
        const UPTODATE = 1 << 3;
        const DIRTY = 1 << 4;
        /// On a reclaim list
        const LRU = 1 << 5;
        const ACTIVE = 1 << 6;
        /// Never migrated or reported
        const RESERVED = 1 << 7;
        /// Private state (block buffers) attached
        const PRIVATE = 1 << 8;
        const WRITEBACK = 1 << 9;
        const SWAP_CACHE = 1 << 10;
        const SWAP_BACKED = 1 << 11;
        const UNEVICTABLE = 1 << 12;
        /// Pinned in physical memory
        const MLOCKED = 1 << 13;
        const CHECKED = 1 << 14;
        const MAPPED_TO_DISK = 1 << 15;
        /// Same-content merged frame
        const KSM = 1 << 16;
        /// Relocated through a delegated movable-object protocol
        const BALLOON = 1 << 17;
        /// Head of a compound (huge) frame
        const HEAD = 1 << 18;
        /// Compound frame owned by the explicit huge-page pool
        const HUGETLB = 1 << 19;
    }
}

bitflags! {
    /// Protection and status bits of a translation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const ACCESSED = 1 << 4;
        const DIRTY = 1 << 5;
    }
}

impl Perms {
    /// User read/write, the common data mapping
    pub const RW: Perms = Perms::READ.union(Perms::WRITE).union(Perms::USER);

    /// User read-only
    pub const RO: Perms = Perms::READ.union(Perms::USER);
}

bitflags! {
    /// Frame allocation modifiers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u8 {
        /// Only the requested partition may satisfy the allocation
        const THIS_NODE = 1 << 0;
        /// Do not log allocation failures
        const NO_WARN = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by the bulk move request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MoveFlags: u32 {
        /// Move frames mapped only by the target address space
        const MOVE = 1 << 1;
        /// Also move frames shared with other mappings
        const MOVE_ALL = 1 << 2;
    }
}
