//! # Pagemove Core
//!
//! Live relocation of physical frames while they stay mapped and cached.
//!
//! ## Features
//!
//! - **Placeholder translations**: mappings are swapped for migration
//!   placeholders while a frame moves, and faulting threads wait on them
//! - **Cache-slot relocation**: backing stores swap their index slot under
//!   one lock with a frozen reference count
//! - **Pluggable relocators**: generic, buffered, delegated and refusing
//!   capabilities, with a write-out fallback for dirty frames
//! - **Batch driver**: bounded multi-pass migration with retry accounting
//! - **Locality moves**: rate-limited migration of misplaced frames,
//!   including whole huge frames swapped at directory level
//! - **Bulk requests**: per-address move and status queries

#![warn(clippy::all)]

pub mod buffers;
pub mod cache;
pub mod charge;
pub mod config;
pub mod copy;
pub mod error;
pub mod flags;
pub mod frame;
pub mod memory;
pub mod page;
pub mod partition;
pub mod placeholder;
pub mod reclaim;
pub mod relocate;
pub mod rmap;
pub mod stats;
pub mod vm;

// Migration engine
pub mod driver;
pub mod fault;
pub mod locality;
pub mod machine;
pub mod request;

// Re-exports
pub use cache::{BackingStore, StoreKind, WritePage};
pub use charge::{ChargeHook, ChargeToken, NoCharge};
pub use config::{LocalityConfig, MigrateConfig};
pub use driver::{MigrateMode, MigrateReason, Migrator, NewFrame};
pub use error::{FaultError, MigrateError, Result, RetryReason};
pub use fault::{resolve, Access, FramePin};
pub use flags::{AllocFlags, FrameFlags, MoveFlags, Perms};
pub use machine::{Migrated, MigrationPhase};
pub use memory::{MemoryConfig, PartitionConfig, PhysMemory, ZoneConfig};
pub use page::{FrameId, PartitionId, HPAGE_NR, HPAGE_ORDER, PAGE_SIZE};
pub use reclaim::{LruLists, ReclaimList, ReclaimScope};
pub use relocate::{
    BufferedRelocator, DelegatedRelocator, GenericRelocator, MovableProtocol, RefusingRelocator,
    Relocatable, RelocateCtx,
};
pub use request::{move_pages, PageStatus};
pub use stats::{MigrationStats, StatsSnapshot};
pub use vm::{AddressSpace, DirEntry, LeafEntry, Vma};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
