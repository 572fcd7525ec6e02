//! Error types for page migration
//!
//! Every step of a migration reports one of these kinds to its caller. The
//! batch driver re-queues [`MigrateError::Retry`], counts permanent failures
//! per page and aborts the whole batch on [`MigrateError::OutOfMemory`].

use thiserror::Error;

use crate::page::PartitionId;

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrateError>;

/// Why a migration attempt backed off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    /// The source frame lock is held by someone else
    LockContention,
    /// The source frame is under writeback
    Writeback,
    /// The frame is dirty and the mode does not allow writing it out
    Dirty,
    /// A dirty frame was handed to the backing store; retry once it is clean
    WrittenOut,
    /// An anonymous frame has no reachable reverse-map chain
    ChainUnavailable,
    /// Private state could not be released
    PrivateState,
    /// The reference count did not match the expected value
    RefCount,
    /// The cache slot no longer points at the source frame
    SlotMoved,
    /// A block buffer could not be locked without blocking
    BufferContention,
    /// Some mapping could not be replaced by a placeholder
    StillMapped,
    /// The destination frame was not exclusively ours
    DestinationBusy,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            RetryReason::LockContention => "frame lock contended",
            RetryReason::Writeback => "frame under writeback",
            RetryReason::Dirty => "frame dirty",
            RetryReason::WrittenOut => "frame written out",
            RetryReason::ChainUnavailable => "reverse-map chain unavailable",
            RetryReason::PrivateState => "private state busy",
            RetryReason::RefCount => "unexpected reference count",
            RetryReason::SlotMoved => "cache slot moved",
            RetryReason::BufferContention => "block buffer contended",
            RetryReason::StillMapped => "frame still mapped",
            RetryReason::DestinationBusy => "destination frame busy",
        };
        f.write_str(reason)
    }
}

/// Main error type for migration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrateError {
    /// Transient conflict; always safe to reattempt
    #[error("Retry later: {0}")]
    Retry(RetryReason),

    /// No destination frame could be allocated
    #[error("Out of memory: no destination frame")]
    OutOfMemory,

    /// The backing store failed to write the frame
    #[error("IO error: {0}")]
    Io(String),

    /// The frame type cannot be migrated
    #[error("Frame type does not support migration")]
    Unsupported,

    /// The backing store's relocation hook refused the move
    #[error("Relocation refused by backing store")]
    Refused,

    /// A dirty frame needs writeback but the store has no write path
    #[error("Backing store cannot write back dirty frame")]
    NoWriteback,

    /// The delegated movable-object protocol failed
    #[error("Delegated relocation failed: {0}")]
    Delegated(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Invalid argument to a request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Address outside any migratable mapping
    #[error("Bad address: {0:#x}")]
    Fault(u64),

    /// No frame present at the address
    #[error("No frame at address {0:#x}")]
    NoEntry(u64),

    /// Frame shared by several mappings and moving shared frames was not requested
    #[error("Frame is shared; moving it requires MOVE_ALL")]
    Access,

    /// Unknown or memoryless partition
    #[error("No such partition: {0}")]
    NoDevice(PartitionId),

    /// The frame could not be taken off its reclaim list
    #[error("Frame is busy")]
    Busy,
}

impl MigrateError {
    /// Whether the batch driver should re-queue the page
    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, MigrateError::Retry(_))
    }

    /// Whether the page should be counted as a permanent failure
    #[inline]
    pub fn is_permanent(&self) -> bool {
        !self.is_retry() && *self != MigrateError::OutOfMemory
    }

    /// Conventional negative status code for per-page reporting
    pub fn errno(&self) -> i32 {
        match self {
            MigrateError::Retry(_) => -11,
            MigrateError::OutOfMemory => -12,
            MigrateError::Io(_) => -5,
            MigrateError::Unsupported => -38,
            MigrateError::Refused => -5,
            MigrateError::NoWriteback => -22,
            MigrateError::Delegated(_) => -16,
            MigrateError::InvalidConfig(_) => -22,
            MigrateError::InvalidArgument(_) => -22,
            MigrateError::Fault(_) => -14,
            MigrateError::NoEntry(_) => -2,
            MigrateError::Access => -13,
            MigrateError::NoDevice(_) => -19,
            MigrateError::Busy => -16,
        }
    }
}

/// Errors returned by the reference fault handler
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Nothing is mapped at the address
    #[error("Address {0:#x} is not mapped")]
    NotMapped(u64),

    /// The access needs a permission the translation lacks
    #[error("Protection fault at {0:#x}")]
    Protection(u64),
}
