//! Error values returned by heaps, allocators and the memory context.
//!
//! Exhaustion and misuse are ordinary return values. Corruption is not
//! represented here as something callers can recover from: the facades hand
//! it to [`crate::fatal`] instead.

use std::ptr::NonNull;

use thiserror::Error;

/// Everything a heap operation can report back to its caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// No free block (or free region) can satisfy the request.
    #[error("heap exhausted: cannot fit {size} bytes")]
    Exhausted {
        /// Requested size in bytes.
        size: usize,
    },

    /// Zero-size requests never reach an allocator.
    #[error("zero-size allocation request")]
    ZeroSize,

    /// Alignment is zero or not a power of two.
    #[error("invalid alignment {0}")]
    InvalidAlignment(i32),

    /// The address does not belong to the heap's arena.
    #[error("address {0:p} is not inside this heap")]
    NotFound(NonNull<u8>),

    /// The header in front of the address is not an allocated node. Facades
    /// treat this as corruption.
    #[error("no allocated node at {0:p}")]
    NotAllocated(NonNull<u8>),

    /// The heap strategy does not support the operation (e.g. deallocating
    /// individual blocks from a solid heap).
    #[error("operation not supported by this heap")]
    Unsupported,

    /// Solid heaps can only resize the most recent forward allocation.
    #[error("{0:p} is not the most recent forward allocation")]
    NotTip(NonNull<u8>),

    /// No checkpoint with this id is on the stack.
    #[error("no saved state with id {0}")]
    UnknownState(u32),

    /// The heap still has live allocations or nested heaps.
    #[error("heap still has live allocations or nested heaps")]
    NotEmpty,

    /// The root heap has no parent and is never destroyed.
    #[error("the root heap cannot be destroyed")]
    RootHeap,

    /// Not enough room for the heap headers plus a minimal block.
    #[error("arena of {size} bytes is too small for a heap")]
    ArenaTooSmall {
        /// Size of the rejected arena.
        size: usize,
    },

    /// A root-level arena would overlap a heap this context already knows.
    #[error("arena overlaps an existing heap")]
    Overlapping,

    /// The handle does not name a live heap of this context.
    #[error("unknown or destroyed heap")]
    UnknownHeap,

    /// The handle names a heap of the other strategy.
    #[error("heap is not of the requested kind")]
    WrongKind,

    /// A write-once registry slot is already set.
    #[error("{0} is already initialized")]
    AlreadyInitialized(&'static str),

    /// Shrinking or growing in place is not possible.
    #[error("cannot resize in place")]
    ResizeFailed,
}

/// Errors produced while loading or validating a [`crate::MemoryConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The TOML document could not be parsed.
    #[error("invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Parsed fine but describes an impossible heap layout.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// Building the heaps described by the configuration failed.
    #[error("cannot build heaps: {0}")]
    Heap(#[from] HeapError),

    /// The platform refused to map the root arena.
    #[error("platform could not provide {0} bytes for the root arena")]
    ArenaUnavailable(usize),
}
