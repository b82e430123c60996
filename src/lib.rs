//! Nested heaps over fixed memory arenas.
//!
//! A [`MemoryContext`] owns one root arena and builds an expanding heap over
//! it. Any heap can have further heaps carved out of it, either expanding
//! (free list with coalescing, see [`ExpandingHeap`]) or solid (bump cursors
//! at both ends with checkpoints, see [`SolidHeap`]). Every heap is used
//! through the [`Heap`] trait:
//!
//! ```rust
//! use nestalloc::{Heap, MemoryConfig, MemoryContext};
//!
//! let mut context = MemoryContext::from_config(&MemoryConfig::default()).unwrap();
//! let game = context.game_heap().unwrap();
//!
//! let level = context.create_solid_heap(16 * 1024, Some(game), 8).unwrap();
//! let tiles = context.allocate(4096, 16, Some(level)).unwrap();
//! assert_eq!(context.find_innermost(tiles), Some(level));
//!
//! context.heap_mut(level).unwrap().deallocate_all().unwrap();
//! context.destroy_heap(level).unwrap();
//! ```
//!
//! The crate never calls the global allocator on the allocation paths, and
//! nothing here is thread safe: a context belongs to one thread.

use std::ptr::NonNull;

pub mod align;
mod alignment;
mod block;
mod checkpoint;
mod config;
mod context;
mod error;
mod expanding;
mod fatal;
mod freelist;
mod header;
mod heap;
mod list;
mod platform;
mod realloc;
mod record;
mod solid;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation return types.
pub type AllocResult = Result<NonNull<u8>, HeapError>;

pub use alignment::{Alignment, Direction, DEFAULT_ALIGNMENT};
pub use block::{NodeInfo, NodeTag};
pub use config::{HeapConfig, MemoryConfig, DEFAULT_GAME_HEAP_SIZE, DEFAULT_ROOT_ARENA_SIZE, GAME_HEAP_NAME, ROOT_HEAP_NAME};
pub use context::{DefaultHeapGuard, MemoryContext};
pub use error::{ConfigError, HeapError};
pub use expanding::{FitPolicy, DEFAULT_NODE_ID, NESTED_HEAP_NODE_ID};
pub use heap::{ExpandingHeap, Heap, HeapRef, SolidHeap, EXPANDING_HEAP_HEADER_SIZE, SOLID_HEAP_HEADER_SIZE};
pub use platform::{page_size, PlatformArena};
pub use record::{HeapFlags, HeapKind};
pub use solid::ResetEnds;
