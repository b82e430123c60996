//! The one fatal path of the crate. Once a tag in an arena stops matching
//! what the lists say it should be, none of the list pointers can be trusted
//! anymore, so we log what we know and abort the process. Nothing unwinds
//! out of here, whatever panic strategy the final binary is built with.

use std::{panic::Location, process, ptr::NonNull};

/// A node header in front of `address` is not tagged as an allocated block:
/// double free, a pointer into the middle of a block, or overwritten headers.
#[cold]
#[track_caller]
pub(crate) fn node_corrupted(address: NonNull<u8>) -> ! {
    let caller = Location::caller();
    log::error!("heap corruption: no allocated node in front of {address:p} ({caller})");
    process::abort();
}

/// A heap record carries an unknown type tag.
#[cold]
#[track_caller]
pub(crate) fn record_corrupted(record: *const u8, tag: u32) -> ! {
    let caller = Location::caller();
    log::error!("heap corruption: record at {record:p} has unknown tag {tag:#010x} ({caller})");
    process::abort();
}

/// An allocation failed on a heap created with
/// [`crate::HeapFlags::ABORT_ON_EXHAUSTION`].
#[cold]
#[track_caller]
pub(crate) fn exhausted(heap: *const u8, size: usize) -> ! {
    let caller = Location::caller();
    log::error!("heap at {heap:p} exhausted while allocating {size} bytes ({caller})");
    process::abort();
}
