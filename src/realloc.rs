use std::ptr::NonNull;

use crate::{block::Block, header::Header};

/// This is used to carry in-place resize metadata around the code as we
/// don't want to pass the same parameters over and over again. For the real
/// resizing business, see [`crate::expanding::ExpandingAllocator::reallocate`].
pub(crate) struct Realloc {
    /// Node whose payload is being resized.
    pub block: NonNull<Header<Block>>,
    /// User pointer, first payload byte of `block`.
    pub address: NonNull<u8>,
    /// Payload size before resizing.
    pub old_size: usize,
    /// Requested payload size, already rounded to a word.
    pub new_size: usize,
    /// Whether we shrink or grow.
    pub method: ReallocMethod,
}

/// Blocks are never moved, so the only question is which way the end of the
/// payload goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReallocMethod {
    Shrink,
    Grow,
}

impl Realloc {
    /// Builds a new [`Realloc`]. `block` must be a validated allocated node.
    pub unsafe fn new(block: NonNull<Header<Block>>, new_size: usize) -> Self {
        let old_size = block.as_ref().size();
        let method = if new_size < old_size {
            ReallocMethod::Shrink
        } else {
            ReallocMethod::Grow
        };

        Self {
            block,
            address: Header::content_address_of(block),
            old_size,
            new_size,
            method,
        }
    }

    /// Number of payload bytes that change hands: released when shrinking,
    /// taken from the next node when growing.
    pub fn delta(&self) -> usize {
        match self.method {
            ReallocMethod::Shrink => self.old_size - self.new_size,
            ReallocMethod::Grow => self.new_size - self.old_size,
        }
    }

    /// First byte after the current payload.
    pub fn old_end(&self) -> usize {
        self.address.as_ptr() as usize + self.old_size
    }

    /// First byte after the resized payload.
    pub fn new_end(&self) -> usize {
        self.address.as_ptr() as usize + self.new_size
    }
}
