//! Free-list allocator over one fixed arena.
//!
//! The arena is tiled by nodes (see [`crate::block::Block`]): every byte
//! belongs to exactly one free or allocated node. Allocation looks for a
//! free node whose aligned sub-range can hold the request, walking the free
//! list from the head (forward) or from the tail (backward), and splits it
//! into at most three pieces:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Free node                           |
//! +--------------------------------------------------------------+
//!
//! +-----------------+--------+--------------------+--------------+
//! | Free (leftover) | Header |      Payload       | Free (rest)  |
//! +-----------------+--------+--------------------+--------------+
//!                            ^
//!                            |
//!                            +-- Aligned user pointer.
//! ```
//!
//! Pieces that are too small to become nodes are absorbed by the allocated
//! node, see [`crate::alignment`]. Deallocation puts the whole node back in
//! the free list and coalesces it with free neighbours.

use std::ptr::{self, NonNull};

use serde::Deserialize;

use crate::{
    align::{align, align_down, align_up},
    alignment::{Alignment, Direction, DEFAULT_ALIGNMENT},
    block::{Block, NodeInfo, NodeTag, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE},
    error::HeapError,
    freelist::FreeList,
    header::Header,
    list::LinkedList,
    realloc::{Realloc, ReallocMethod},
    AllocResult, Pointer,
};

/// Node id given to regular allocations.
pub const DEFAULT_NODE_ID: u8 = 3;

/// Node id given to the carve-out of a nested heap.
pub const NESTED_HEAP_NODE_ID: u8 = 2;

/// Which free node is picked when several can satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitPolicy {
    /// First free node in traversal order that fits.
    #[default]
    FirstFit,
    /// Smallest free node that fits. Ties go to the node needing less
    /// alignment padding, then to traversal order.
    BestFit,
}

/// A free node that can hold a request, and where the payload would go.
#[derive(Clone, Copy)]
struct Fit {
    node: NonNull<Header<Block>>,
    /// Address of the first payload byte.
    payload: usize,
    /// Bytes between the free node start and the new header.
    gap: usize,
}

/// Smallest remainder worth turning into its own free node.
const MIN_SPLIT: usize = BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE;

/// Free-list allocator. Owns the free and allocated lists of the arena
/// `[start, end)`. The struct itself can live anywhere (usually inside the
/// heap record at the front of its arena), nodes never point back at it.
pub struct ExpandingAllocator {
    start: usize,
    end: usize,
    free: FreeList,
    allocated: LinkedList<Block>,
    node_id: u8,
    policy: FitPolicy,
    zero_fill: bool,
}

impl ExpandingAllocator {
    /// Takes over `[start, start + size)` and covers it with one free node.
    /// The range is shrunk inwards to word boundaries first.
    ///
    /// # Safety
    ///
    /// The range must be valid for reads and writes, and must not be used by
    /// anything else for as long as the allocator is alive.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Result<Self, HeapError> {
        let address = start.as_ptr() as usize;
        let too_small = HeapError::ArenaTooSmall { size };

        let begin = align(address).ok_or(too_small)?;
        let end = align_down(address.checked_add(size).ok_or(too_small)?, MIN_BLOCK_SIZE);

        if end < begin || end - begin < MIN_SPLIT {
            return Err(too_small);
        }

        let mut allocator = Self {
            start: begin,
            end,
            free: FreeList::new(),
            allocated: LinkedList::new(),
            node_id: DEFAULT_NODE_ID,
            policy: FitPolicy::default(),
            zero_fill: false,
        };
        allocator.reinitialize();

        Ok(allocator)
    }

    /// Drops every node and writes a single free node over the whole range.
    unsafe fn reinitialize(&mut self) {
        let node = LinkedList::write(
            Block::free(self.capacity() - BLOCK_HEADER_SIZE),
            NonNull::new_unchecked(self.start as *mut u8),
        );

        self.free = FreeList::new();
        self.allocated = LinkedList::new();
        self.free.push_back(node);
    }

    /// Bytes covered by nodes, headers included.
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// First byte managed by this allocator.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte managed by this allocator.
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: FitPolicy) {
        self.policy = policy;
    }

    /// Released payloads are overwritten with zeroes when enabled.
    pub fn set_zero_fill(&mut self, zero_fill: bool) {
        self.zero_fill = zero_fill;
    }

    /// Tags every node created from now on with `id`. Returns the previous
    /// id.
    pub fn set_node_id(&mut self, id: u8) -> u8 {
        std::mem::replace(&mut self.node_id, id)
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Whether nothing is allocated.
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    /// Number of free nodes.
    pub fn free_nodes(&self) -> usize {
        self.free.len()
    }

    /// Allocates `size` bytes aligned to `alignment`. The size is rounded up
    /// to a word and the allocated node may be slightly bigger than that, see
    /// [`Self::size_of`].
    ///
    /// # Safety
    ///
    /// The allocator must have been created with [`Self::new`] over memory
    /// that is still valid.
    pub unsafe fn allocate(&mut self, size: usize, alignment: Alignment) -> AllocResult {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }

        let exhausted = HeapError::Exhausted { size };
        let size = align(size).ok_or(exhausted)?.max(MIN_BLOCK_SIZE);

        let fit = self.find_fit(size, alignment).ok_or(exhausted)?;
        let block = self.carve(fit, size, alignment.direction());

        log::trace!(
            "allocated {} bytes at {:#x} (node id {})",
            block.as_ref().size(),
            fit.payload,
            self.node_id
        );

        Ok(Header::content_address_of(block))
    }

    /// Where a payload of `size` bytes could go inside `node`, if anywhere.
    unsafe fn fit_in(
        node: NonNull<Header<Block>>,
        size: usize,
        alignment: Alignment,
    ) -> Option<Fit> {
        let start = Header::address_of(node);
        let end = Header::end_of(node);
        let first = start + BLOCK_HEADER_SIZE;
        let align = alignment.effective();

        let payload = match alignment.direction() {
            Direction::Forward => {
                let payload = align_up(first, align)?;
                (payload.checked_add(size)? <= end).then_some(payload)?
            }
            Direction::Backward => {
                let payload = align_down(end.checked_sub(size)?, align);
                (payload >= first).then_some(payload)?
            }
        };

        Some(Fit {
            node,
            payload,
            gap: payload - BLOCK_HEADER_SIZE - start,
        })
    }

    /// Fit search according to the allocator's [`FitPolicy`].
    unsafe fn find_fit(&self, size: usize, alignment: Alignment) -> Option<Fit> {
        let nodes = match alignment.direction() {
            Direction::Forward => self.free.iter(),
            Direction::Backward => self.free.iter_rev(),
        };
        let mut candidates = nodes.filter_map(|node| Self::fit_in(node, size, alignment));

        match self.policy {
            FitPolicy::FirstFit => candidates.next(),
            FitPolicy::BestFit => candidates.fold(None, |best: Option<Fit>, fit| match best {
                Some(best) if !Self::better(&fit, &best) => Some(best),
                _ => Some(fit),
            }),
        }
    }

    /// Best fit ordering: smaller node first, then less padding.
    unsafe fn better(fit: &Fit, than: &Fit) -> bool {
        let size = fit.node.as_ref().size();
        let other = than.node.as_ref().size();

        size < other || (size == other && fit.gap < than.gap)
    }

    /// Splits the free node of `fit` into leftover, allocated node and rest.
    unsafe fn carve(&mut self, fit: Fit, size: usize, direction: Direction) -> NonNull<Header<Block>> {
        let Fit { mut node, payload, gap } = fit;
        let end = Header::end_of(node);
        let rest = end - (payload + size);

        // Free node the rest (if any) is linked after.
        let after = if gap >= MIN_SPLIT {
            node.as_mut().set_size(gap - BLOCK_HEADER_SIZE);
            Some(node)
        } else {
            let prev = node.as_ref().prev;
            self.free.remove(node);
            node.as_mut().invalidate();
            prev
        };
        let offset = if gap >= MIN_SPLIT { 0 } else { gap };

        let size = if rest >= MIN_SPLIT {
            let tail = LinkedList::write(
                Block::free(rest - BLOCK_HEADER_SIZE),
                NonNull::new_unchecked((payload + size) as *mut u8),
            );
            self.free.insert_after(after, tail);
            size
        } else {
            size + rest
        };

        let block = LinkedList::write(
            Block::new(NodeTag::Allocated, self.node_id, offset, direction, size),
            NonNull::new_unchecked((payload - BLOCK_HEADER_SIZE) as *mut u8),
        );
        self.allocated.push_back(block);

        block
    }

    /// Validates `address` and returns its allocated node.
    unsafe fn allocated_block(&self, address: NonNull<u8>) -> Result<NonNull<Header<Block>>, HeapError> {
        let raw = address.as_ptr() as usize;

        if raw < self.start + BLOCK_HEADER_SIZE || raw >= self.end || raw % MIN_BLOCK_SIZE != 0 {
            return Err(HeapError::NotFound(address));
        }

        let block = Header::<Block>::from_content_address(address);

        if !block.as_ref().is_allocated()
            || Header::start_of(block) < self.start
            || Header::end_of(block) > self.end
        {
            return Err(HeapError::NotAllocated(address));
        }

        Ok(block)
    }

    /// Releases the node that starts right before `address` and returns its
    /// payload size. [`HeapError::NotFound`] means the address is not in this
    /// arena, [`HeapError::NotAllocated`] means the header in front of it is
    /// not an allocated node (double free or corruption).
    ///
    /// # Safety
    ///
    /// `address` must not be used after this call.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) -> Result<usize, HeapError> {
        let mut block = self.allocated_block(address)?;
        let size = block.as_ref().size();
        let start = Header::start_of(block);
        let total = block.as_ref().total_size();

        self.allocated.remove(block);
        block.as_mut().invalidate();

        if self.zero_fill {
            ptr::write_bytes(address.as_ptr(), 0, size);
        }

        let free = LinkedList::write(
            Block::free(total - BLOCK_HEADER_SIZE),
            NonNull::new_unchecked(start as *mut u8),
        );
        self.free.insert_block(free);
        self.free.coalesce(free);

        log::trace!("deallocated {size} bytes at {address:p}");

        Ok(size)
    }

    /// Resizes the allocation at `address` in place and returns its final
    /// payload size. Shrinking releases the tail when it is big enough to
    /// become a node, otherwise the size stays as it is. Growing only works
    /// when the node right after this one is free and big enough.
    ///
    /// # Safety
    ///
    /// Only the returned number of bytes may be used after this call.
    pub unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<usize, HeapError> {
        if new_size == 0 {
            return Err(HeapError::ZeroSize);
        }

        let block = self.allocated_block(address)?;
        let new_size = align(new_size).ok_or(HeapError::ResizeFailed)?.max(MIN_BLOCK_SIZE);

        if new_size == block.as_ref().size() {
            return Ok(new_size);
        }

        let realloc = Realloc::new(block, new_size);

        match realloc.method {
            ReallocMethod::Shrink => self.shrink_in_place(&realloc),
            ReallocMethod::Grow => self.grow_in_place(&realloc)?,
        }

        log::trace!("resized {address:p} from {} to {} bytes", realloc.old_size, block.as_ref().size());

        Ok(block.as_ref().size())
    }

    unsafe fn shrink_in_place(&mut self, realloc: &Realloc) {
        let mut block = realloc.block;

        if realloc.delta() < MIN_SPLIT {
            // Too small for a node of its own, but a free successor can move
            // its header down and take the bytes.
            let Some(mut next) = self.free.block_at(realloc.old_end()) else {
                return;
            };

            let size = next.as_ref().size() + realloc.delta();
            let prev = next.as_ref().prev;
            self.free.remove(next);
            next.as_mut().invalidate();

            let moved = LinkedList::write(Block::free(size), NonNull::new_unchecked(realloc.new_end() as *mut u8));
            self.free.insert_after(prev, moved);
            block.as_mut().set_size(realloc.new_size);
            return;
        }

        block.as_mut().set_size(realloc.new_size);

        let free = LinkedList::write(
            Block::free(realloc.delta() - BLOCK_HEADER_SIZE),
            NonNull::new_unchecked(realloc.new_end() as *mut u8),
        );
        self.free.insert_block(free);
        self.free.coalesce(free);
    }

    unsafe fn grow_in_place(&mut self, realloc: &Realloc) -> Result<(), HeapError> {
        let Some(mut next) = self.free.block_at(realloc.old_end()) else {
            return Err(HeapError::ResizeFailed);
        };

        let available = next.as_ref().total_size();
        if available < realloc.delta() {
            return Err(HeapError::ResizeFailed);
        }

        let mut block = realloc.block;
        let rest = available - realloc.delta();

        // The moved header may overlap the old one, so unlink first.
        let prev = next.as_ref().prev;
        self.free.remove(next);
        next.as_mut().invalidate();

        if rest >= MIN_SPLIT {
            let moved = LinkedList::write(
                Block::free(rest - BLOCK_HEADER_SIZE),
                NonNull::new_unchecked(realloc.new_end() as *mut u8),
            );
            self.free.insert_after(prev, moved);
            block.as_mut().set_size(realloc.new_size);
        } else {
            block.as_mut().set_size(realloc.old_size + available);
        }

        Ok(())
    }

    /// Payload size of the allocation at `address`.
    ///
    /// # Safety
    ///
    /// The allocator memory must still be valid.
    pub unsafe fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError> {
        self.allocated_block(address).map(|block| block.as_ref().size())
    }

    /// Sum of all free payloads. Not all of it can be handed out in one
    /// request, see [`Self::max_allocatable`].
    pub fn memory_left(&self) -> usize {
        unsafe { self.free.total_payload() }
    }

    /// Biggest request that would currently succeed with `alignment`.
    pub fn max_allocatable(&self, alignment: Alignment) -> usize {
        let align = alignment.effective();

        unsafe {
            self.free
                .iter()
                .filter_map(|node| {
                    let payload = align_up(Header::address_of(node) + BLOCK_HEADER_SIZE, align)?;
                    let end = Header::end_of(node);
                    (payload <= end).then(|| align_down(end - payload, MIN_BLOCK_SIZE))
                })
                .max()
                .unwrap_or(0)
        }
    }

    /// Biggest request that would currently succeed with the default
    /// alignment.
    pub fn max_allocation_unit_size(&self) -> usize {
        Alignment::from_signed(DEFAULT_ALIGNMENT)
            .map(|alignment| self.max_allocatable(alignment))
            .unwrap_or(0)
    }

    /// Releases every allocation at once. Old pointers stop validating.
    pub fn deallocate_all(&mut self) {
        unsafe {
            for mut block in self.allocated.iter() {
                block.as_mut().invalidate();
            }
            self.reinitialize();
        }

        log::debug!("released every node in [{:#x}, {:#x})", self.start, self.end);
    }

    /// Snapshot of every allocated node in allocation order.
    pub fn nodes(&self) -> Vec<NodeInfo> {
        unsafe { self.allocated.iter().map(|node| NodeInfo::of(node)).collect() }
    }

    /// Payload bytes currently allocated under node id `id`.
    pub fn bytes_with_id(&self, id: u8) -> usize {
        unsafe {
            self.allocated
                .iter()
                .filter(|node| node.as_ref().id() == id)
                .map(|node| node.as_ref().size())
                .sum()
        }
    }

    /// Validates the whole arena: tags match list membership, the free list
    /// is sorted and fully coalesced, and nodes tile `[start, end)` exactly.
    pub fn is_intact(&self) -> bool {
        unsafe { self.check().is_some() }
    }

    unsafe fn check(&self) -> Option<()> {
        let mut nodes = Vec::with_capacity(self.free.len() + self.allocated.len());
        let mut prev_free: Pointer<Header<Block>> = None;

        for node in self.free.iter() {
            (node.as_ref().is_free() && node.as_ref().offset() == 0).then_some(())?;
            if let Some(prev) = prev_free {
                // Sorted, and two touching free nodes would have been merged.
                (Header::end_of(prev) < Header::address_of(node)).then_some(())?;
            }
            prev_free = Some(node);
            nodes.push(node);
        }

        for node in self.allocated.iter() {
            node.as_ref().is_allocated().then_some(())?;
            nodes.push(node);
        }

        nodes.sort_by_key(|node| Header::start_of(*node));

        let mut cursor = self.start;
        for node in nodes {
            (Header::start_of(node) == cursor).then_some(())?;
            cursor = Header::end_of(node);
        }

        (cursor == self.end).then_some(())
    }
}
