//! Heap facade. A heap is an arena with a [`HeapRecord`] at its front,
//! followed by the concrete allocator that manages the rest of the arena:
//!
//! ```text
//! +--------------+---------------------+-------------------------------+
//! | HeapRecord   | parent, allocator   |   Memory handed out to users  |
//! +--------------+---------------------+-------------------------------+
//! ^
//! |
//! +-- HeapRef points here.
//! ```
//!
//! [`ExpandingHeap`] and [`SolidHeap`] both implement [`Heap`], callers go
//! through the trait and only see the documented behavioural differences.
//! Nested heaps are created with [`create_nested`], which carves the new
//! arena out of the parent heap, and removed with [`destroy`], which gives it
//! back.

use std::{mem, ptr::NonNull};

use crate::{
    alignment::Alignment,
    block::NodeInfo,
    error::HeapError,
    expanding::{ExpandingAllocator, FitPolicy, NESTED_HEAP_NODE_ID},
    fatal,
    header::Header,
    list::Node,
    record::{HeapFlags, HeapKind, HeapRecord},
    solid::{ResetEnds, SolidAllocator},
    AllocResult,
};

/// Handle to a live heap. Cheap to copy. Handles are only checked for
/// liveness by [`crate::MemoryContext`], raw use of a handle to a destroyed
/// heap is undefined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapRef(NonNull<Header<HeapRecord>>);

impl HeapRef {
    pub(crate) fn from_record(record: NonNull<Header<HeapRecord>>) -> Self {
        Self(record)
    }

    pub(crate) fn record(self) -> NonNull<Header<HeapRecord>> {
        self.0
    }

    /// First byte of the heap's arena.
    pub fn address(self) -> NonNull<u8> {
        self.0.cast()
    }

    /// Reads the type tag that decides which allocator follows the record.
    ///
    /// # Safety
    ///
    /// The handle must point to a heap record, live or invalidated.
    pub(crate) unsafe fn kind(self) -> Result<HeapKind, u32> {
        self.0.as_ref().kind()
    }

    /// Turns the handle into the facade it names. An unknown tag means the
    /// record has been overwritten, which is fatal.
    ///
    /// # Safety
    ///
    /// The heap must be alive and not otherwise borrowed for `'a`.
    pub(crate) unsafe fn resolve<'a>(self) -> &'a mut dyn Heap {
        match self.kind() {
            Ok(HeapKind::Expanding) => &mut *self.0.as_ptr().cast::<ExpandingHeap>(),
            Ok(HeapKind::Solid) => &mut *self.0.as_ptr().cast::<SolidHeap>(),
            Err(tag) => fatal::record_corrupted(self.0.as_ptr().cast::<u8>(), tag),
        }
    }
}

/// Operations every heap supports, whatever allocator backs it.
///
/// Alignments are signed: the magnitude is the byte alignment (a power of
/// two), a negative value allocates from the end of the free space.
pub trait Heap {
    fn kind(&self) -> HeapKind;

    /// Handle naming this heap.
    fn handle(&self) -> HeapRef;

    /// Heap this one was carved from. `None` for root-level heaps.
    fn parent(&self) -> Option<HeapRef>;

    fn flags(&self) -> HeapFlags;

    /// First byte of the arena, where the heap record lives.
    fn arena_start(&self) -> NonNull<u8> {
        self.handle().address()
    }

    /// Arena size including the heap headers.
    fn arena_size(&self) -> usize {
        let record = unsafe { self.handle().record().as_ref() };
        record.data.end - record.data.start
    }

    /// Allocates `size` bytes. Exhaustion is an ordinary error unless the heap
    /// carries [`HeapFlags::ABORT_ON_EXHAUSTION`].
    fn allocate(&mut self, size: usize, align: i32) -> AllocResult;

    /// Releases an allocation of this heap.
    ///
    /// # Safety
    ///
    /// `address` must come from this heap and must not be used afterwards.
    unsafe fn deallocate(&mut self, address: NonNull<u8>) -> Result<(), HeapError>;

    /// Resizes an allocation in place and returns its final size. Blocks
    /// never move.
    ///
    /// # Safety
    ///
    /// `address` must come from this heap. Only the returned number of bytes
    /// may be used afterwards.
    unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<usize, HeapError>;

    /// Usable size of an allocation.
    fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError>;

    /// Free bytes. Not necessarily available as one block.
    fn memory_left(&self) -> usize;

    /// Biggest single request that would currently succeed with `align`.
    fn max_allocatable_size(&self, align: i32) -> Result<usize, HeapError>;

    /// Biggest single request at the default alignment.
    fn max_allocation_unit_size(&self) -> usize;

    /// Tags the nodes created from now on. Returns the previous id, or 0 on
    /// heaps that don't keep node ids.
    fn set_node_id(&mut self, id: u8) -> u8;

    fn node_id(&self) -> u8;

    /// Shrinks the arena to what is in use and gives the rest back to the
    /// parent. Returns the new arena size.
    fn resize_to_fit(&mut self) -> Result<usize, HeapError>;

    /// Releases every allocation at once. Refused while nested heaps exist.
    fn deallocate_all(&mut self) -> Result<(), HeapError>;

    /// Validates the allocator and the nested heap index.
    fn is_intact(&self) -> bool;

    /// Whether anything handed out by this heap is still alive.
    fn has_allocations(&self) -> bool;

    /// Whether heaps have been carved out of this one.
    fn has_children(&self) -> bool {
        unsafe { !self.handle().record().as_ref().data.children.is_empty() }
    }

    /// No allocations and no nested heaps: the heap may be destroyed.
    fn is_empty(&self) -> bool {
        !self.has_allocations() && !self.has_children()
    }

    /// Whether `address` lies in this heap's arena.
    fn contains(&self, address: NonNull<u8>) -> bool {
        unsafe { self.handle().record().as_ref().contains(address.as_ptr() as usize) }
    }

    fn as_expanding(&mut self) -> Option<&mut ExpandingHeap> {
        None
    }

    fn as_solid(&mut self) -> Option<&mut SolidHeap> {
        None
    }
}

/// Corruption detected by an allocator never reaches the caller.
#[track_caller]
fn checked<T>(result: Result<T, HeapError>) -> Result<T, HeapError> {
    match result {
        Err(HeapError::NotAllocated(address)) => fatal::node_corrupted(address),
        other => other,
    }
}

fn report_exhaustion(heap: &dyn Heap, result: AllocResult) -> AllocResult {
    if let Err(HeapError::Exhausted { size }) = result {
        let address = heap.arena_start().as_ptr();
        log::warn!("heap at {address:p} cannot fit {size} bytes");

        if heap.flags().contains(HeapFlags::ABORT_ON_EXHAUSTION) {
            fatal::exhausted(address, size);
        }
    }

    result
}

/// Children sorted, disjoint, tagged, and inside `[low, high)`.
unsafe fn children_intact(record: &Header<HeapRecord>, low: usize, high: usize) -> bool {
    let mut cursor = low;

    record.data.children.iter().all(|child| {
        let child = child.as_ref();
        let ok = child.kind().is_ok()
            && child.data.start >= cursor
            && child.data.start <= child.data.end
            && child.data.end <= high;
        cursor = child.data.end;
        ok
    })
}

/// Whether any child of `record` overlaps one of the `ranges`.
unsafe fn children_overlap(record: &Header<HeapRecord>, ranges: &[(usize, usize)]) -> bool {
    record.data.children.iter().any(|child| {
        let child = child.as_ref();
        ranges
            .iter()
            .any(|(start, end)| child.data.start < *end && *start < child.data.end)
    })
}

/// Heap backed by the free-list allocator. See [`crate::expanding`].
#[repr(C)]
pub struct ExpandingHeap {
    record: Header<HeapRecord>,
    parent: Option<HeapRef>,
    allocator: ExpandingAllocator,
}

/// Bytes taken from the front of the arena by an [`ExpandingHeap`].
pub const EXPANDING_HEAP_HEADER_SIZE: usize = mem::size_of::<ExpandingHeap>();

impl ExpandingHeap {
    /// Builds an expanding heap over `[arena, arena + size)`.
    ///
    /// # Safety
    ///
    /// The range must be valid, word aligned, and owned by the new heap until
    /// it is destroyed.
    pub(crate) unsafe fn write(
        arena: NonNull<u8>,
        size: usize,
        parent: Option<HeapRef>,
        flags: HeapFlags,
    ) -> Result<HeapRef, HeapError> {
        let too_small = HeapError::ArenaTooSmall { size };
        let data_size = size.checked_sub(EXPANDING_HEAP_HEADER_SIZE).ok_or(too_small)?;
        let data = NonNull::new_unchecked(arena.as_ptr().add(EXPANDING_HEAP_HEADER_SIZE));

        let mut allocator = ExpandingAllocator::new(data, data_size).map_err(|_| too_small)?;
        allocator.set_zero_fill(flags.contains(HeapFlags::ZERO_FILL));

        let start = arena.as_ptr() as usize;
        let heap = arena.cast::<Self>();
        heap.as_ptr().write(Self {
            record: Node {
                next: None,
                prev: None,
                data: HeapRecord::new(HeapKind::Expanding, start, start + size, flags),
            },
            parent,
            allocator,
        });

        Ok(HeapRef(heap.cast()))
    }

    pub fn fit_policy(&self) -> FitPolicy {
        self.allocator.policy()
    }

    pub fn set_fit_policy(&mut self, policy: FitPolicy) {
        self.allocator.set_policy(policy);
    }

    /// Every live allocation with its node id, see [`NodeInfo`].
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.allocator.nodes()
    }

    /// Bytes allocated under node id `id`.
    pub fn bytes_with_id(&self, id: u8) -> usize {
        self.allocator.bytes_with_id(id)
    }

    /// Number of free nodes, a rough fragmentation measure.
    pub fn free_nodes(&self) -> usize {
        self.allocator.free_nodes()
    }
}

impl Heap for ExpandingHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Expanding
    }

    fn handle(&self) -> HeapRef {
        HeapRef(NonNull::from(&self.record))
    }

    fn parent(&self) -> Option<HeapRef> {
        self.parent
    }

    fn flags(&self) -> HeapFlags {
        self.record.data.flags
    }

    fn allocate(&mut self, size: usize, align: i32) -> AllocResult {
        let alignment = Alignment::from_signed(align)?;
        let result = unsafe { self.allocator.allocate(size, alignment) };
        report_exhaustion(&*self, result)
    }

    unsafe fn deallocate(&mut self, address: NonNull<u8>) -> Result<(), HeapError> {
        checked(self.allocator.deallocate(address)).map(drop)
    }

    unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<usize, HeapError> {
        checked(self.allocator.reallocate(address, new_size))
    }

    fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError> {
        checked(unsafe { self.allocator.size_of(address) })
    }

    fn memory_left(&self) -> usize {
        self.allocator.memory_left()
    }

    fn max_allocatable_size(&self, align: i32) -> Result<usize, HeapError> {
        Alignment::from_signed(align).map(|alignment| self.allocator.max_allocatable(alignment))
    }

    fn max_allocation_unit_size(&self) -> usize {
        self.allocator.max_allocation_unit_size()
    }

    fn set_node_id(&mut self, id: u8) -> u8 {
        self.allocator.set_node_id(id)
    }

    fn node_id(&self) -> u8 {
        self.allocator.node_id()
    }

    fn resize_to_fit(&mut self) -> Result<usize, HeapError> {
        Err(HeapError::Unsupported)
    }

    fn deallocate_all(&mut self) -> Result<(), HeapError> {
        if self.has_children() {
            return Err(HeapError::NotEmpty);
        }

        self.allocator.deallocate_all();
        Ok(())
    }

    fn is_intact(&self) -> bool {
        self.allocator.is_intact()
            && unsafe { children_intact(&self.record, self.allocator.start(), self.allocator.end()) }
    }

    fn has_allocations(&self) -> bool {
        !self.allocator.is_empty()
    }

    fn as_expanding(&mut self) -> Option<&mut ExpandingHeap> {
        Some(self)
    }
}

/// Heap backed by the bump allocator. See [`crate::solid`].
#[repr(C)]
pub struct SolidHeap {
    record: Header<HeapRecord>,
    parent: Option<HeapRef>,
    allocator: SolidAllocator,
}

/// Bytes taken from the front of the arena by a [`SolidHeap`].
pub const SOLID_HEAP_HEADER_SIZE: usize = mem::size_of::<SolidHeap>();

impl SolidHeap {
    /// Builds a solid heap over `[arena, arena + size)`.
    ///
    /// # Safety
    ///
    /// See [`ExpandingHeap::write`].
    pub(crate) unsafe fn write(
        arena: NonNull<u8>,
        size: usize,
        parent: Option<HeapRef>,
        flags: HeapFlags,
    ) -> Result<HeapRef, HeapError> {
        let too_small = HeapError::ArenaTooSmall { size };
        let data_size = size.checked_sub(SOLID_HEAP_HEADER_SIZE).ok_or(too_small)?;
        let data = NonNull::new_unchecked(arena.as_ptr().add(SOLID_HEAP_HEADER_SIZE));
        let allocator = SolidAllocator::new(data, data_size).map_err(|_| too_small)?;

        let start = arena.as_ptr() as usize;
        let heap = arena.cast::<Self>();
        heap.as_ptr().write(Self {
            record: Node {
                next: None,
                prev: None,
                data: HeapRecord::new(HeapKind::Solid, start, start + size, flags),
            },
            parent,
            allocator,
        });

        Ok(HeapRef(heap.cast()))
    }

    /// Pushes a checkpoint. See [`SolidAllocator::save_state`].
    pub fn save_state(&mut self, id: u32) -> Result<(), HeapError> {
        let result = self.allocator.save_state(id);
        if let Err(error) = result {
            log::warn!("cannot save state {id}: {error}");
        }
        result
    }

    /// Rolls back to the checkpoint `id`. Refused if a nested heap lives in
    /// the memory that would be released.
    pub fn load_state(&mut self, id: u32) -> Result<(), HeapError> {
        let (front, back) = self.allocator.peek_state(id).ok_or(HeapError::UnknownState(id))?;
        let released = [(front, self.allocator.front()), (self.allocator.back(), back)];

        if unsafe { children_overlap(&self.record, &released) } {
            return Err(HeapError::NotEmpty);
        }

        self.allocator.load_state(id)
    }

    /// Moves one or both cursors back to the arena bounds. Refused if a
    /// nested heap lives in the memory that would be released.
    pub fn reset(&mut self, ends: ResetEnds) -> Result<(), HeapError> {
        let mut released = Vec::with_capacity(2);
        if matches!(ends, ResetEnds::Front | ResetEnds::Both) {
            released.push((self.allocator.start(), self.allocator.front()));
        }
        if matches!(ends, ResetEnds::Back | ResetEnds::Both) {
            released.push((self.allocator.back(), self.allocator.end()));
        }

        if unsafe { children_overlap(&self.record, &released) } {
            return Err(HeapError::NotEmpty);
        }

        self.allocator.reset(ends);
        Ok(())
    }

    /// Forward cursor.
    pub fn front(&self) -> usize {
        self.allocator.front()
    }

    /// Backward cursor.
    pub fn back(&self) -> usize {
        self.allocator.back()
    }

    pub fn saved_states(&self) -> usize {
        self.allocator.saved_states()
    }
}

impl Heap for SolidHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Solid
    }

    fn handle(&self) -> HeapRef {
        HeapRef(NonNull::from(&self.record))
    }

    fn parent(&self) -> Option<HeapRef> {
        self.parent
    }

    fn flags(&self) -> HeapFlags {
        self.record.data.flags
    }

    fn allocate(&mut self, size: usize, align: i32) -> AllocResult {
        let alignment = Alignment::from_signed(align)?;
        let result = self.allocator.allocate(size, alignment);
        report_exhaustion(&*self, result)
    }

    unsafe fn deallocate(&mut self, address: NonNull<u8>) -> Result<(), HeapError> {
        log::warn!("solid heap at {:p} cannot release {address:p} on its own", self.arena_start());
        Err(HeapError::Unsupported)
    }

    unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<usize, HeapError> {
        self.allocator.reallocate(address, new_size)
    }

    fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError> {
        self.allocator.size_of(address)
    }

    fn memory_left(&self) -> usize {
        self.allocator.memory_left()
    }

    fn max_allocatable_size(&self, align: i32) -> Result<usize, HeapError> {
        Alignment::from_signed(align).map(|alignment| self.allocator.max_allocatable(alignment))
    }

    fn max_allocation_unit_size(&self) -> usize {
        self.max_allocatable_size(crate::alignment::DEFAULT_ALIGNMENT)
            .unwrap_or(0)
    }

    fn set_node_id(&mut self, _id: u8) -> u8 {
        0
    }

    fn node_id(&self) -> u8 {
        0
    }

    fn resize_to_fit(&mut self) -> Result<usize, HeapError> {
        let used = self.allocator.fitted_size()?;
        let parent = self.parent.ok_or(HeapError::Unsupported)?;

        let start = self.arena_start();
        let old_end = self.record.data.end;

        // The carve-out of this heap is a regular allocation of the parent.
        let total = unsafe { parent.resolve().reallocate(start, SOLID_HEAP_HEADER_SIZE + used)? };
        let end = (start.as_ptr() as usize + total).min(old_end);

        unsafe { self.allocator.truncate(end.min(self.allocator.end())) };
        self.record.data.end = end;

        log::debug!("solid heap at {start:p} resized to {} bytes", end - start.as_ptr() as usize);

        Ok(self.arena_size())
    }

    fn deallocate_all(&mut self) -> Result<(), HeapError> {
        if self.has_children() {
            return Err(HeapError::NotEmpty);
        }

        self.allocator.reset(ResetEnds::Both);
        Ok(())
    }

    fn is_intact(&self) -> bool {
        self.allocator.is_intact()
            && unsafe { children_intact(&self.record, self.allocator.start(), self.allocator.end()) }
    }

    fn has_allocations(&self) -> bool {
        !self.allocator.is_empty()
    }

    fn as_solid(&mut self) -> Option<&mut SolidHeap> {
        Some(self)
    }
}

/// Carves a heap of `size` usable bytes out of `parent`. The parent is asked
/// for `size` plus the heap headers, tagged with [`NESTED_HEAP_NODE_ID`],
/// and the new record is linked into the parent's nested heap index. An
/// expanding child inherits the parent's fit policy.
///
/// # Safety
///
/// `parent` must be a live heap that is not borrowed elsewhere.
pub(crate) unsafe fn create_nested(
    parent: HeapRef,
    kind: HeapKind,
    size: usize,
    align: i32,
    flags: HeapFlags,
) -> Result<HeapRef, HeapError> {
    let header = match kind {
        HeapKind::Expanding => EXPANDING_HEAP_HEADER_SIZE,
        HeapKind::Solid => SOLID_HEAP_HEADER_SIZE,
    };
    let total = size.checked_add(header).ok_or(HeapError::Exhausted { size })?;

    let parent_heap = parent.resolve();
    let policy = parent_heap.as_expanding().map(|heap| heap.fit_policy());

    let previous = parent_heap.set_node_id(NESTED_HEAP_NODE_ID);
    let carved = parent_heap.allocate(total, align);
    parent_heap.set_node_id(previous);
    let arena = carved?;

    let child = match kind {
        HeapKind::Expanding => ExpandingHeap::write(arena, total, Some(parent), flags),
        HeapKind::Solid => SolidHeap::write(arena, total, Some(parent), flags),
    };

    let child = match child {
        Ok(child) => child,
        Err(error) => {
            // Solid parents can't take it back, the bytes stay until reset.
            let _ = parent_heap.deallocate(arena);
            return Err(error);
        }
    };

    if let (Some(policy), Some(heap)) = (policy, child.resolve().as_expanding()) {
        heap.set_fit_policy(policy);
    }

    (*parent.record().as_ptr()).data.children.insert_ordered(child.record());

    log::debug!(
        "created {kind:?} heap of {total} bytes at {:p} inside {:p}",
        arena,
        parent.address()
    );

    Ok(child)
}

/// Destroys an empty nested heap: unlinks it from its parent, invalidates its
/// record and returns the carve-out to the parent (solid parents keep it
/// until they are reset).
///
/// # Safety
///
/// `heap` must be live and not borrowed elsewhere. Handles to it are dead
/// afterwards.
pub(crate) unsafe fn destroy(heap: HeapRef) -> Result<(), HeapError> {
    let target = heap.resolve();
    let parent = target.parent().ok_or(HeapError::RootHeap)?;

    if !target.is_empty() {
        log::warn!("refusing to destroy heap at {:p}: still in use", heap.address());
        return Err(HeapError::NotEmpty);
    }

    (*parent.record().as_ptr()).data.children.remove(heap.record());
    (*heap.record().as_ptr()).invalidate();

    match parent.resolve().deallocate(heap.address()) {
        Ok(()) | Err(HeapError::Unsupported) => {}
        Err(error) => return Err(error),
    }

    log::debug!("destroyed heap at {:p}", heap.address());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root-level heap over a Vec, for tests that don't need a context.
    struct Arena {
        memory: Vec<usize>,
    }

    impl Arena {
        fn new(bytes: usize) -> Self {
            Self {
                memory: vec![0; bytes / mem::size_of::<usize>()],
            }
        }

        fn heap(&mut self, flags: HeapFlags) -> HeapRef {
            let size = self.memory.len() * mem::size_of::<usize>();
            let start = NonNull::new(self.memory.as_mut_ptr().cast()).unwrap();
            unsafe { ExpandingHeap::write(start, size, None, flags).unwrap() }
        }
    }

    #[test]
    fn facade_dispatch() {
        let mut arena = Arena::new(4096);
        let root = arena.heap(HeapFlags::empty());

        unsafe {
            let heap = root.resolve();
            assert_eq!(heap.kind(), HeapKind::Expanding);
            assert_eq!(heap.arena_size(), 4096);
            assert!(heap.is_empty());

            let address = heap.allocate(100, 8).unwrap();
            assert!(heap.contains(address));
            assert_eq!(heap.size_of(address), Ok(104));
            assert_eq!(heap.allocate(0, 8), Err(HeapError::ZeroSize));
            assert_eq!(heap.allocate(8, 3), Err(HeapError::InvalidAlignment(3)));

            heap.deallocate(address).unwrap();
            assert!(heap.is_intact());
            assert_eq!(heap.resize_to_fit(), Err(HeapError::Unsupported));
        }
    }

    #[test]
    fn nested_heaps() {
        let mut arena = Arena::new(8192);
        let root = arena.heap(HeapFlags::empty());

        unsafe {
            let before = root.resolve().memory_left();
            let child = create_nested(root, HeapKind::Expanding, 1024, 8, HeapFlags::empty()).unwrap();
            let after = root.resolve().memory_left();

            assert!(before - after >= 1024);
            let nested = root.resolve().as_expanding().unwrap().bytes_with_id(NESTED_HEAP_NODE_ID);
            assert_eq!(nested, 1024 + EXPANDING_HEAP_HEADER_SIZE);
            assert!(root.resolve().has_children());
            assert!(root.resolve().is_intact());

            // Not empty while it has allocations.
            let address = child.resolve().allocate(64, 8).unwrap();
            assert_eq!(destroy(child), Err(HeapError::NotEmpty));
            child.resolve().deallocate(address).unwrap();

            destroy(child).unwrap();
            assert_eq!(root.resolve().memory_left(), before);
            assert!(!root.resolve().has_children());
            assert_eq!(destroy(root), Err(HeapError::RootHeap));
        }
    }

    #[test]
    fn solid_resize_to_fit_returns_tail() {
        let mut arena = Arena::new(8192);
        let root = arena.heap(HeapFlags::empty());

        unsafe {
            let before = root.resolve().memory_left();
            let solid = create_nested(root, HeapKind::Solid, 2048, 8, HeapFlags::empty()).unwrap();
            solid.resolve().allocate(100, 8).unwrap();

            let size = solid.resolve().resize_to_fit().unwrap();
            assert_eq!(size, SOLID_HEAP_HEADER_SIZE + 104);
            assert!(root.resolve().memory_left() > before - 2048);
            assert!(solid.resolve().is_intact());
            assert!(root.resolve().is_intact());

            // Nothing left to bump into.
            assert_eq!(solid.resolve().memory_left(), 0);
        }
    }

    #[test]
    fn solid_checkpoints_protect_children() {
        let mut arena = Arena::new(8192);
        let root = arena.heap(HeapFlags::empty());

        unsafe {
            let solid = create_nested(root, HeapKind::Solid, 4096, 8, HeapFlags::empty()).unwrap();
            solid.resolve().as_solid().unwrap().save_state(1).unwrap();
            let inner = create_nested(solid, HeapKind::Expanding, 512, 8, HeapFlags::empty()).unwrap();

            let heap = solid.resolve().as_solid().unwrap();
            assert_eq!(heap.load_state(1), Err(HeapError::NotEmpty));
            assert_eq!(heap.reset(ResetEnds::Front), Err(HeapError::NotEmpty));
            assert_eq!(heap.reset(ResetEnds::Back), Ok(()));
            assert_eq!(heap.deallocate(NonNull::dangling()), Err(HeapError::Unsupported));
            assert_eq!(heap.set_node_id(9), 0);

            destroy(inner).unwrap();
            let heap = solid.resolve().as_solid().unwrap();
            assert_eq!(heap.load_state(1), Ok(()));
            assert_eq!(heap.saved_states(), 0);
        }
    }

    #[test]
    fn children_inherit_fit_policy() {
        let mut arena = Arena::new(8192);
        let root = arena.heap(HeapFlags::empty());

        unsafe {
            root.resolve().as_expanding().unwrap().set_fit_policy(FitPolicy::BestFit);
            let child = create_nested(root, HeapKind::Expanding, 1024, 8, HeapFlags::empty()).unwrap();
            let policy = child.resolve().as_expanding().map(|heap| heap.fit_policy());
            assert_eq!(policy, Some(FitPolicy::BestFit));
        }
    }

    struct Stderr;

    impl log::Log for Stderr {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            eprintln!("{}", record.args());
        }

        fn flush(&self) {}
    }

    #[test]
    fn overwritten_record_tag_aborts() {
        const CHILD: &str = "NESTALLOC_FATAL_CHILD";

        if std::env::var_os(CHILD).is_some() {
            log::set_logger(&Stderr).unwrap();
            log::set_max_level(log::LevelFilter::Error);

            let mut arena = Arena::new(4096);
            let root = arena.heap(HeapFlags::empty());
            unsafe {
                root.record().as_mut().invalidate();
                root.resolve().memory_left();
            }
            return;
        }

        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args(["heap::tests::overwritten_record_tag_aborts", "--exact", "--nocapture"])
            .env(CHILD, "1")
            .output()
            .unwrap();

        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(!output.status.success(), "stderr:\n{stderr}");
        assert!(stderr.contains("has unknown tag 0x00000000"), "stderr:\n{stderr}");
    }
}
