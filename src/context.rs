//! The memory context: the root heap and the handful of named slots that
//! decide which heap untargeted calls go to.
//!
//! ```text
//! MemoryContext
//!   roots ----> [ root heap ] -> [ attached arena ] -> ...
//!                    |
//!                    +-- children --> [ game heap ] -> [ solid heap ] -> ...
//!                                          |
//!                                          +-- children --> ...
//!
//!   default    ---> any live heap (root after bootstrap)
//!   game       ---> game heap, set once
//!   temporary  ---> default saved by push_solid_default
//! ```
//!
//! The context is single threaded and never locks. Nothing in here may be
//! called from an interrupt-style handler that can preempt a running
//! allocation.

use std::{
    ops::{Deref, DerefMut},
    ptr::NonNull,
};

use crate::{
    align::{align, align_down},
    config::{MemoryConfig, GAME_HEAP_NAME, ROOT_HEAP_NAME},
    error::{ConfigError, HeapError},
    heap::{self, ExpandingHeap, Heap, HeapRef, SolidHeap},
    platform::PlatformArena,
    record::{HeapFlags, HeapKind, NestedHeaps},
    AllocResult,
};

/// Owner of every heap reachable from the root arena. See the module docs.
pub struct MemoryContext {
    /// Root-level heaps: the root heap and attached arenas, by address.
    roots: NestedHeaps,
    root: HeapRef,
    default: HeapRef,
    game: Option<HeapRef>,
    temporary: Option<HeapRef>,
    named: Vec<(String, HeapRef)>,
    /// Set the first time an integrity check fails. Never cleared.
    damaged: bool,
    /// Memory mapped by [`Self::from_config`]. Declared last so that it is
    /// unmapped after everything else is dropped.
    backing: Option<PlatformArena>,
}

impl MemoryContext {
    /// Builds the root heap (expanding) directly over `[start, start + size)`
    /// and makes it the default heap. The range is shrunk inwards to word
    /// boundaries.
    ///
    /// # Safety
    ///
    /// The range must be valid for reads and writes and owned by the
    /// returned context for its whole lifetime.
    pub unsafe fn bootstrap(start: NonNull<u8>, size: usize) -> Result<Self, HeapError> {
        Self::bootstrap_with(start, size, HeapFlags::empty())
    }

    unsafe fn bootstrap_with(start: NonNull<u8>, size: usize, flags: HeapFlags) -> Result<Self, HeapError> {
        let root = Self::root_level_heap(start, size, flags)?;

        let mut roots = NestedHeaps::new();
        roots.insert_ordered(root.record());

        log::debug!("bootstrapped root heap of {size} bytes at {start:p}");

        Ok(Self {
            roots,
            root,
            default: root,
            game: None,
            temporary: None,
            named: Vec::new(),
            damaged: false,
            backing: None,
        })
    }

    unsafe fn root_level_heap(start: NonNull<u8>, size: usize, flags: HeapFlags) -> Result<HeapRef, HeapError> {
        let too_small = HeapError::ArenaTooSmall { size };
        let address = start.as_ptr() as usize;
        let begin = align(address).ok_or(too_small)?;
        let end = align_down(address.checked_add(size).ok_or(too_small)?, std::mem::align_of::<usize>());

        if end <= begin {
            return Err(too_small);
        }

        ExpandingHeap::write(NonNull::new_unchecked(begin as *mut u8), end - begin, None, flags)
    }

    /// Maps a root arena from the OS and builds every heap `config` names:
    /// the game heap first, then the named heaps in declaration order.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let arena = PlatformArena::map(config.root_arena_size)
            .ok_or(ConfigError::ArenaUnavailable(config.root_arena_size))?;

        let mut context = unsafe { Self::bootstrap_with(arena.start(), arena.len(), config.flags())? };
        context.backing = Some(arena);

        if let Some(root) = context.root_mut().as_expanding() {
            root.set_fit_policy(config.fit_policy);
        }

        if config.game_heap_size > 0 {
            context.create_game_heap(config.game_heap_size)?;
        }

        for heap in &config.heaps {
            let parent = match heap.parent.as_deref() {
                None | Some(ROOT_HEAP_NAME) => context.root,
                Some(GAME_HEAP_NAME) => context.game.ok_or(HeapError::UnknownHeap)?,
                Some(name) => context.named_heap(name).ok_or(HeapError::UnknownHeap)?,
            };

            let created = context.create_heap(heap.kind, heap.size, Some(parent), heap.alignment)?;
            context.name_heap(&heap.name, created)?;
        }

        log::debug!(
            "memory context ready: {} named heaps, {} bytes free at root",
            context.named.len(),
            context.root_mut().memory_left()
        );

        Ok(context)
    }

    /// Handle of the root heap.
    pub fn root(&self) -> HeapRef {
        self.root
    }

    /// Heap used by calls that don't name one.
    pub fn default_heap(&self) -> HeapRef {
        self.default
    }

    pub fn game_heap(&self) -> Option<HeapRef> {
        self.game
    }

    /// Default heap saved by [`Self::push_solid_default`].
    pub fn temporary_heap(&self) -> Option<HeapRef> {
        self.temporary
    }

    fn root_mut(&mut self) -> &mut dyn Heap {
        unsafe { self.root.resolve() }
    }

    /// Whether `heap` names a heap that is still alive in this context.
    pub fn is_live(&self, heap: HeapRef) -> bool {
        unsafe { self.roots.reaches(heap.record()) }
    }

    fn live(&self, heap: HeapRef) -> Result<HeapRef, HeapError> {
        if self.is_live(heap) {
            Ok(heap)
        } else {
            Err(HeapError::UnknownHeap)
        }
    }

    /// Facade of a live heap.
    pub fn heap(&self, heap: HeapRef) -> Result<&dyn Heap, HeapError> {
        self.live(heap).map(|heap| unsafe { &*heap.resolve() })
    }

    /// Facade of a live heap.
    pub fn heap_mut(&mut self, heap: HeapRef) -> Result<&mut dyn Heap, HeapError> {
        self.live(heap).map(|heap| unsafe { heap.resolve() })
    }

    /// Solid facade of a live heap, [`HeapError::WrongKind`] otherwise.
    pub fn solid_heap_mut(&mut self, heap: HeapRef) -> Result<&mut SolidHeap, HeapError> {
        self.heap_mut(heap)?.as_solid().ok_or(HeapError::WrongKind)
    }

    /// Expanding facade of a live heap, [`HeapError::WrongKind`] otherwise.
    pub fn expanding_heap_mut(&mut self, heap: HeapRef) -> Result<&mut ExpandingHeap, HeapError> {
        self.heap_mut(heap)?.as_expanding().ok_or(HeapError::WrongKind)
    }

    /// Facade of `heap`, or of the default heap.
    fn target(&mut self, heap: Option<HeapRef>) -> Result<&mut dyn Heap, HeapError> {
        match heap {
            Some(heap) => self.heap_mut(heap),
            None => Ok(unsafe { self.default.resolve() }),
        }
    }

    /// Carves a nested heap of `size` usable bytes out of `parent` (the
    /// default heap if `None`). It inherits the parent's flags. A negative
    /// `align` places it at the end of the parent's free space.
    pub fn create_heap(
        &mut self,
        kind: HeapKind,
        size: usize,
        parent: Option<HeapRef>,
        align: i32,
    ) -> Result<HeapRef, HeapError> {
        let parent = match parent {
            Some(parent) => self.live(parent)?,
            None => self.default,
        };
        let flags = unsafe { parent.resolve().flags() };

        unsafe { heap::create_nested(parent, kind, size, align, flags) }
    }

    /// See [`Self::create_heap`].
    pub fn create_expanding_heap(&mut self, size: usize, parent: Option<HeapRef>, align: i32) -> Result<HeapRef, HeapError> {
        self.create_heap(HeapKind::Expanding, size, parent, align)
    }

    /// See [`Self::create_heap`].
    pub fn create_solid_heap(&mut self, size: usize, parent: Option<HeapRef>, align: i32) -> Result<HeapRef, HeapError> {
        self.create_heap(HeapKind::Solid, size, parent, align)
    }

    /// Carves the game heap out of the root. Only once.
    pub fn create_game_heap(&mut self, size: usize) -> Result<HeapRef, HeapError> {
        if self.game.is_some() {
            return Err(HeapError::AlreadyInitialized("game heap"));
        }

        let game = self.create_expanding_heap(size, Some(self.root), crate::alignment::DEFAULT_ALIGNMENT)?;
        self.game = Some(game);

        Ok(game)
    }

    /// Allocates from `heap`, or from the default heap if `None`.
    pub fn allocate(&mut self, size: usize, align: i32, heap: Option<HeapRef>) -> AllocResult {
        self.target(heap)?.allocate(size, align)
    }

    /// Releases an allocation of `heap`, or of the default heap if `None`.
    ///
    /// # Safety
    ///
    /// `address` must come from that heap and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>, heap: Option<HeapRef>) -> Result<(), HeapError> {
        self.target(heap)?.deallocate(address)
    }

    /// Resizes an allocation of `heap` (or the default heap) in place and
    /// returns its final size.
    ///
    /// # Safety
    ///
    /// See [`Heap::reallocate`].
    pub unsafe fn reallocate(
        &mut self,
        address: NonNull<u8>,
        new_size: usize,
        heap: Option<HeapRef>,
    ) -> Result<usize, HeapError> {
        self.target(heap)?.reallocate(address, new_size)
    }

    /// Makes `heap` the default heap and returns the previous one. Callers
    /// restore it themselves, see [`Self::scoped_default`] for a guard that
    /// does it on drop.
    pub fn set_default(&mut self, heap: HeapRef) -> Result<HeapRef, HeapError> {
        let heap = self.live(heap)?;
        Ok(std::mem::replace(&mut self.default, heap))
    }

    /// Makes `heap` the default heap until the guard is dropped. The guard
    /// derefs to the context, so allocation calls go through it.
    ///
    /// ```rust
    /// use nestalloc::MemoryContext;
    ///
    /// let mut memory = vec![0usize; 4096];
    /// let size = memory.len() * std::mem::size_of::<usize>();
    /// let start = std::ptr::NonNull::new(memory.as_mut_ptr().cast()).unwrap();
    /// let mut context = unsafe { MemoryContext::bootstrap(start, size).unwrap() };
    /// let scratch = context.create_solid_heap(1024, None, 8).unwrap();
    ///
    /// {
    ///     let mut scoped = context.scoped_default(scratch).unwrap();
    ///     let address = scoped.allocate(64, 8, None).unwrap();
    ///     assert!(scoped.heap(scratch).unwrap().contains(address));
    /// }
    ///
    /// assert_eq!(context.default_heap(), context.root());
    /// ```
    pub fn scoped_default(&mut self, heap: HeapRef) -> Result<DefaultHeapGuard<'_>, HeapError> {
        let previous = self.set_default(heap)?;
        Ok(DefaultHeapGuard {
            context: self,
            previous,
        })
    }

    /// Creates a solid heap inside `parent` (default heap if `None`) and
    /// makes it the default heap. The previous default is kept in the
    /// temporary slot until [`Self::restore_from_temporary`]. One at a time.
    pub fn push_solid_default(&mut self, size: usize, parent: Option<HeapRef>, align: i32) -> Result<HeapRef, HeapError> {
        if self.temporary.is_some() {
            return Err(HeapError::AlreadyInitialized("temporary heap"));
        }

        let solid = self.create_solid_heap(size, parent, align)?;
        self.temporary = Some(std::mem::replace(&mut self.default, solid));

        Ok(solid)
    }

    /// Puts back the default heap saved by [`Self::push_solid_default`] and
    /// returns the heap that was default until now, so that it can be reset
    /// and destroyed.
    pub fn restore_from_temporary(&mut self) -> Result<HeapRef, HeapError> {
        let previous = self.temporary.take().ok_or(HeapError::UnknownHeap)?;
        let previous = if self.is_live(previous) { previous } else { self.root };

        Ok(std::mem::replace(&mut self.default, previous))
    }

    /// Destroys an empty nested heap and gives its arena back to the parent.
    /// Slots naming it are cleared; a default heap being destroyed falls back
    /// to its parent.
    pub fn destroy_heap(&mut self, heap: HeapRef) -> Result<(), HeapError> {
        let heap = self.live(heap)?;
        let parent = unsafe { heap.resolve().parent() };

        unsafe { heap::destroy(heap)? };

        let fallback = parent.unwrap_or(self.root);
        if self.default == heap {
            self.default = fallback;
        }
        if self.game == Some(heap) {
            self.game = None;
        }
        if self.temporary == Some(heap) {
            self.temporary = Some(fallback);
        }
        self.named.retain(|(_, named)| *named != heap);

        Ok(())
    }

    /// Gives `heap` a name that [`Self::named_heap`] can find.
    pub fn name_heap(&mut self, name: &str, heap: HeapRef) -> Result<(), HeapError> {
        let heap = self.live(heap)?;

        if self.named.iter().any(|(existing, _)| existing == name) {
            return Err(HeapError::AlreadyInitialized("heap name"));
        }

        self.named.push((name.to_owned(), heap));
        Ok(())
    }

    pub fn named_heap(&self, name: &str) -> Option<HeapRef> {
        self.named
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, heap)| *heap)
    }

    /// Innermost live heap whose arena contains `address`.
    pub fn find_innermost(&self, address: NonNull<u8>) -> Option<HeapRef> {
        unsafe {
            self.roots
                .find_innermost(address.as_ptr() as usize)
                .map(HeapRef::from_record)
        }
    }

    /// Releases `address` on whichever heap owns it.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of one of this context's heaps.
    pub unsafe fn free(&mut self, address: NonNull<u8>) -> Result<(), HeapError> {
        let heap = self.find_innermost(address).ok_or(HeapError::NotFound(address))?;
        heap.resolve().deallocate(address)
    }

    /// Size of `address` on whichever heap owns it.
    pub fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError> {
        let heap = self.find_innermost(address).ok_or(HeapError::NotFound(address))?;
        unsafe { heap.resolve().size_of(address) }
    }

    /// Adds another root-level arena. It becomes an expanding heap with no
    /// parent, tried first by [`Self::allocate_anywhere`].
    ///
    /// # Safety
    ///
    /// Same as [`Self::bootstrap`].
    pub unsafe fn attach_arena(&mut self, start: NonNull<u8>, size: usize) -> Result<HeapRef, HeapError> {
        let low = start.as_ptr() as usize;
        let high = low.checked_add(size).ok_or(HeapError::ArenaTooSmall { size })?;

        if self
            .roots
            .iter()
            .any(|heap| heap.as_ref().data.start < high && low < heap.as_ref().data.end)
        {
            return Err(HeapError::Overlapping);
        }

        let flags = self.root.resolve().flags();
        let heap = Self::root_level_heap(start, size, flags)?;
        self.roots.insert_ordered(heap.record());

        log::debug!("attached arena of {size} bytes at {start:p}");

        Ok(heap)
    }

    /// Tries every attached arena, then the default heap.
    pub fn allocate_anywhere(&mut self, size: usize, align: i32) -> AllocResult {
        let root = self.root;

        for record in unsafe { self.roots.iter() } {
            let heap = HeapRef::from_record(record);
            if heap == root {
                continue;
            }

            match unsafe { heap.resolve().allocate(size, align) } {
                Err(HeapError::Exhausted { .. }) => continue,
                result => return result,
            }
        }

        self.allocate(size, align, None)
    }

    /// Free bytes over every root-level heap.
    pub fn total_memory_left(&self) -> usize {
        unsafe {
            self.roots
                .iter()
                .map(|record| HeapRef::from_record(record).resolve().memory_left())
                .sum()
        }
    }

    /// Every live heap, parents before children.
    pub fn heaps(&self) -> Vec<HeapRef> {
        fn walk(index: &NestedHeaps, heaps: &mut Vec<HeapRef>) {
            for record in unsafe { index.iter() } {
                heaps.push(HeapRef::from_record(record));
                walk(unsafe { &record.as_ref().data.children }, heaps);
            }
        }

        let mut heaps = Vec::new();
        walk(&self.roots, &mut heaps);
        heaps
    }

    /// Validates every heap. The first failure latches the damaged flag,
    /// which stays set for the lifetime of the context.
    pub fn check_integrity(&mut self) -> bool {
        for heap in self.heaps() {
            let intact = match unsafe { heap.kind() } {
                Ok(_) => unsafe { heap.resolve().is_intact() },
                Err(_) => false,
            };

            if !intact {
                log::error!("heap at {:p} failed its integrity check", heap.address());
                self.damaged = true;
            }
        }

        !self.damaged
    }

    /// Whether an integrity check has ever failed.
    pub fn is_damaged(&self) -> bool {
        self.damaged
    }
}

/// Restores the previous default heap when dropped. See
/// [`MemoryContext::scoped_default`].
pub struct DefaultHeapGuard<'a> {
    context: &'a mut MemoryContext,
    previous: HeapRef,
}

impl Deref for DefaultHeapGuard<'_> {
    type Target = MemoryContext;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for DefaultHeapGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for DefaultHeapGuard<'_> {
    fn drop(&mut self) {
        self.context.default = if self.context.is_live(self.previous) {
            self.previous
        } else {
            self.context.root
        };
    }
}
