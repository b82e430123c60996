use std::ptr::NonNull;

use crate::{
    align::{align, align_down, align_up},
    alignment::{Alignment, Direction, POINTER_SIZE},
    checkpoint::{Checkpoint, CheckpointStack, CHECKPOINT_SIZE},
    error::HeapError,
    AllocResult,
};

/// Which cursors [`SolidAllocator::reset`] moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetEnds {
    /// Forward cursor back to the arena start. Clears every checkpoint.
    Front,
    /// Backward cursor back to the arena end. Checkpoints are kept, their
    /// saved backward cursors move to the arena end as well.
    Back,
    /// Both of the above.
    Both,
}

impl ResetEnds {
    fn front(self) -> bool {
        matches!(self, ResetEnds::Front | ResetEnds::Both)
    }

    fn back(self) -> bool {
        matches!(self, ResetEnds::Back | ResetEnds::Both)
    }
}

/// Bump allocator with two cursors. The free region is `[front, back)`:
/// forward allocations move `front` up, backward allocations move `back`
/// down, and the two never cross.
///
/// ```text
/// start                front                 back                    end
///   |                    |                     |                       |
///   v                    v                     v                       v
///   +-------+-------+----+---------------------+--------+--------------+
///   | Fwd 1 | Fwd 2 |pad |        Free         | Back 2 |    Back 1    |
///   +-------+-------+----+---------------------+--------+--------------+
/// ```
///
/// There is no per-allocation release. Memory comes back through
/// checkpoints (see [`crate::checkpoint`]) or a full [`Self::reset`].
pub struct SolidAllocator {
    start: usize,
    end: usize,
    front: usize,
    back: usize,
    states: CheckpointStack,
    /// Most recent forward allocation, the only one that can be resized.
    tip: Option<usize>,
}

impl SolidAllocator {
    /// Takes over `[start, start + size)`, shrunk inwards to word boundaries.
    ///
    /// # Safety
    ///
    /// The range must be valid for reads and writes for as long as the
    /// allocator is alive.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Result<Self, HeapError> {
        let address = start.as_ptr() as usize;
        let too_small = HeapError::ArenaTooSmall { size };

        let begin = align(address).ok_or(too_small)?;
        let end = align_down(address.checked_add(size).ok_or(too_small)?, POINTER_SIZE);

        if end < begin {
            return Err(too_small);
        }

        Ok(Self {
            start: begin,
            end,
            front: begin,
            back: end,
            states: CheckpointStack::new(),
            tip: None,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    /// Forward cursor.
    pub fn front(&self) -> usize {
        self.front
    }

    /// Backward cursor.
    pub fn back(&self) -> usize {
        self.back
    }

    /// Number of saved states on the stack.
    pub fn saved_states(&self) -> usize {
        self.states.len()
    }

    /// Nothing allocated from either end and no saved states.
    pub fn is_empty(&self) -> bool {
        self.front == self.start && self.back == self.end && self.states.is_empty()
    }

    /// Bumps one of the cursors by `size` rounded up to a word, after
    /// aligning it. Fails without touching anything if the cursors would
    /// cross.
    pub fn allocate(&mut self, size: usize, alignment: Alignment) -> AllocResult {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }

        let exhausted = HeapError::Exhausted { size };
        let rounded = align(size).ok_or(exhausted)?;
        let align = alignment.effective();

        let address = match alignment.direction() {
            Direction::Forward => {
                let address = align_up(self.front, align).ok_or(exhausted)?;
                let front = address.checked_add(rounded).ok_or(exhausted)?;
                if front > self.back {
                    return Err(exhausted);
                }
                self.front = front;
                self.tip = Some(address);
                address
            }
            Direction::Backward => {
                let address = align_down(self.back.checked_sub(rounded).ok_or(exhausted)?, align);
                if address < self.front {
                    return Err(exhausted);
                }
                self.back = address;
                address
            }
        };

        log::trace!("bumped {rounded} bytes at {address:#x}");

        // SAFETY: cursors never leave `[start, end)`, which is non-null.
        Ok(unsafe { NonNull::new_unchecked(address as *mut u8) })
    }

    /// Pushes a checkpoint with both cursors. The record takes
    /// [`CHECKPOINT_SIZE`] bytes from the front of the free region, so this
    /// can run out of memory like any other allocation. The cursors are
    /// saved before the record is bumped, loading the state releases it.
    pub fn save_state(&mut self, id: u32) -> Result<(), HeapError> {
        let (front, back) = (self.front, self.back);

        let forward = Alignment::new(POINTER_SIZE, Direction::Forward)?;
        let address = self.allocate(CHECKPOINT_SIZE, forward)?;

        unsafe { self.states.push(Checkpoint { id, front, back }, address) };
        self.tip = None;

        log::debug!("saved state {id} (front {front:#x}, back {back:#x})");

        Ok(())
    }

    /// Cursors that [`Self::load_state`] would restore for `id`.
    pub fn peek_state(&self, id: u32) -> Option<(usize, usize)> {
        unsafe {
            self.states
                .find(id)
                .map(|node| (node.as_ref().data.front, node.as_ref().data.back))
        }
    }

    /// Restores the cursors saved under `id` and drops that checkpoint along
    /// with every newer one. Everything allocated since is gone. An unknown
    /// id leaves the allocator untouched.
    pub fn load_state(&mut self, id: u32) -> Result<(), HeapError> {
        let snapshot = unsafe {
            let target = self.states.find(id).ok_or(HeapError::UnknownState(id))?;
            self.states.pop_through(target)
        };

        self.front = snapshot.front;
        self.back = snapshot.back;
        self.tip = None;

        log::debug!("loaded state {id} (front {:#x}, back {:#x})", self.front, self.back);

        Ok(())
    }

    /// Moves one or both cursors back to the arena bounds.
    pub fn reset(&mut self, ends: ResetEnds) {
        if ends.front() {
            self.front = self.start;
            self.tip = None;
            self.states.clear();
        }

        if ends.back() {
            self.back = self.end;
            unsafe { self.states.move_back_cursors(self.end) };
        }

        log::debug!("reset {ends:?} of [{:#x}, {:#x})", self.start, self.end);
    }

    /// Resizes the most recent forward allocation and returns the new size.
    /// Any other address is [`HeapError::NotTip`].
    pub fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Result<usize, HeapError> {
        if new_size == 0 {
            return Err(HeapError::ZeroSize);
        }

        let raw = address.as_ptr() as usize;
        if raw < self.start || raw >= self.end {
            return Err(HeapError::NotFound(address));
        }
        if self.tip != Some(raw) {
            return Err(HeapError::NotTip(address));
        }

        let rounded = align(new_size).ok_or(HeapError::ResizeFailed)?;
        let front = raw.checked_add(rounded).ok_or(HeapError::ResizeFailed)?;
        if front > self.back {
            return Err(HeapError::ResizeFailed);
        }

        self.front = front;

        Ok(rounded)
    }

    /// Size of the most recent forward allocation. Nothing else has a
    /// known size in a bump region.
    pub fn size_of(&self, address: NonNull<u8>) -> Result<usize, HeapError> {
        let raw = address.as_ptr() as usize;
        if raw < self.start || raw >= self.end {
            return Err(HeapError::NotFound(address));
        }

        match self.tip {
            Some(tip) if tip == raw => Ok(self.front - tip),
            _ => Err(HeapError::Unsupported),
        }
    }

    /// Free region size.
    pub fn memory_left(&self) -> usize {
        self.back - self.front
    }

    /// Biggest request that would currently succeed with `alignment`. The
    /// same in both directions.
    pub fn max_allocatable(&self, alignment: Alignment) -> usize {
        align_up(self.front, alignment.effective())
            .filter(|first| *first <= self.back)
            .map_or(0, |first| self.back - first)
    }

    /// Number of bytes from the arena start to the forward cursor, which is
    /// what the arena can shrink to. Only possible while nothing is
    /// allocated from the back.
    pub fn fitted_size(&self) -> Result<usize, HeapError> {
        if self.back != self.end {
            return Err(HeapError::ResizeFailed);
        }

        Ok(self.front - self.start)
    }

    /// Moves the arena end down to `end`. The backward cursor follows.
    ///
    /// # Safety
    ///
    /// `end` must not be lower than the forward cursor and nothing may be
    /// allocated from the back. Memory past `end` no longer belongs to the
    /// allocator.
    pub(crate) unsafe fn truncate(&mut self, end: usize) {
        debug_assert!(end >= self.front && self.back == self.end);

        self.end = end;
        self.back = end;
        self.states.move_back_cursors(end);
    }

    /// Cursors in order, and every checkpoint record sits between its own
    /// saved forward cursor and the current one.
    pub fn is_intact(&self) -> bool {
        if !(self.start <= self.front && self.front <= self.back && self.back <= self.end) {
            return false;
        }

        let mut previous = self.start;

        unsafe {
            self.states.iter().all(|node| {
                let record = node.as_ptr() as usize;
                let state = node.as_ref().data;
                let ok = state.front >= previous
                    && record >= state.front
                    && record + CHECKPOINT_SIZE <= self.front
                    && state.front <= state.back
                    && state.back <= self.end;
                previous = record + CHECKPOINT_SIZE;
                ok
            })
        }
    }
}
