use std::{mem, ptr::NonNull};

use crate::{
    list::{LinkedList, Node},
    Pointer,
};

/// Saved cursor positions of a [`crate::solid::SolidAllocator`]. Records
/// are allocated from the solid arena itself and chained into a stack
/// through their [`Node`] links: `prev` is the previously pushed checkpoint,
/// the list tail is the top of the stack.
///
/// ```text
/// +-------+-------+--------+-------+-------+--------+-------+--------------+
/// | Alloc | Alloc | State1 | Alloc | Alloc | State2 | Alloc |  Free  ...   |
/// +-------+-------+--------+-------+-------+--------+-------+--------------+
///                     ^                        |
///                     |                        |
///                     +------------------------+
///                           prev (top = State2)
/// ```
///
/// The snapshot is taken before the record itself is allocated, so
/// restoring it gives back the record along with everything that came
/// later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Checkpoint {
    /// Chosen by the caller, not required to be unique. The most recent
    /// checkpoint with a given id wins.
    pub id: u32,
    /// Forward cursor at snapshot time.
    pub front: usize,
    /// Backward cursor at snapshot time.
    pub back: usize,
}

/// Bytes taken from the free region by every saved state.
pub(crate) const CHECKPOINT_SIZE: usize = mem::size_of::<Node<Checkpoint>>();

pub(crate) type CheckpointStack = LinkedList<Checkpoint>;

impl CheckpointStack {
    /// Writes a checkpoint at `address` and makes it the new top.
    ///
    /// # Safety
    ///
    /// `address` must be valid for [`CHECKPOINT_SIZE`] bytes, word aligned,
    /// and owned by the stack until the record is popped.
    pub unsafe fn push(&mut self, checkpoint: Checkpoint, address: NonNull<u8>) -> NonNull<Node<Checkpoint>> {
        self.append(checkpoint, address)
    }

    /// Most recent checkpoint with `id`.
    pub unsafe fn find(&self, id: u32) -> Pointer<Node<Checkpoint>> {
        self.iter_rev().find(|node| node.as_ref().data.id == id)
    }

    /// Pops every checkpoint above `target` and `target` itself, returning
    /// the snapshot stored in `target`.
    ///
    /// # Safety
    ///
    /// `target` must be on this stack.
    pub unsafe fn pop_through(&mut self, target: NonNull<Node<Checkpoint>>) -> Checkpoint {
        let snapshot = target.as_ref().data;

        while let Some(top) = self.last() {
            self.remove(top);
            if top == target {
                break;
            }
        }

        snapshot
    }

    /// Moves the saved backward cursor of every checkpoint to `end`.
    pub unsafe fn move_back_cursors(&mut self, end: usize) {
        for mut node in self.iter() {
            node.as_mut().data.back = end;
        }
    }

    /// Forgets every checkpoint. Records are not touched, their memory
    /// belongs to the region being reset anyway.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
