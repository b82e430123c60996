//! Heap identity records and the nested heap index.
//!
//! Every heap starts with a [`Header<HeapRecord>`] at the very front of its
//! arena. The record says which allocator follows it in memory, which range
//! the heap manages, and which heaps have been carved out of that range:
//!
//! ```text
//! +------------------------------------------------------------------------+
//! | Parent arena                                                           |
//! | +--------+ +-------------------------+   +----------------------+      |
//! | | Parent | | Child A                 |   | Child B              |      |
//! | | record | | +--------+ +----------+ |   | +--------+           |      |
//! | |        | | | record | | Child A1 | | ->| | record |   ...     | ...  |
//! | +--------+ | +--------+ +----------+ |   | +--------+           |      |
//! |            +-------------------------+   +----------------------+      |
//! +------------------------------------------------------------------------+
//! ```
//!
//! Children of one parent are linked in address order through the record
//! links, so locating the heap that owns an address is a walk down the tree.

use std::{ops::BitOr, ptr::NonNull};

use serde::Deserialize;

use crate::{header::Header, list::LinkedList, Pointer};

/// Which allocator sits right after a [`HeapRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapKind {
    /// Free-list allocator, see [`crate::expanding`].
    Expanding,
    /// Bump allocator, see [`crate::solid`].
    Solid,
}

impl HeapKind {
    const EXPANDING: u32 = u32::from_be_bytes(*b"HPXE");
    const SOLID: u32 = u32::from_be_bytes(*b"HMRF");

    fn magic(self) -> u32 {
        match self {
            HeapKind::Expanding => Self::EXPANDING,
            HeapKind::Solid => Self::SOLID,
        }
    }
}

impl TryFrom<u32> for HeapKind {
    type Error = u32;

    fn try_from(magic: u32) -> Result<Self, Self::Error> {
        match magic {
            Self::EXPANDING => Ok(HeapKind::Expanding),
            Self::SOLID => Ok(HeapKind::Solid),
            other => Err(other),
        }
    }
}

/// Per heap behaviour switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct HeapFlags(u32);

impl HeapFlags {
    /// Released payloads are overwritten with zeroes.
    pub const ZERO_FILL: Self = Self(1 << 0);

    /// Failing to allocate stops the process instead of returning an error.
    pub const ABORT_ON_EXHAUSTION: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for HeapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Identity of one heap. See the module docs.
pub(crate) struct HeapRecord {
    /// Raw [`HeapKind`], validated on every read.
    magic: u32,
    pub flags: HeapFlags,
    /// First byte of the heap's arena, which is also where this record lives.
    pub start: usize,
    /// One past the last byte of the arena.
    pub end: usize,
    /// Heaps carved out of this arena.
    pub children: NestedHeaps,
}

impl HeapRecord {
    pub fn new(kind: HeapKind, start: usize, end: usize, flags: HeapFlags) -> Self {
        debug_assert!(start <= end);

        Self {
            magic: kind.magic(),
            flags,
            start,
            end,
            children: NestedHeaps::new(),
        }
    }
}

impl Header<HeapRecord> {
    /// Decoded kind, or the raw magic if it is not one of ours.
    #[inline]
    pub fn kind(&self) -> Result<HeapKind, u32> {
        HeapKind::try_from(self.data.magic)
    }

    /// Wipes the magic of a destroyed heap so that stale handles stop
    /// resolving.
    #[inline]
    pub fn invalidate(&mut self) {
        self.data.magic = 0;
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        self.data.start <= address && address < self.data.end
    }
}

/// Children of one heap, ordered by address. Linear in the number of
/// siblings, which is expected to stay small.
pub(crate) type NestedHeaps = LinkedList<HeapRecord>;

impl NestedHeaps {
    /// # Safety
    ///
    /// `record` must be valid and unlinked.
    pub unsafe fn insert_first(&mut self, record: NonNull<Header<HeapRecord>>) {
        self.push_front(record);
    }

    /// # Safety
    ///
    /// `before` must be a child of this index, `record` must be unlinked.
    pub unsafe fn insert_before_record(
        &mut self,
        before: NonNull<Header<HeapRecord>>,
        record: NonNull<Header<HeapRecord>>,
    ) {
        self.insert_before(Some(before), record);
    }

    /// # Safety
    ///
    /// `record` must be valid and unlinked.
    pub unsafe fn insert_last(&mut self, record: NonNull<Header<HeapRecord>>) {
        self.push_back(record);
    }

    /// Links `record` before the first child that starts after it.
    ///
    /// # Safety
    ///
    /// `record` must be valid, unlinked, and must not overlap any child.
    pub unsafe fn insert_ordered(&mut self, record: NonNull<Header<HeapRecord>>) {
        let start = record.as_ref().data.start;

        match self.iter().find(|child| child.as_ref().data.start > start) {
            Some(child) if self.first() == Some(child) => self.insert_first(record),
            Some(child) => self.insert_before_record(child, record),
            None => self.insert_last(record),
        }
    }

    /// Deepest record in this subtree whose range contains `address`.
    ///
    /// # Safety
    ///
    /// Every record reachable from this index must be valid.
    pub unsafe fn find_innermost(&self, address: usize) -> Pointer<Header<HeapRecord>> {
        let child = self.iter().find(|child| child.as_ref().contains(address))?;

        child.as_ref().data.children.find_innermost(address).or(Some(child))
    }

    /// Whether `record` is reachable from this index.
    ///
    /// # Safety
    ///
    /// See [`Self::find_innermost`].
    pub unsafe fn reaches(&self, record: NonNull<Header<HeapRecord>>) -> bool {
        self.iter()
            .any(|child| child == record || child.as_ref().data.children.reaches(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records are normally written at the front of their own arena. Here
    /// they live in a side buffer and only describe ranges.
    struct Records {
        memory: Vec<[usize; 16]>,
    }

    impl Records {
        fn new(count: usize) -> Self {
            Self {
                memory: vec![[0; 16]; count],
            }
        }

        unsafe fn write(
            &mut self,
            index: usize,
            kind: HeapKind,
            start: usize,
            end: usize,
        ) -> NonNull<Header<HeapRecord>> {
            let address = NonNull::from(&mut self.memory[index]).cast();
            LinkedList::write(HeapRecord::new(kind, start, end, HeapFlags::empty()), address)
        }
    }

    #[test]
    fn ordered_insertion_and_lookup() {
        let mut records = Records::new(4);
        let mut root = NestedHeaps::new();

        unsafe {
            let outer = records.write(0, HeapKind::Expanding, 0x1000, 0x2000);
            let late = records.write(1, HeapKind::Solid, 0x3000, 0x3800);
            let early = records.write(2, HeapKind::Expanding, 0x0800, 0x0900);
            let inner = records.write(3, HeapKind::Solid, 0x1400, 0x1500);

            root.insert_ordered(outer);
            root.insert_ordered(late);
            root.insert_ordered(early);
            (*outer.as_ptr()).data.children.insert_ordered(inner);

            let order: Vec<_> = root.iter().collect();
            assert_eq!(order, [early, outer, late]);

            assert_eq!(root.find_innermost(0x1450), Some(inner));
            assert_eq!(root.find_innermost(0x1000), Some(outer));
            assert_eq!(root.find_innermost(0x3000), Some(late));
            assert_eq!(root.find_innermost(0x2000), None);
            assert!(root.reaches(inner));

            root.remove(late);
            assert_eq!(root.find_innermost(0x3000), None);
            assert!(!root.reaches(late));
        }
    }

    #[test]
    fn kinds_and_flags() {
        let mut records = Records::new(1);

        unsafe {
            let mut record = records.write(0, HeapKind::Solid, 0, 64);
            assert_eq!(record.as_ref().kind(), Ok(HeapKind::Solid));

            record.as_mut().invalidate();
            assert_eq!(record.as_ref().kind(), Err(0));
        }

        let flags = HeapFlags::ZERO_FILL | HeapFlags::ABORT_ON_EXHAUSTION;
        assert!(flags.contains(HeapFlags::ZERO_FILL));
        assert!(!HeapFlags::empty().contains(HeapFlags::ZERO_FILL));

        let mut flags = flags;
        flags.set(HeapFlags::ZERO_FILL, false);
        assert_eq!(flags, HeapFlags::ABORT_ON_EXHAUSTION);
    }
}
