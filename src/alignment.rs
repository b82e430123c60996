//! Alignment and direction of allocation requests. Callers describe both
//! with one signed integer: the magnitude is the byte alignment and the sign
//! picks which end of the arena the search starts from. See [`Alignment`].
//!
//! # Padding policy
//!
//! All node headers are written at word aligned addresses, so every block
//! size is rounded up to [`POINTER_SIZE`] and any alignment smaller than a
//! word is raised to a word. When a request needs a stricter alignment than
//! the free block offers, the payload is moved forward until it is aligned
//! and the node header is written right in front of it:
//!
//! ```text
//!                          +----------------------------+
//! Free block start -> 0x00 | old free node header       |  <---+ Gap of 0x20 bytes:
//!                          |                            |      | too small to be a
//!                          +----------------------------+  <---+ node (< 0x28).
//!  Node header     -> 0x20 | allocated node header      |  <---+ offset hint = 0x20
//!                          +----------------------------+      |
//!  User pointer    -> 0x40 | user content (align 0x40)  |      | Allocated node
//!                          |            ...             |  <---+
//!                          +----------------------------+
//! ```
//!
//! If the gap in front of the header can hold a header plus a minimal block
//! it stays behind as a smaller free node. Otherwise the gap is absorbed by
//! the allocated node and its size is recorded in the node's relative offset
//! hint, so that deallocation gives the exact original range back to the free
//! list. The same applies to the tail: a remainder too small to become a free
//! node is added to the allocated payload.

use std::mem;

use crate::error::HeapError;

/// Pointer size in bytes on the current machine. Minimum alignment of every
/// block and header handled by this crate.
pub const POINTER_SIZE: usize = mem::size_of::<usize>();

/// Alignment used by untargeted convenience calls.
pub const DEFAULT_ALIGNMENT: i32 = 4;

/// Which end of the free space an allocation is taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// Search from the arena start, hand out low addresses first.
    #[default]
    Forward,
    /// Search from the arena end, hand out high addresses first.
    Backward,
}

/// A validated allocation alignment plus direction.
///
/// ```rust
/// use nestalloc::{Alignment, Direction};
///
/// let forward = Alignment::from_signed(16).unwrap();
/// assert_eq!(forward.bytes(), 16);
/// assert_eq!(forward.direction(), Direction::Forward);
///
/// let backward = Alignment::from_signed(-4).unwrap();
/// assert_eq!(backward.bytes(), 4);
/// assert_eq!(backward.direction(), Direction::Backward);
///
/// assert!(Alignment::from_signed(0).is_err());
/// assert!(Alignment::from_signed(12).is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Alignment {
    bytes: usize,
    direction: Direction,
}

impl Alignment {
    /// Builds an alignment from its parts. `bytes` must be a power of two.
    pub fn new(bytes: usize, direction: Direction) -> Result<Self, HeapError> {
        if !bytes.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(
                i32::try_from(bytes).unwrap_or(i32::MAX),
            ));
        }

        Ok(Self { bytes, direction })
    }

    /// Decodes the signed convention used throughout the public API: a
    /// negative value allocates backwards, the absolute value is the
    /// alignment.
    pub fn from_signed(align: i32) -> Result<Self, HeapError> {
        let direction = if align < 0 {
            Direction::Backward
        } else {
            Direction::Forward
        };

        let bytes = align.unsigned_abs() as usize;
        Self::new(bytes, direction).map_err(|_| HeapError::InvalidAlignment(align))
    }

    /// Requested alignment in bytes.
    #[inline]
    pub fn bytes(self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn direction(self) -> Direction {
        self.direction
    }

    /// The alignment the allocators actually honour: never less than a
    /// machine word. See the module docs.
    #[inline]
    pub(crate) fn effective(self) -> usize {
        self.bytes.max(POINTER_SIZE)
    }
}

impl TryFrom<i32> for Alignment {
    type Error = HeapError;

    fn try_from(align: i32) -> Result<Self, Self::Error> {
        Self::from_signed(align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_alignments() {
        for shift in 0..12 {
            let bytes = 1i32 << shift;

            let forward = Alignment::from_signed(bytes).unwrap();
            assert_eq!(forward.bytes(), bytes as usize);
            assert_eq!(forward.direction(), Direction::Forward);

            let backward = Alignment::from_signed(-bytes).unwrap();
            assert_eq!(backward.bytes(), bytes as usize);
            assert_eq!(backward.direction(), Direction::Backward);
        }
    }

    #[test]
    fn rejects_non_powers_of_two() {
        for align in [0, 3, -3, 6, 12, -24, 100] {
            assert_eq!(
                Alignment::from_signed(align),
                Err(HeapError::InvalidAlignment(align))
            );
        }
    }

    #[test]
    fn effective_alignment_is_at_least_a_word() {
        let small = Alignment::from_signed(1).unwrap();
        assert_eq!(small.effective(), POINTER_SIZE);

        let large = Alignment::from_signed(64).unwrap();
        assert_eq!(large.effective(), 64);
    }

    #[test]
    fn i32_min_is_a_backward_power_of_two() {
        let align = Alignment::from_signed(i32::MIN).unwrap();
        assert_eq!(align.bytes(), 1 << 31);
        assert_eq!(align.direction(), Direction::Backward);
    }
}
