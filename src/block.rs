use std::{mem, ptr::NonNull};

use crate::{alignment::Direction, alignment::POINTER_SIZE, header::Header};

/// Minimum payload of a node. A remainder that cannot hold a header plus
/// this many bytes is never turned into its own node, it stays with the
/// neighbouring block instead.
pub(crate) const MIN_BLOCK_SIZE: usize = POINTER_SIZE;

/// Node header size in bytes. See [`Header<T>`] and [`Block`].
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Header<Block>>();

/// Largest relative offset a node can remember, see [`Block`].
const MAX_OFFSET: usize = 0x7F;

// The gap absorbed in front of a header is always smaller than a header plus
// a minimal block, otherwise it would have become a free node.
const _: () = assert!(BLOCK_HEADER_SIZE + MIN_BLOCK_SIZE <= MAX_OFFSET);

const ID_MASK: u16 = 0x00FF;
const OFFSET_MASK: u16 = 0x7F00;
const OFFSET_SHIFT: u16 = 8;
const BACKWARD_BIT: u16 = 0x8000;

/// The two states a node can be in. Stored in arena memory as a raw magic
/// value and decoded on every read: anything else means the arena has been
/// overwritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeTag {
    Allocated,
    Free,
}

impl NodeTag {
    const ALLOCATED: u16 = u16::from_be_bytes(*b"UD");
    const FREE: u16 = u16::from_be_bytes(*b"FR");

    #[inline]
    fn magic(self) -> u16 {
        match self {
            NodeTag::Allocated => Self::ALLOCATED,
            NodeTag::Free => Self::FREE,
        }
    }
}

impl TryFrom<u16> for NodeTag {
    type Error = u16;

    #[inline]
    fn try_from(magic: u16) -> Result<Self, Self::Error> {
        match magic {
            Self::ALLOCATED => Ok(NodeTag::Allocated),
            Self::FREE => Ok(NodeTag::Free),
            other => Err(other),
        }
    }
}

/// Node record of the expanding allocator. A complete record is
/// [`Header<Block>`], which adds the links of whichever list (free or
/// allocated) currently owns the node:
///
/// ```text
/// +----------------------------+          <----------------------+
/// | pointer to next node       |   <------+                      |
/// +----------------------------+          | Pointer<Node<Block>> |
/// | pointer to prev node       |   <------+                      |
/// +----------------------------+                                 |
/// | magic (UD or FR)           |   <------+                      | <Node<Block>>
/// +----------------------------+          |                      |
/// | id | offset | direction    |          | Block                |
/// +----------------------------+          |                      |
/// | payload size               |   <------+                      |
/// +----------------------------+          <----------------------+
/// |       Block content        |   <------+
/// |            ...             |          | Payload, `size` bytes
/// |            ...             |   <------+
/// +----------------------------+
/// ```
///
/// The node covers `offset` bytes in front of its header (alignment gap that
/// was too small to stay free, see [`crate::alignment`]), the header itself
/// and `size` payload bytes. Nodes tile their arena: the end of one node is
/// the start of the next.
pub(crate) struct Block {
    /// Raw [`NodeTag`], validated on every read.
    magic: u16,
    /// `0x00FF` node id, `0x7F00` relative offset, `0x8000` direction.
    flags: u16,
    /// Payload size excluding [`BLOCK_HEADER_SIZE`].
    size: usize,
}

impl Block {
    pub fn new(tag: NodeTag, id: u8, offset: usize, direction: Direction, size: usize) -> Self {
        debug_assert!(offset <= MAX_OFFSET);

        let mut flags = u16::from(id) | ((offset as u16) << OFFSET_SHIFT) & OFFSET_MASK;
        if direction == Direction::Backward {
            flags |= BACKWARD_BIT;
        }

        Self {
            magic: tag.magic(),
            flags,
            size,
        }
    }

    /// A free node, no id, no offset.
    pub fn free(size: usize) -> Self {
        Self::new(NodeTag::Free, 0, 0, Direction::Forward, size)
    }
}

impl Header<Block> {
    /// Decoded tag, `None` if the magic is not one of ours.
    #[inline]
    pub fn tag(&self) -> Option<NodeTag> {
        NodeTag::try_from(self.data.magic).ok()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.tag() == Some(NodeTag::Free)
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.tag() == Some(NodeTag::Allocated)
    }

    #[inline]
    pub fn set_tag(&mut self, tag: NodeTag) {
        self.data.magic = tag.magic();
    }

    /// Wipes the magic of a record that has been merged away, so that a
    /// stale pointer to it can never validate again.
    #[inline]
    pub fn invalidate(&mut self) {
        self.data.magic = 0;
    }

    #[inline]
    pub fn id(&self) -> u8 {
        (self.data.flags & ID_MASK) as u8
    }

    /// Bytes in front of the header that belong to this node.
    #[inline]
    pub fn offset(&self) -> usize {
        usize::from((self.data.flags & OFFSET_MASK) >> OFFSET_SHIFT)
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        if self.data.flags & BACKWARD_BIT != 0 {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// Payload size excluding [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn size(&self) -> usize {
        self.data.size
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        self.data.size = size;
    }

    /// Total node size: offset gap, header and payload.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.offset() + BLOCK_HEADER_SIZE + self.data.size
    }

    /// First byte that belongs to the node (including the offset gap).
    #[inline]
    pub fn start_of(node: NonNull<Self>) -> usize {
        Self::address_of(node) - unsafe { node.as_ref().offset() }
    }

    /// One past the last payload byte.
    #[inline]
    pub fn end_of(node: NonNull<Self>) -> usize {
        Self::address_of(node) + BLOCK_HEADER_SIZE + unsafe { node.as_ref().size() }
    }
}

/// Public snapshot of one node, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address of the payload (what the allocator handed out).
    pub address: NonNull<u8>,
    /// Payload size in bytes.
    pub size: usize,
    /// Node id assigned at allocation time.
    pub id: u8,
    /// Direction used when the node was allocated.
    pub direction: Direction,
}

impl NodeInfo {
    pub(crate) unsafe fn of(node: NonNull<Header<Block>>) -> Self {
        let block = node.as_ref();
        Self {
            address: Header::content_address_of(node),
            size: block.size(),
            id: block.id(),
            direction: block.direction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let mut memory = [0usize; 8];
        let address = NonNull::from(&mut memory).cast::<u8>();

        unsafe {
            let node = crate::list::LinkedList::write(
                Block::new(NodeTag::Allocated, 0xAB, 0x28, Direction::Backward, 96),
                address,
            );
            let block = node.as_ref();

            assert_eq!(block.tag(), Some(NodeTag::Allocated));
            assert_eq!(block.id(), 0xAB);
            assert_eq!(block.offset(), 0x28);
            assert_eq!(block.direction(), Direction::Backward);
            assert_eq!(block.size(), 96);
            assert_eq!(block.total_size(), 0x28 + BLOCK_HEADER_SIZE + 96);
        }
    }

    #[test]
    fn unknown_magic_has_no_tag() {
        assert_eq!(NodeTag::try_from(0), Err(0));
        assert_eq!(NodeTag::try_from(0x1234), Err(0x1234));
        assert_eq!(
            NodeTag::try_from(NodeTag::Free.magic()),
            Ok(NodeTag::Free)
        );
    }

    #[test]
    fn header_is_word_aligned() {
        assert_eq!(BLOCK_HEADER_SIZE % POINTER_SIZE, 0);
    }
}
