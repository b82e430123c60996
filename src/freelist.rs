use std::ptr::NonNull;

use crate::{
    block::{Block, NodeTag},
    header::Header,
    list::LinkedList,
    Pointer,
};

/// See [`crate::block::Block`] first. Free nodes are threaded through their
/// own [`Header<Block>`] links, exactly like allocated nodes, but the free
/// list is kept sorted by address. That gives us two things for free:
///
/// 1. Coalescing only has to look at the list neighbours of a node. If a
/// free node is physically adjacent to another free node, they are also
/// adjacent in the list, since nothing free can sit between them.
///
/// 2. Forward and backward fit searches are plain list traversals from the
/// head or the tail.
///
/// ```text
///                +-------------------------------------+
///                |                                     |
/// +--------------|----------------------------------+--|--------------+
/// | +-------+ +--|----+ +-------+ +-------+ +-------+ +|------+       |
/// | | Alloc | | Free  | | Alloc | | Alloc | | Alloc | | Free  |  ...  |
/// | +-------+ +-------+ +-------+ +-------+ +-------+ +-------+       |
/// +-----------------------------------------------------------------+
///                 ^                                       ^
///                 |                                       |
///                 +--- Head                               +--- Tail
/// ```
///
/// Free nodes never carry an offset: whenever a block is released its
/// record is rewritten at the very first byte of the block.
pub(crate) type FreeList = LinkedList<Block>;

impl FreeList {
    /// Last free node whose address is lower than `address`, or `None` if
    /// every free node comes after it. This is the node a new free block at
    /// `address` has to be linked after.
    pub unsafe fn predecessor_of(&self, address: usize) -> Pointer<Header<Block>> {
        self.iter_rev()
            .find(|node| Header::address_of(*node) < address)
    }

    /// Free node that starts exactly at `address`, if any.
    pub unsafe fn block_at(&self, address: usize) -> Pointer<Header<Block>> {
        self.iter()
            .take_while(|node| Header::address_of(*node) <= address)
            .find(|node| Header::address_of(*node) == address)
    }

    /// Tags `block` as free and links it in address order.
    pub unsafe fn insert_block(&mut self, mut block: NonNull<Header<Block>>) {
        block.as_mut().set_tag(NodeTag::Free);
        let after = self.predecessor_of(Header::address_of(block));
        self.insert_after(after, block);
    }

    /// Merges `block` with its free neighbours when they touch it, and
    /// returns the node that now covers `block`. Merged-away records are
    /// invalidated.
    ///
    /// **Before**:
    ///
    /// ```text
    /// +-----------+-----------------+-----------+
    /// |  Free A   | Recently freed B|  Free C   |
    /// +-----------+-----------------+-----------+
    /// ```
    ///
    /// **After**:
    ///
    /// ```text
    /// +-----------------------------------------+
    /// |          Free A, A + B + C + 2H         |
    /// +-----------------------------------------+
    /// ```
    pub unsafe fn coalesce(&mut self, mut block: NonNull<Header<Block>>) -> NonNull<Header<Block>> {
        if let Some(next) = block.as_ref().next {
            if Header::end_of(block) == Header::address_of(next) {
                self.merge_next_block(block);
            }
        }

        if let Some(prev) = block.as_ref().prev {
            if Header::end_of(prev) == Header::address_of(block) {
                block = prev;
                self.merge_next_block(block);
            }
        }

        block
    }

    /// Merges the list successor of `block` into `block`. Both must be free
    /// and physically adjacent.
    ///
    /// ```text
    /// +----------------+---------------+
    /// |    Block A     |   Block B     |
    /// +----------------+---------------+
    ///        ^                 |
    ///        |                 |
    ///        +-----------------+
    ///           Merge B into A
    /// ```
    unsafe fn merge_next_block(&mut self, mut block: NonNull<Header<Block>>) {
        let Some(mut next) = block.as_ref().next else {
            return;
        };

        let size = block.as_ref().size() + next.as_ref().total_size();
        self.remove(next);
        next.as_mut().invalidate();
        block.as_mut().set_size(size);
    }

    /// Sum of the payload of every free node.
    pub unsafe fn total_payload(&self) -> usize {
        self.iter().map(|node| node.as_ref().size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_HEADER_SIZE;

    /// Writes free nodes of the given payload sizes back to back.
    unsafe fn tile(memory: &mut [usize], sizes: &[usize]) -> Vec<NonNull<Header<Block>>> {
        let mut address = memory.as_mut_ptr().cast::<u8>();
        let mut nodes = Vec::new();

        for size in sizes {
            let node = LinkedList::write(Block::free(*size), NonNull::new_unchecked(address));
            nodes.push(node);
            address = address.add(BLOCK_HEADER_SIZE + size);
        }

        nodes
    }

    #[test]
    fn insertion_keeps_address_order() {
        let mut memory = [0usize; 128];
        let mut list = FreeList::new();

        unsafe {
            let nodes = tile(&mut memory, &[64, 64, 64, 64]);
            for index in [2, 0, 3, 1] {
                list.insert_block(nodes[index]);
            }

            let order: Vec<_> = list.iter().collect();
            assert_eq!(order, nodes);
            assert_eq!(list.block_at(Header::address_of(nodes[2])), Some(nodes[2]));
            assert_eq!(list.block_at(Header::address_of(nodes[2]) + 8), None);
        }
    }

    #[test]
    fn coalesce_both_neighbours() {
        let mut memory = [0usize; 128];
        let mut list = FreeList::new();

        unsafe {
            let nodes = tile(&mut memory, &[32, 48, 64]);
            list.insert_block(nodes[0]);
            list.insert_block(nodes[2]);
            list.insert_block(nodes[1]);

            let merged = list.coalesce(nodes[1]);

            assert_eq!(merged, nodes[0]);
            assert_eq!(list.len(), 1);
            assert_eq!(merged.as_ref().size(), 32 + 48 + 64 + 2 * BLOCK_HEADER_SIZE);
            assert_eq!(nodes[1].as_ref().tag(), None);
            assert_eq!(nodes[2].as_ref().tag(), None);
        }
    }

    #[test]
    fn no_coalescing_across_gaps() {
        let mut memory = [0usize; 128];
        let mut list = FreeList::new();

        unsafe {
            let nodes = tile(&mut memory, &[32, 32, 32]);
            list.insert_block(nodes[0]);
            list.insert_block(nodes[2]);

            let same = list.coalesce(nodes[2]);

            assert_eq!(same, nodes[2]);
            assert_eq!(list.len(), 2);
            assert_eq!(list.total_payload(), 64);
        }
    }
}
