use std::ptr::NonNull;

use crate::list::Node;

/// Every record this crate writes into an arena is a linked list node: node
/// records of the expanding allocator live in the free or the allocated list,
/// heap records live in their parent's nested heap index. This alias is used
/// whenever we care about the record rather than the list it sits in.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns a pointer to a [`Header<T>`] given an address that points right
    /// after a valid [`Header<T>`].
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Returned address points here.
    /// +-------------+
    /// |   Content   | <- Given address should point here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// Only computes an address, nothing is read. Callers must still check
    /// that the result lies inside their arena and validate the tag stored
    /// there before trusting any other field, see
    /// [`crate::block::NodeTag`].
    #[inline]
    pub unsafe fn from_content_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the address after the header.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Header<T> struct.
    /// +-------------+
    /// |   Content   | <- Returned address points to the first cell after header.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// If `header` is valid the result points right after it, and is safe to
    /// use as long as no more than the record's `size` bytes are written.
    ///
    /// # Notes
    ///
    /// Called as `Header::content_address_of(header)` rather than through
    /// `&self` to avoid intermediate references to the header, which Miri
    /// dislikes once the content is handed out to users.
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Address of the header itself as an integer. Node order in the arena
    /// is decided by comparing these.
    #[inline]
    pub fn address_of(header: NonNull<Self>) -> usize {
        header.as_ptr() as usize
    }
}
