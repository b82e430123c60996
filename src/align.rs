use crate::alignment::POINTER_SIZE;

/// Rounds `value` up to the next multiple of `align`, which must be a power
/// of two. Returns `None` on overflow, which callers treat as "doesn't fit".
///
/// # Examples
///
/// ```rust
/// use nestalloc::align::align_up;
///
/// assert_eq!(align_up(13, 8), Some(16));
/// assert_eq!(align_up(16, 8), Some(16));
/// assert_eq!(align_up(usize::MAX, 8), None);
/// ```
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value
        .checked_add(align - 1)
        .map(|value| value & !(align - 1))
}

/// Rounds `value` down to a multiple of `align`, which must be a power of
/// two.
///
/// ```rust
/// use nestalloc::align::align_down;
///
/// assert_eq!(align_down(13, 8), 8);
/// assert_eq!(align_down(16, 8), 16);
/// ```
#[inline]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Returns the machine word alignment for the given size. Every block size
/// handled by the allocators goes through this so that the header written
/// right after a block is always correctly aligned.
///
/// ```rust
/// use std::mem;
/// use nestalloc::align::align;
///
/// match mem::size_of::<usize>() {
///     8 => assert_eq!(align(13), Some(16)), // 64 bit machine.
///     4 => assert_eq!(align(11), Some(12)), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[inline]
pub fn align(to_be_aligned: usize) -> Option<usize> {
    align_up(to_be_aligned, POINTER_SIZE)
}
