//! Preferred Allocation Sizes
//!
//! Rounds requested byte counts onto a small geometric series so that the
//! backend sees few distinct sizes. Every size maps to either a power of two
//! or one and a half times a power of two, which bounds the overcommit to
//! under 50%.

/// Smallest size handed to a backend
pub const MIN_PREFERRED_SIZE: usize = 8;

/// Round `size` up to its preferred allocation size
///
/// Sizes below [`MIN_PREFERRED_SIZE`] become [`MIN_PREFERRED_SIZE`]. Powers of
/// two are returned unchanged. Anything else is rounded to `1.5 * 2^k` when
/// that is large enough, and to the next power of two otherwise.
#[must_use]
#[inline]
pub const fn preferred_size(size: usize) -> usize {
    if size < MIN_PREFERRED_SIZE {
        return MIN_PREFERRED_SIZE;
    }
    let bits = usize::BITS - 1 - size.leading_zeros();
    let lower = 1_usize << bits;
    if lower == size {
        return size;
    }
    let middle = lower + lower / 2;
    if middle >= size {
        return middle;
    }
    match lower.checked_mul(2) {
        Some(upper) => upper,
        None => usize::MAX,
    }
}
