//! Bit scanning primitives backing the size-class index and the occupancy
//! bitmaps.

/// Index of the most significant set bit of `n`, or `None` if `n` is zero.
#[inline]
pub fn find_msb(n: usize) -> Option<u32> {
    if n == 0 {
        return None;
    }
    Some(usize::BITS - 1 - n.leading_zeros())
}

/// Index of the least significant set bit of `n`, or `None` if `n` is zero.
///
/// `n & -n` isolates the lowest set bit, which is then located with
/// [`find_msb`].
#[inline]
pub fn find_lsb(n: usize) -> Option<u32> {
    find_msb(n & n.wrapping_neg())
}
