//! The two-level size-class mapping.
//!
//! Every block size is a multiple of the pointer size `W`. The first level
//! splits sizes by power of two, and the second level splits each power of
//! two range into `SL_COUNT` equal classes, where `SL_COUNT` is the pointer
//! width in bits.
//!
//! Sizes whose most significant bit is at or below `PACK_THRESHOLD` do not
//! span enough of a range to fill `SL_COUNT` classes, so they are all packed
//! into first level 0 and indexed directly by `size / W`. On a 64-bit target
//! that is every size below 512 bytes, and both level 0 and level 1 have one
//! class per 8 bytes.

use static_assertions::const_assert;

use crate::bitscan::find_msb;

/// Granularity of every block size, in bytes.
pub const WORD: usize = core::mem::size_of::<usize>();

/// Number of low bits of a size lost to the `WORD` granularity.
pub(crate) const ALIGN_SHIFT: u32 = WORD.trailing_zeros();

/// Number of second-level classes per first level.
pub(crate) const SL_COUNT: usize = usize::BITS as usize;

/// Number of bits of a size, below its MSB, that select a second-level class.
pub(crate) const SL_SHIFT: u32 = SL_COUNT.trailing_zeros();

/// Highest MSB index still packed into first level 0.
pub(crate) const PACK_THRESHOLD: u32 = SL_SHIFT + ALIGN_SHIFT - 1;

const_assert!(WORD.is_power_of_two());
const_assert!(SL_COUNT.is_power_of_two());
const_assert!(PACK_THRESHOLD < usize::BITS);

/// Position of a size in the free-list table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SizeClass {
    /// First-level index.
    pub fl: usize,
    /// Second-level index, below `SL_COUNT`.
    pub sl: usize,
    /// Flat offset into the table, `fl * SL_COUNT + sl`.
    pub bin: usize,
}

impl SizeClass {
    /// Map a size (already rounded to `WORD`) to its class.
    ///
    /// The same size always yields the same class, and larger sizes never
    /// yield a smaller bin.
    pub fn of(size: usize) -> SizeClass {
        debug_assert_eq!(size % WORD, 0, "size {} is not word-granular", size);

        let (fl, sl) = match find_msb(size) {
            Some(msb) if msb > PACK_THRESHOLD => {
                let sl = (size >> (msb - SL_SHIFT)) & (SL_COUNT - 1);
                ((msb - PACK_THRESHOLD) as usize, sl)
            }
            _ => (0, size >> ALIGN_SHIFT),
        };

        SizeClass {
            fl,
            sl,
            bin: fl * SL_COUNT + sl,
        }
    }

    /// Number of first levels needed to index blocks up to `max_size` bytes.
    pub fn levels_for(max_size: usize) -> usize {
        SizeClass::of(max_size).fl + 1
    }
}

/// Round `value` up to the nearest multiple of `increment`, which must be a
/// power of two. Returns `None` on overflow.
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    debug_assert!(increment.is_power_of_two());
    Some(value.checked_add(increment - 1)? & !(increment - 1))
}
