//! Consistency and usage reports for a pool.

/// Validity contains a representation of all invalid states found while
/// walking a pool's blocks and bins.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of free blocks directly followed by another free block.
    ///
    /// Coalescing on free should make this impossible.
    pub adjacent_free: usize,

    /// Number of blocks whose `PREV_FREE` flag or neighbor link disagrees with
    /// the block physically before them, or whose bin links are not mutual.
    pub bad_links: usize,

    /// Number of occupancy bits that disagree with the bins or second-level
    /// words they summarize.
    pub bitmap_mismatches: usize,

    /// Number of binned blocks that are not free, sit in the wrong bin, or
    /// break the ascending size order of their bin.
    pub misplaced: usize,

    /// Difference between the number of free blocks found in the pools and the
    /// number found in the bins.
    ///
    /// This likely indicates corruption.
    pub lost_blocks: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.adjacent_free == 0
            && self.bad_links == 0
            && self.bitmap_mismatches == 0
            && self.misplaced == 0
            && self.lost_blocks == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Usage figures, in blocks and payload bytes.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub pools: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
}
