//! The segregated free-list table.
//!
//! The table is one flat array of bin heads, `fl_count * SL_COUNT` long, plus
//! one second-level bitmap word per first level and a single first-level
//! bitmap. Both arrays live in memory obtained from the pool provider at
//! `init`, right after each other:
//!
//! ```text
//!   [ bins: Option<Block>; fl_count * SL_COUNT ][ sl_maps: usize; fl_count ]
//! ```
//!
//! The following invariant holds between operations:
//!
//!  - `fl_map` bit `f` is set iff `sl_maps[f] != 0`
//!  - `sl_maps[f]` bit `s` is set iff bin `f * SL_COUNT + s` is non-empty

use core::ptr::NonNull;

use crate::bitscan::find_lsb;
use crate::block::Block;
use crate::size_class::{SizeClass, SL_COUNT, WORD};
use crate::stats::Validity;

/// Mask of the bits strictly above `index`.
#[inline]
fn bits_above(index: usize) -> usize {
    usize::MAX.checked_shl(index as u32 + 1).unwrap_or(0)
}

pub(crate) struct FreeLists {
    /// Bit `f` says first level `f` has at least one non-empty bin.
    fl_map: usize,
    bins: NonNull<Option<Block>>,
    sl_maps: NonNull<usize>,
    fl_count: usize,
}

impl FreeLists {
    /// A table with no levels and no storage, for an uninitialized allocator.
    pub const fn empty() -> Self {
        FreeLists {
            fl_map: 0,
            bins: NonNull::dangling(),
            sl_maps: NonNull::dangling(),
            fl_count: 0,
        }
    }

    /// Bytes of storage needed for a table with `fl_count` first levels.
    pub fn table_bytes(fl_count: usize) -> usize {
        (fl_count * SL_COUNT + fl_count) * WORD
    }

    /// Lay out an empty table in `storage`.
    ///
    /// # Safety
    ///
    /// `storage` must be word-aligned, at least `table_bytes(fl_count)` long,
    /// and owned by the allocator until it is handed back with
    /// [`storage`](FreeLists::storage).
    pub unsafe fn format(storage: NonNull<u8>, fl_count: usize) -> Self {
        let bins: NonNull<Option<Block>> = storage.cast();
        for i in 0..fl_count * SL_COUNT {
            bins.as_ptr().add(i).write(None);
        }
        let sl_maps: NonNull<usize> =
            NonNull::new_unchecked(bins.as_ptr().add(fl_count * SL_COUNT)).cast();
        for i in 0..fl_count {
            sl_maps.as_ptr().add(i).write(0);
        }

        FreeLists {
            fl_map: 0,
            bins,
            sl_maps,
            fl_count,
        }
    }

    /// The memory the table lives in, and its size.
    pub fn storage(&self) -> (NonNull<u8>, usize) {
        (self.bins.cast(), FreeLists::table_bytes(self.fl_count))
    }

    pub fn fl_count(&self) -> usize {
        self.fl_count
    }

    fn bins(&self) -> &[Option<Block>] {
        unsafe { core::slice::from_raw_parts(self.bins.as_ptr(), self.fl_count * SL_COUNT) }
    }

    fn bins_mut(&mut self) -> &mut [Option<Block>] {
        unsafe { core::slice::from_raw_parts_mut(self.bins.as_ptr(), self.fl_count * SL_COUNT) }
    }

    fn sl_maps(&self) -> &[usize] {
        unsafe { core::slice::from_raw_parts(self.sl_maps.as_ptr(), self.fl_count) }
    }

    fn sl_maps_mut(&mut self) -> &mut [usize] {
        unsafe { core::slice::from_raw_parts_mut(self.sl_maps.as_ptr(), self.fl_count) }
    }

    fn class_of(&self, size: usize) -> SizeClass {
        let class = SizeClass::of(size);
        debug_assert!(
            class.fl < self.fl_count,
            "size {} is beyond the table's {} levels",
            size,
            self.fl_count
        );
        class
    }

    /// Insert a free block into its bin, keeping the bin sorted by size.
    ///
    /// Marks the block free and tells its physical successor about it.
    pub fn insert(&mut self, block: Block) {
        let size = block.size();
        let class = self.class_of(size);

        block.set_free(true);
        block.next_phys().set_prev_free(Some(block));

        let head = self.bins()[class.bin];
        match head {
            None => {
                block.set_links(None, None);
                self.bins_mut()[class.bin] = Some(block);
            }
            Some(head) if head.size() > size => {
                block.set_links(None, Some(head));
                head.set_prev_free_link(Some(block));
                self.bins_mut()[class.bin] = Some(block);
            }
            Some(head) => {
                // Walk to the last entry no larger than `block`, and splice
                // `block` in after it.
                let mut cursor = head;
                while let Some(next) = cursor.next_free() {
                    if next.size() > size {
                        break;
                    }
                    cursor = next;
                }
                let next = cursor.next_free();
                block.set_links(Some(cursor), next);
                cursor.set_next_free_link(Some(block));
                if let Some(next) = next {
                    next.set_prev_free_link(Some(block));
                }
            }
        }

        self.sl_maps_mut()[class.fl] |= 1 << class.sl;
        self.fl_map |= 1 << class.fl;
    }

    /// Remove a free block from its bin.
    ///
    /// Clears the block's free flag and its physical successor's `PREV_FREE`.
    pub fn remove(&mut self, block: Block) {
        let class = self.class_of(block.size());
        let prev = block.prev_free();
        let next = block.next_free();

        match prev {
            Some(prev) => prev.set_next_free_link(next),
            None => {
                debug_assert_eq!(self.bins()[class.bin], Some(block));
                self.bins_mut()[class.bin] = next;
            }
        }
        if let Some(next) = next {
            next.set_prev_free_link(prev);
        }

        if self.bins()[class.bin].is_none() {
            let sl_maps = self.sl_maps_mut();
            sl_maps[class.fl] &= !(1 << class.sl);
            if sl_maps[class.fl] == 0 {
                self.fl_map &= !(1 << class.fl);
            }
        }

        block.set_free(false);
        block.next_phys().set_prev_free(None);
    }

    /// Find a free block of at least `size` bytes, without removing it.
    ///
    /// The exact bin is scanned from its head, which yields the smallest
    /// adequate block there. Failing that, the bitmaps give the first
    /// non-empty bin of a larger class in two scans, and any block in it is
    /// large enough.
    pub fn find(&self, size: usize) -> Option<Block> {
        let class = self.class_of(size);

        let mut cursor = self.bins()[class.bin];
        while let Some(block) = cursor {
            if block.size() >= size {
                return Some(block);
            }
            cursor = block.next_free();
        }

        let sl_map = self.sl_maps()[class.fl] & bits_above(class.sl);
        if let Some(sl) = find_lsb(sl_map) {
            return self.bins()[class.fl * SL_COUNT + sl as usize];
        }

        let fl = find_lsb(self.fl_map & bits_above(class.fl))? as usize;
        let sl = find_lsb(self.sl_maps()[fl])? as usize;
        self.bins()[fl * SL_COUNT + sl]
    }

    /// Check the bitmap invariant and every bin's contents, recording problems
    /// in `validity`. Returns the number of binned blocks.
    pub fn audit(&self, validity: &mut Validity) -> usize {
        let mut count = 0;

        for fl in 0..self.fl_count {
            let sl_map = self.sl_maps()[fl];
            if (self.fl_map & (1 << fl) != 0) != (sl_map != 0) {
                validity.bitmap_mismatches += 1;
            }

            for sl in 0..SL_COUNT {
                let bin = fl * SL_COUNT + sl;
                let head = self.bins()[bin];
                if (sl_map & (1 << sl) != 0) != head.is_some() {
                    validity.bitmap_mismatches += 1;
                }

                let mut previous: Option<Block> = None;
                let mut cursor = head;
                while let Some(block) = cursor {
                    count += 1;
                    if !block.is_free() {
                        validity.misplaced += 1;
                        break;
                    }
                    if SizeClass::of(block.size()).bin != bin {
                        validity.misplaced += 1;
                    }
                    if block.prev_free() != previous {
                        validity.bad_links += 1;
                    }
                    if let Some(previous) = previous {
                        if previous.size() > block.size() {
                            validity.misplaced += 1;
                        }
                    }
                    previous = Some(block);
                    cursor = block.next_free();
                }
            }
        }

        if self.fl_map & !bits_below(self.fl_count) != 0 {
            validity.bitmap_mismatches += 1;
        }

        count
    }
}

/// Mask of the bits strictly below `index`.
fn bits_below(index: usize) -> usize {
    1usize.checked_shl(index as u32).map_or(usize::MAX, |bit| bit - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::block::MIN_BLOCK_SIZE;
    use test_env_log::test;

    const FL_COUNT: usize = 3;

    #[repr(C, align(16))]
    struct Buffer([u8; 16 * 1024]);

    #[repr(C, align(16))]
    struct Table([u8; (FL_COUNT * SL_COUNT + FL_COUNT) * WORD]);

    /// Format back-to-back blocks of the given sizes, followed by a sentinel.
    fn carve(buffer: &mut Buffer, sizes: &[usize]) -> Vec<Block> {
        let mut at = NonNull::new(buffer.0.as_mut_ptr()).unwrap();
        let mut blocks = Vec::new();
        for &size in sizes {
            let block = unsafe { Block::format(at, size) };
            at = block.end();
            blocks.push(block);
        }
        unsafe { Block::format(at, 0) };
        blocks
    }

    fn table(storage: &mut Table) -> FreeLists {
        unsafe { FreeLists::format(NonNull::new(storage.0.as_mut_ptr()).unwrap(), FL_COUNT) }
    }

    fn assert_valid(lists: &FreeLists, expected: usize) {
        let mut validity = Validity::default();
        let count = lists.audit(&mut validity);
        assert!(validity.is_valid(), "{:?}", validity);
        assert_eq!(count, expected);
    }

    #[test]
    fn test_insert_sets_flags_and_bitmaps() {
        let mut buffer = Buffer([0; 16 * 1024]);
        let mut storage = Table([0; (FL_COUNT * SL_COUNT + FL_COUNT) * WORD]);
        let mut lists = table(&mut storage);
        let blocks = carve(&mut buffer, &[MIN_BLOCK_SIZE, 64, 600]);

        lists.insert(blocks[1]);
        assert!(blocks[1].is_free());
        assert_eq!(blocks[2].prev_phys(), Some(blocks[1]));
        let class = SizeClass::of(64);
        assert_ne!(lists.fl_map & (1 << class.fl), 0);
        assert_ne!(lists.sl_maps()[class.fl] & (1 << class.sl), 0);
        assert_valid(&lists, 1);

        lists.remove(blocks[1]);
        assert!(!blocks[1].is_free());
        assert!(!blocks[2].is_prev_free());
        assert_eq!(lists.fl_map, 0);
        assert!(lists.sl_maps().iter().all(|&m| m == 0));
        assert_valid(&lists, 0);
    }

    #[test]
    fn test_bins_stay_sorted() {
        if WORD != 8 {
            return;
        }
        let mut buffer = Buffer([0; 16 * 1024]);
        let mut storage = Table([0; (FL_COUNT * SL_COUNT + FL_COUNT) * WORD]);
        let mut lists = table(&mut storage);
        // Level 2 classes are 16 bytes wide on 64-bit targets, so these three
        // sizes share a bin. Used spacers keep them from being adjacent.
        let blocks = carve(&mut buffer, &[1032, 16, 1024, 16, 1032, 16, 1024]);
        let bin = SizeClass::of(1024).bin;
        assert_eq!(SizeClass::of(1032).bin, bin);

        lists.insert(blocks[0]);
        lists.insert(blocks[2]);
        lists.insert(blocks[4]);
        lists.insert(blocks[6]);
        assert_valid(&lists, 4);

        let mut sizes = Vec::new();
        let mut cursor = lists.bins()[bin];
        while let Some(block) = cursor {
            sizes.push(block.size());
            cursor = block.next_free();
        }
        assert_eq!(sizes, [1024, 1024, 1032, 1032]);

        // Equal sizes keep insertion order: the first 1032 is found first.
        assert_eq!(lists.find(1032), Some(blocks[0]));

        // Removing from the middle keeps the list linked.
        lists.remove(blocks[2]);
        lists.remove(blocks[0]);
        assert_valid(&lists, 2);
        assert_eq!(lists.find(1032), Some(blocks[4]));
        assert_eq!(lists.find(1024), Some(blocks[6]));
    }

    #[test]
    fn test_find_escalates() {
        let mut buffer = Buffer([0; 16 * 1024]);
        let mut storage = Table([0; (FL_COUNT * SL_COUNT + FL_COUNT) * WORD]);
        let mut lists = table(&mut storage);
        let blocks = carve(&mut buffer, &[96, 16, 800, 16, 48]);

        assert_eq!(lists.find(16), None);

        lists.insert(blocks[0]);
        lists.insert(blocks[2]);
        assert_valid(&lists, 2);

        // Same first level, larger second level.
        assert_eq!(lists.find(64), Some(blocks[0]));
        assert_eq!(lists.find(96), Some(blocks[0]));
        // Next first level.
        assert_eq!(lists.find(104), Some(blocks[2]));
        assert_eq!(lists.find(800), Some(blocks[2]));
        // Nothing large enough.
        assert_eq!(lists.find(808), None);

        // An empty exact bin escalates past smaller blocks.
        lists.insert(blocks[4]);
        assert_eq!(lists.find(48), Some(blocks[4]));
        assert_eq!(lists.find(56), Some(blocks[0]));
        assert_valid(&lists, 3);
    }

    #[test]
    fn test_audit_catches_a_stale_bitmap() {
        let mut buffer = Buffer([0; 16 * 1024]);
        let mut storage = Table([0; (FL_COUNT * SL_COUNT + FL_COUNT) * WORD]);
        let mut lists = table(&mut storage);
        let blocks = carve(&mut buffer, &[64]);
        lists.insert(blocks[0]);

        lists.fl_map = 0;
        let mut validity = Validity::default();
        lists.audit(&mut validity);
        assert_eq!(validity.bitmap_mismatches, 1);
        assert!(!validity.is_valid());
    }
}
