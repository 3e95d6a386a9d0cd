//! In-band block headers.
//!
//! Every block in a pool starts with a [`BlockHeader`]: a link to the
//! preceding physical block and a size word whose two low bits carry status
//! flags. The payload follows the header directly. While a block is free its
//! payload holds the [`FreeLinks`] of its bin; while it is allocated the same
//! bytes belong to the user. The two never coexist, so the links are written
//! straight into the user's memory, as in the classic TLSF layout.
//!
//! ```text
//!   ┌──────────┬──────────────┬───────────────────────────────┐
//!   │ neighbor │ size | flags │ prev, next (free) / user data │
//!   └──────────┴──────────────┴───────────────────────────────┘
//!   ^ Block                   ^ Block::data()
//! ```

use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::size_class::WORD;

/// "This block is free."
const FREE: usize = 0b01;
/// "The block physically before this one is free."
const PREV_FREE: usize = 0b10;
const FLAGS: usize = FREE | PREV_FREE;

/// Header at the start of every block.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// The preceding physical block. Only meaningful while `PREV_FREE` is set.
    neighbor: Option<Block>,
    /// Payload size in bytes, or-ed with the status flags.
    size: usize,
}

/// Bin links, stored in the payload of a free block.
#[repr(C)]
struct FreeLinks {
    prev: Option<Block>,
    next: Option<Block>,
}

/// Bytes between the start of a block and its payload.
pub(crate) const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Smallest payload a block may have: enough to hold its bin links.
pub(crate) const MIN_BLOCK_SIZE: usize = core::mem::size_of::<FreeLinks>();

const_assert!(HEADER_SIZE % WORD == 0);
const_assert!(MIN_BLOCK_SIZE % WORD == 0);
const_assert!(FLAGS < WORD);
const_assert!(core::mem::size_of::<Option<Block>>() == WORD);

/// A handle to a block header inside a pool.
///
/// Invariant: `header` points to a formatted header inside a pool owned by
/// the allocator, and the payload behind it is at least `size()` bytes long,
/// followed by the next block's header (or the pool's sentinel).
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Block {
    header: NonNull<BlockHeader>,
}

impl Block {
    /// Write a fresh header at `at` for a payload of `size` bytes. Both flags
    /// start cleared and there is no recorded neighbor.
    ///
    /// # Safety
    ///
    /// `at` must be word-aligned and point to `HEADER_SIZE + size` bytes owned
    /// by the allocator and not in use by anything else.
    pub unsafe fn format(at: NonNull<u8>, size: usize) -> Block {
        debug_assert_eq!(size & FLAGS, 0);
        let header: NonNull<BlockHeader> = at.cast();
        header.as_ptr().write(BlockHeader {
            neighbor: None,
            size,
        });
        Block { header }
    }

    /// A handle to the header already formatted at `at`.
    ///
    /// # Safety
    ///
    /// `at` must point to a header written by [`Block::format`].
    pub unsafe fn at(at: NonNull<u8>) -> Block {
        Block { header: at.cast() }
    }

    /// Recover the block that owns the payload at `data`.
    ///
    /// This is the only way back from a user pointer to allocator metadata.
    ///
    /// # Safety
    ///
    /// `data` must have been returned by [`Block::data`] for a block that is
    /// still allocated.
    pub unsafe fn from_data(data: NonNull<u8>) -> Block {
        let header = data.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The start of this block's payload.
    pub fn data(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// The first byte past this block's payload, where the next header lives.
    pub fn end(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.data().as_ptr().add(self.size())) }
    }

    /// The physically following block. For the last block of a pool this is
    /// the pool's sentinel.
    pub fn next_phys(self) -> Block {
        Block {
            header: self.end().cast(),
        }
    }

    /// The physically preceding block, if it is free.
    pub fn prev_phys(self) -> Option<Block> {
        if self.is_prev_free() {
            self.header_view().neighbor
        } else {
            None
        }
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }

    // Mutable access to the header. Handles are `Copy`, so nothing stops two
    // handles to the same block from existing; the allocator only ever holds
    // one of these views at a time.
    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut BlockHeader {
        unsafe { &mut *self.header.as_ptr() }
    }

    /// Payload size in bytes.
    pub fn size(self) -> usize {
        self.header_view().size & !FLAGS
    }

    /// Set the payload size, keeping the status flags.
    pub fn set_size(self, size: usize) {
        debug_assert_eq!(size & FLAGS, 0);
        let header = self.header_mut();
        header.size = size | (header.size & FLAGS);
    }

    /// Grow this block over `other`, which must directly follow it.
    pub fn absorb(self, other: Block) {
        debug_assert!(self.end() == other.header.cast());
        self.set_size(self.size() + HEADER_SIZE + other.size());
    }

    /// The zero-size block that terminates every pool.
    pub fn is_sentinel(self) -> bool {
        self.size() == 0
    }

    pub fn is_free(self) -> bool {
        self.header_view().size & FREE != 0
    }

    pub fn set_free(self, free: bool) {
        let header = self.header_mut();
        if free {
            header.size |= FREE;
        } else {
            header.size &= !FREE;
        }
    }

    pub fn is_prev_free(self) -> bool {
        self.header_view().size & PREV_FREE != 0
    }

    /// Record whether the preceding physical block is free, and which block
    /// that is.
    pub fn set_prev_free(self, prev: Option<Block>) {
        let header = self.header_mut();
        match prev {
            Some(block) => {
                header.size |= PREV_FREE;
                header.neighbor = Some(block);
            }
            None => header.size &= !PREV_FREE,
        }
    }

    /// The recorded neighbor, regardless of `PREV_FREE`.
    pub fn neighbor(self) -> Option<Block> {
        self.header_view().neighbor
    }

    fn links(self) -> NonNull<FreeLinks> {
        self.data().cast()
    }

    /// The previous block in this block's bin.
    pub fn prev_free(self) -> Option<Block> {
        debug_assert!(self.is_free());
        unsafe { self.links().as_ref().prev }
    }

    /// The next block in this block's bin.
    pub fn next_free(self) -> Option<Block> {
        debug_assert!(self.is_free());
        unsafe { self.links().as_ref().next }
    }

    pub fn set_prev_free_link(self, prev: Option<Block>) {
        unsafe { (*self.links().as_ptr()).prev = prev }
    }

    pub fn set_next_free_link(self, next: Option<Block>) {
        unsafe { (*self.links().as_ptr()).next = next }
    }

    /// Overwrite both bin links at once.
    pub fn set_links(self, prev: Option<Block>, next: Option<Block>) {
        unsafe { self.links().as_ptr().write(FreeLinks { prev, next }) }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block({:?}, {}{}{})",
            self.header,
            self.size(),
            if self.is_free() { ", free" } else { "" },
            if self.is_prev_free() { ", prev free" } else { "" },
        )
    }
}
