//! The chain of pools backing an allocator.
//!
//! Every pool is one region from the provider, laid out as:
//!
//! ```text
//!   ┌───────────┬──────────────────────────────────┬──────────┐
//!   │ prev pool │ first block (capacity bytes)     │ sentinel │
//!   └───────────┴──────────────────────────────────┴──────────┘
//! ```
//!
//! The first block starts out covering the whole pool and is later split and
//! merged in place. The sentinel is a block header of size zero that is never
//! free, so walking forward from any block stops at the end of its pool and
//! coalescing never crosses into another pool.

use core::mem::align_of;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::block::{Block, HEADER_SIZE};
use crate::error::PoolError;
use crate::provider::PoolProvider;
use crate::size_class::WORD;

#[repr(C)]
struct PoolHeader {
    prev: Option<Pool>,
}

/// Bytes before the first block of a pool.
pub(crate) const POOL_HEADER_SIZE: usize = core::mem::size_of::<PoolHeader>();

/// Bytes of a pool not available as payload: the pool header, the first
/// block's header, and the sentinel.
pub(crate) const POOL_OVERHEAD: usize = POOL_HEADER_SIZE + HEADER_SIZE + HEADER_SIZE;

const_assert!(POOL_HEADER_SIZE % WORD == 0);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Pool {
    header: NonNull<PoolHeader>,
}

impl Pool {
    /// Lay out a fresh pool at `base` with a single, not yet registered block
    /// of `capacity` bytes.
    ///
    /// # Safety
    ///
    /// `base` must be word-aligned and point to `capacity + POOL_OVERHEAD`
    /// bytes owned by the allocator.
    unsafe fn format(base: NonNull<u8>, prev: Option<Pool>, capacity: usize) -> (Pool, Block) {
        let header: NonNull<PoolHeader> = base.cast();
        header.as_ptr().write(PoolHeader { prev });

        let pool = Pool { header };
        let block = Block::format(pool.first_block_ptr(), capacity);
        Block::format(block.end(), 0);

        (pool, block)
    }

    pub fn base(self) -> NonNull<u8> {
        self.header.cast()
    }

    /// The pool created before this one.
    pub fn prev(self) -> Option<Pool> {
        unsafe { self.header.as_ref().prev }
    }

    fn first_block_ptr(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base().as_ptr().add(POOL_HEADER_SIZE)) }
    }

    /// The physically first block of the pool.
    pub fn first_block(self) -> Block {
        unsafe { Block::at(self.first_block_ptr()) }
    }

    /// Iterate over the pool's blocks in address order, sentinel excluded.
    pub fn blocks(self) -> PoolBlocks {
        PoolBlocks {
            next: Some(self.first_block()),
        }
    }
}

pub(crate) struct PoolBlocks {
    next: Option<Block>,
}

impl Iterator for PoolBlocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next.take()?;
        if block.is_sentinel() {
            return None;
        }
        self.next = Some(block.next_phys());
        Some(block)
    }
}

/// A singly linked list of pools, newest first.
pub(crate) struct PoolChain {
    tail: Option<Pool>,
    len: usize,
}

impl PoolChain {
    pub const fn new() -> Self {
        PoolChain { tail: None, len: 0 }
    }

    /// Number of pools in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    pub fn iter(&self) -> PoolIter {
        PoolIter { next: self.tail }
    }

    /// Obtain a `pool_size` byte region from `provider` and link it into the
    /// chain. Returns the pool's single block, which the caller must register
    /// as free.
    ///
    /// # Safety
    ///
    /// `pool_size` must be word-granular and larger than `POOL_OVERHEAD`.
    pub unsafe fn push<P: PoolProvider>(
        &mut self,
        provider: &mut P,
        pool_size: usize,
    ) -> Result<Block, PoolError> {
        debug_assert!(pool_size > POOL_OVERHEAD);
        let base = provider
            .acquire(pool_size, align_of::<usize>())
            .map_err(|err| {
                log::warn!("Provider failed to supply a {} byte pool: {:?}", pool_size, err);
                PoolError::OutOfMemory {
                    requested: pool_size,
                }
            })?;

        let (pool, block) = Pool::format(base, self.tail, pool_size - POOL_OVERHEAD);
        self.tail = Some(pool);
        self.len += 1;

        Ok(block)
    }

    /// Hand every pool back to `provider`, newest first.
    ///
    /// # Safety
    ///
    /// Every pool must have been pushed with this `pool_size` and `provider`,
    /// and no block inside them may be used afterwards.
    pub unsafe fn release_all<P: PoolProvider>(&mut self, provider: &mut P, pool_size: usize) {
        let mut next = self.tail.take();
        while let Some(pool) = next {
            next = pool.prev();
            provider.release(pool.base(), pool_size, align_of::<usize>());
        }
        self.len = 0;
    }
}

pub(crate) struct PoolIter {
    next: Option<Pool>,
}

impl Iterator for PoolIter {
    type Item = Pool;

    fn next(&mut self) -> Option<Pool> {
        let pool = self.next.take()?;
        self.next = pool.prev();
        Some(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::provider::ToyHeap;
    use test_env_log::test;

    #[test]
    fn test_chain() {
        let mut buffer = [0u8; 4096];
        let mut heap = ToyHeap::new(&mut buffer);
        let mut chain = PoolChain::new();
        assert!(chain.is_empty());

        let pool_size = 256;
        unsafe {
            let first = chain.push(&mut heap, pool_size).unwrap();
            let second = chain.push(&mut heap, pool_size).unwrap();
            assert_eq!(chain.len(), 2);
            assert_eq!(first.size(), pool_size - POOL_OVERHEAD);
            assert_eq!(second.size(), pool_size - POOL_OVERHEAD);

            // The last block of each pool is followed by the sentinel.
            assert!(first.next_phys().is_sentinel());
            assert!(!first.next_phys().is_free());

            let pools: Vec<Pool> = chain.iter().collect();
            assert_eq!(pools.len(), 2);
            assert_eq!(pools[0].prev(), Some(pools[1]));
            assert_eq!(pools[1].prev(), None);
            assert_eq!(pools[0].first_block(), second);
            assert_eq!(pools[1].first_block(), first);

            let blocks: Vec<Block> = pools[1].blocks().collect();
            assert_eq!(blocks, [first]);

            chain.release_all(&mut heap, pool_size);
        }
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
        assert_eq!(heap.live, 0);
    }

    #[test]
    fn test_provider_failure() {
        let mut buffer = [0u8; 300];
        let mut heap = ToyHeap::new(&mut buffer);
        let mut chain = PoolChain::new();

        unsafe {
            assert!(chain.push(&mut heap, 256).is_ok());
            assert_eq!(
                chain.push(&mut heap, 256),
                Err(PoolError::OutOfMemory { requested: 256 })
            );
            assert_eq!(chain.len(), 1);
            chain.release_all(&mut heap, 256);
        }
    }
}
