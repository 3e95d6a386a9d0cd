//! The allocator itself.
//!
//! ## [`TlsfPool`](struct.TlsfPool.html)
//!
//! A `TlsfPool` is a single-threaded, non-thread-safe allocator over a chain of
//! pools obtained from a [`PoolProvider`]. Allocation and deallocation run in
//! bounded time: the free-list table finds a large enough block with a couple
//! of bit scans, and freeing merges with both physical neighbors through the
//! boundary tags in the block headers.
//!
//! The allocator has an explicit lifecycle: it is constructed uninitialized,
//! [`init`](struct.TlsfPool.html#method.init) obtains the index tables and the
//! first pool, and [`shut_down`](struct.TlsfPool.html#method.shut_down) hands
//! everything back to the provider.

use core::mem::align_of;
use core::ptr::NonNull;

use log::{debug, trace, warn};

use crate::block::{Block, HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::error::PoolError;
use crate::free_list::FreeLists;
use crate::pool::{PoolChain, POOL_OVERHEAD};
use crate::provider::PoolProvider;
use crate::size_class::{round_up, SizeClass, WORD};
use crate::stats::{Stats, Validity};

/// Pool size used by [`PoolConfig::default`].
pub const DEFAULT_POOL_SIZE: usize = 64 * 1024;

/// Settings applied by [`TlsfPool::init_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Size in bytes of every pool, overhead included. Rounded up to the
    /// pointer size. The largest possible request is this minus the pool
    /// overhead.
    pub pool_size: usize,

    /// Whether to add pools when the existing ones are exhausted. Without it
    /// the allocator never holds more than its first pool.
    pub expand: bool,
}

impl PoolConfig {
    pub const fn new(pool_size: usize, expand: bool) -> Self {
        PoolConfig { pool_size, expand }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::new(DEFAULT_POOL_SIZE, true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
}

/// A two-level segregated fit allocator over pools from `P`.
///
/// Note: pools are only returned to the provider at shutdown.
pub struct TlsfPool<P: PoolProvider> {
    provider: P,
    state: State,
    pool_size: usize,
    max_request: usize,
    expand: bool,
    pools: PoolChain,
    free: FreeLists,
}

// A TlsfPool owns all of its pools and index tables exclusively; the raw
// pointers inside never alias memory owned by anyone else, so it can move to
// another thread together with its provider. It is not Sync.
unsafe impl<P: PoolProvider + Send> Send for TlsfPool<P> {}

impl<P: PoolProvider> TlsfPool<P> {
    /// Create an uninitialized allocator.
    pub const fn new(provider: P) -> Self {
        TlsfPool {
            provider,
            state: State::Uninitialized,
            pool_size: 0,
            max_request: 0,
            expand: false,
            pools: PoolChain::new(),
            free: FreeLists::empty(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Size of each pool, overhead included. Zero while uninitialized.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Largest size `malloc` accepts. Zero while uninitialized.
    pub fn max_request_size(&self) -> usize {
        self.max_request
    }

    /// Number of pools obtained since `init`.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn expands(&self) -> bool {
        self.expand
    }

    /// Size of the block that serves a request of `size` bytes.
    fn block_size(size: usize) -> Option<usize> {
        round_up(size.max(MIN_BLOCK_SIZE), WORD)
    }

    fn ensure_ready(&self) -> Result<(), PoolError> {
        if self.state != State::Ready {
            warn!("Allocator used before init");
            return Err(PoolError::NotInitialized);
        }
        Ok(())
    }

    /// Check the allocator's structures and count its blocks.
    ///
    /// Walks every block of every pool and every bin, so this is linear in the
    /// number of blocks.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        if self.state != State::Ready {
            return (validity, stats);
        }

        for pool in self.pools.iter() {
            stats.pools += 1;
            let mut previous: Option<Block> = None;
            for block in pool.blocks() {
                let prev_free = previous.filter(|p| p.is_free());
                if block.is_prev_free() != prev_free.is_some()
                    || (prev_free.is_some() && block.neighbor() != prev_free)
                {
                    validity.bad_links += 1;
                }
                if block.is_free() {
                    if prev_free.is_some() {
                        validity.adjacent_free += 1;
                    }
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size();
                } else {
                    stats.used_blocks += 1;
                    stats.used_bytes += block.size();
                }
                previous = Some(block);
            }

            // The sentinel must know about a free last block too.
            if let Some(last) = previous {
                let sentinel = last.next_phys();
                if sentinel.is_prev_free() != last.is_free() || sentinel.is_free() {
                    validity.bad_links += 1;
                }
            }
        }

        let binned = self.free.audit(&mut validity);
        if binned != stats.free_blocks {
            validity.lost_blocks += (binned as isize - stats.free_blocks as isize).unsigned_abs();
        }

        (validity, stats)
    }

    /// Initialize with one pool of `pool_size` bytes, adding more pools on
    /// demand only if `expand` is set.
    pub fn init(&mut self, pool_size: usize, expand: bool) -> Result<(), PoolError> {
        self.init_with(PoolConfig { pool_size, expand })
    }

    /// Initialize from a [`PoolConfig`].
    ///
    /// Obtains the index tables and the first pool from the provider.
    pub fn init_with(&mut self, config: PoolConfig) -> Result<(), PoolError> {
        if self.state == State::Ready {
            warn!("Re-initialization of the allocator was attempted");
            return Err(PoolError::AlreadyInitialized);
        }

        let too_small = PoolError::PoolTooSmall {
            requested: config.pool_size,
        };
        let pool_size = round_up(config.pool_size, WORD).ok_or(PoolError::OutOfMemory {
            requested: config.pool_size,
        })?;
        if pool_size < POOL_OVERHEAD + MIN_BLOCK_SIZE {
            warn!("Pool size {} cannot hold a single block", config.pool_size);
            return Err(too_small);
        }
        let max_request = pool_size - POOL_OVERHEAD;

        let fl_count = SizeClass::levels_for(max_request);
        let table_bytes = FreeLists::table_bytes(fl_count);
        let tables = unsafe { self.provider.acquire(table_bytes, align_of::<usize>()) }
            .map_err(|err| {
                warn!("Provider failed to supply {} bytes of tables: {:?}", table_bytes, err);
                PoolError::OutOfMemory {
                    requested: table_bytes,
                }
            })?;

        self.free = unsafe { FreeLists::format(tables, fl_count) };
        self.pool_size = pool_size;
        self.max_request = max_request;
        self.expand = config.expand;
        self.state = State::Ready;

        if let Err(err) = self.add_pool() {
            self.release_all();
            return Err(err);
        }

        debug!(
            "Initialized with {} byte pools ({} byte max request, {} levels, expand: {})",
            pool_size,
            max_request,
            self.free.fl_count(),
            config.expand
        );
        Ok(())
    }

    /// Return every pool and the index tables to the provider.
    ///
    /// Any pointer handed out before becomes dangling.
    pub fn shut_down(&mut self) -> Result<(), PoolError> {
        if self.state != State::Ready {
            warn!("Shutdown of an uninitialized allocator was attempted");
            return Err(PoolError::NotInitialized);
        }
        debug!("Shutting down with {} pools", self.pools.len());
        self.release_all();
        Ok(())
    }

    fn release_all(&mut self) {
        unsafe {
            self.pools.release_all(&mut self.provider, self.pool_size);
            let (tables, table_bytes) = self.free.storage();
            self.provider.release(tables, table_bytes, align_of::<usize>());
        }
        self.free = FreeLists::empty();
        self.pool_size = 0;
        self.max_request = 0;
        self.expand = false;
        self.state = State::Uninitialized;
    }

    /// Add a pool to the chain and register its block as free.
    ///
    /// Fails if the allocator already has a pool and may not expand.
    fn add_pool(&mut self) -> Result<(), PoolError> {
        if !self.expand && !self.pools.is_empty() {
            debug!("Pool is exhausted and may not expand");
            return Err(PoolError::OutOfMemory {
                requested: self.pool_size,
            });
        }
        if self.pool_size == 0 {
            return Err(PoolError::NotInitialized);
        }

        let block = unsafe { self.pools.push(&mut self.provider, self.pool_size)? };
        self.free.insert(block);
        debug!(
            "Added pool #{} at {:?}",
            self.pools.len(),
            block.data()
        );
        Ok(())
    }

    /// Shrink `block` to `size` bytes if the rest can form a block of its own,
    /// and register the rest as free. Otherwise the block keeps its size.
    ///
    /// `block` must not be in the free-list table.
    fn split_block(&mut self, block: Block, size: usize) -> bool {
        let remainder = block.size() - size;
        if remainder < HEADER_SIZE + MIN_BLOCK_SIZE {
            return false;
        }

        block.set_size(size);
        let rest = unsafe { Block::format(block.end(), remainder - HEADER_SIZE) };
        self.free.insert(rest);
        trace!("Split {:?} off {:?}", rest, block);
        true
    }

    /// Allocate `size` bytes, aligned to the pointer size.
    ///
    /// If no free block is large enough and the allocator may expand, one new
    /// pool is added and the search is repeated once.
    pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        self.ensure_ready()?;

        let oversize = PoolError::OversizeRequest {
            requested: size,
            max: self.max_request,
        };
        let needed = Self::block_size(size).ok_or(oversize)?;
        if needed > self.max_request {
            debug!("Request of {} bytes exceeds {}", size, self.max_request);
            return Err(oversize);
        }

        let block = match self.free.find(needed) {
            Some(block) => block,
            None => {
                let out_of_memory = PoolError::OutOfMemory { requested: size };
                self.add_pool().map_err(|_| out_of_memory)?;
                self.free.find(needed).ok_or(out_of_memory)?
            }
        };

        self.free.remove(block);
        self.split_block(block, needed);
        trace!("Allocated {:?} for {} bytes", block, size);

        Ok(block.data())
    }

    /// Allocate `size` bytes and zero them.
    pub fn calloc(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
        let ptr = self.malloc(size)?;
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Allocate with an alignment beyond the pointer size. Not supported;
    /// always fails.
    pub fn align_malloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        debug!("Aligned allocation of {}@{} is not implemented", size, align);
        Err(PoolError::Unimplemented)
    }

    /// Zeroed [`align_malloc`](TlsfPool::align_malloc). Not supported; always
    /// fails.
    pub fn align_calloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, PoolError> {
        self.align_malloc(size, align)
    }

    /// Free memory returned by [`malloc`](TlsfPool::malloc) or
    /// [`calloc`](TlsfPool::calloc), merging it with free neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from this allocator since its
    /// last `init` and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), PoolError> {
        let data = match NonNull::new(ptr) {
            Some(data) => data,
            None => {
                warn!("Attempted to free a null pointer");
                return Err(PoolError::NullFree);
            }
        };
        self.ensure_ready()?;

        let mut block = Block::from_data(data);
        debug_assert!(!block.is_free(), "double free of {:?}", data);
        trace!("Freeing {:?}", block);

        if let Some(prev) = block.prev_phys() {
            self.free.remove(prev);
            prev.absorb(block);
            trace!("  Merged backward into {:?}", prev);
            block = prev;
        }

        let next = block.next_phys();
        if next.is_free() {
            self.free.remove(next);
            block.absorb(next);
            trace!("  Merged forward into {:?}", block);
        }

        self.free.insert(block);
        Ok(())
    }
}

impl<P: PoolProvider> Drop for TlsfPool<P> {
    fn drop(&mut self) {
        if self.state == State::Ready {
            debug!("Dropped while initialized, shutting down");
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::provider::ToyHeap;
    use test_env_log::test;

    fn assert_valid<P: PoolProvider>(allocator: &TlsfPool<P>) -> Stats {
        let (validity, stats) = allocator.stats();
        log::info!("{:?} {:?}", validity, stats);
        assert!(validity.is_valid(), "{:?}", validity);
        stats
    }

    #[test]
    fn test_lifecycle() {
        let mut buffer = [0u8; 8192];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        assert!(!allocator.is_ready());
        assert_eq!(allocator.shut_down(), Err(PoolError::NotInitialized));
        assert_eq!(allocator.malloc(8), Err(PoolError::NotInitialized));

        allocator.init(1023, false).unwrap();
        assert!(allocator.is_ready());
        assert_eq!(allocator.pool_size(), 1024);
        assert_eq!(allocator.max_request_size(), 1024 - POOL_OVERHEAD);
        assert_eq!(allocator.pool_count(), 1);
        assert_eq!(allocator.init(1023, false), Err(PoolError::AlreadyInitialized));

        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, allocator.max_request_size());

        allocator.shut_down().unwrap();
        assert!(!allocator.is_ready());
        assert_eq!(allocator.provider().live, 0);
        assert_eq!(allocator.shut_down(), Err(PoolError::NotInitialized));
    }

    #[test]
    fn test_pool_too_small() {
        let mut buffer = [0u8; 1024];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        assert_eq!(
            allocator.init(POOL_OVERHEAD, true),
            Err(PoolError::PoolTooSmall {
                requested: POOL_OVERHEAD
            })
        );
        assert_eq!(
            allocator.init(usize::MAX, true),
            Err(PoolError::OutOfMemory {
                requested: usize::MAX
            })
        );
        assert!(!allocator.is_ready());
        assert_eq!(allocator.provider().acquisitions, 0);
    }

    #[test]
    fn test_provider_cannot_fit_the_first_pool() {
        let mut buffer = [0u8; 4096];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        // The tables fit, the pool does not.
        assert_eq!(
            allocator.init(4096, true),
            Err(PoolError::OutOfMemory { requested: 4096 })
        );
        assert!(!allocator.is_ready());
        // The tables were handed back.
        assert_eq!(allocator.provider().live, 0);
    }

    #[test]
    fn test_split_and_merge() {
        let mut buffer = [0u8; 8192];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        allocator.init(1024, false).unwrap();

        let a = allocator.malloc(24).unwrap();
        let b = allocator.malloc(100).unwrap();
        let c = allocator.malloc(1).unwrap();
        // Blocks are carved from the front of the pool, back to back.
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 24 + HEADER_SIZE);
        assert_eq!(c.as_ptr() as usize - b.as_ptr() as usize, 104 + HEADER_SIZE);
        let stats = assert_valid(&allocator);
        assert_eq!(stats.used_blocks, 3);
        assert_eq!(stats.used_bytes, 24 + 104 + MIN_BLOCK_SIZE);
        assert_eq!(stats.free_blocks, 1);

        unsafe {
            allocator.free(b.as_ptr()).unwrap();
            assert_eq!(assert_valid(&allocator).free_blocks, 2);
            // Merges with `b` on the right.
            allocator.free(a.as_ptr()).unwrap();
            assert_eq!(assert_valid(&allocator).free_blocks, 2);
            // Merges on both sides.
            allocator.free(c.as_ptr()).unwrap();
        }
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_bytes, allocator.max_request_size());

        allocator.shut_down().unwrap();
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        let mut buffer = [0u8; 8192];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        allocator.init(1024, false).unwrap();
        let max = allocator.max_request_size();

        // Leave less than a header plus a minimum block behind.
        let size = max - HEADER_SIZE - MIN_BLOCK_SIZE + WORD;
        let ptr = allocator.malloc(size).unwrap();
        let stats = assert_valid(&allocator);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.used_bytes, max);

        unsafe { allocator.free(ptr.as_ptr()).unwrap() };
        allocator.shut_down().unwrap();
    }

    #[test]
    fn test_free_errors() {
        let mut buffer = [0u8; 8192];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        unsafe {
            assert_eq!(
                allocator.free(core::ptr::null_mut()),
                Err(PoolError::NullFree)
            );
            let mut local = 0u64;
            assert_eq!(
                allocator.free(&mut local as *mut u64 as *mut u8),
                Err(PoolError::NotInitialized)
            );
        }

        allocator.init(1024, true).unwrap();
        unsafe {
            assert_eq!(
                allocator.free(core::ptr::null_mut()),
                Err(PoolError::NullFree)
            );
        }
        assert_valid(&allocator);
        allocator.shut_down().unwrap();
    }

    #[test]
    fn test_aligned_allocation_is_unimplemented() {
        let mut buffer = [0u8; 8192];
        let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
        allocator.init(1024, true).unwrap();
        let before = allocator.stats();

        assert_eq!(allocator.align_malloc(64, 64), Err(PoolError::Unimplemented));
        assert_eq!(allocator.align_calloc(64, 16), Err(PoolError::Unimplemented));
        assert_eq!(allocator.stats(), before);

        allocator.shut_down().unwrap();
    }
}
