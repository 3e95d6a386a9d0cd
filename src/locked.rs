//! A thread-safe allocator, using a spin lock around a [`TlsfPool`].
//!
//! Thread-safety is required for an allocator to be used as a global
//! allocator. A [`LockedPool`] initializes itself with its [`PoolConfig`] on
//! first use, so it can live in a `static`:
//!
//! ```no_run
//! use tlsf_pool::{LockedPool, MmapProvider, PoolConfig};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedPool<MmapProvider> =
//!     LockedPool::with_config(MmapProvider::new(), PoolConfig::new(1 << 20, true));
//! # fn main() {}
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;

use spin::{Mutex, MutexGuard};

use crate::allocator::{PoolConfig, TlsfPool, DEFAULT_POOL_SIZE};
use crate::error::PoolError;
#[cfg(feature = "use_libc")]
use crate::provider::MmapProvider;
use crate::provider::PoolProvider;
use crate::size_class::WORD;
use crate::stats::{Stats, Validity};

pub struct LockedPool<P: PoolProvider> {
    config: PoolConfig,
    pool: Mutex<TlsfPool<P>>,
}

/// A [`LockedPool`] backed by anonymous memory mappings.
#[cfg(feature = "use_libc")]
pub type UnixAllocator = LockedPool<MmapProvider>;

impl<P: PoolProvider> LockedPool<P> {
    /// A locked allocator that initializes itself with the default
    /// configuration.
    pub const fn new(provider: P) -> Self {
        Self::with_config(provider, PoolConfig::new(DEFAULT_POOL_SIZE, true))
    }

    pub const fn with_config(provider: P, config: PoolConfig) -> Self {
        LockedPool {
            config,
            pool: Mutex::new(TlsfPool::new(provider)),
        }
    }

    /// Lock and get the underlying pool, without initializing it.
    ///
    /// Allocation through this `LockedPool` blocks while the guard is alive.
    pub fn lock(&self) -> MutexGuard<TlsfPool<P>> {
        self.pool.lock()
    }

    /// Lock the underlying pool, initializing it first if needed.
    fn ready(&self) -> Result<MutexGuard<TlsfPool<P>>, PoolError> {
        let mut pool = self.pool.lock();
        if !pool.is_ready() {
            pool.init_with(self.config)?;
        }
        Ok(pool)
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.pool.lock().stats()
    }
}

unsafe impl<P: PoolProvider + Send> GlobalAlloc for LockedPool<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Payloads are only guaranteed word alignment.
        if layout.align() > WORD {
            return null_mut();
        }
        match self.ready().and_then(|mut pool| pool.malloc(layout.size())) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > WORD {
            return null_mut();
        }
        match self.ready().and_then(|mut pool| pool.calloc(layout.size())) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Err(err) = self.pool.lock().free(ptr) {
            log::warn!("Failed to free {:?}: {}", ptr, err);
        }
    }
}
