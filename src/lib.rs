#![cfg_attr(not(test), no_std)]

//! A two-level segregated fit (TLSF) memory allocator.
//!
//! Memory comes from a [`PoolProvider`] in fixed-size pools. Free blocks are
//! kept in a two-level table of size classes, indexed by a pair of bitmaps,
//! so both allocation and deallocation take bounded time regardless of how
//! many blocks exist.
//!
//! ## Types
//!
//! - [`TlsfPool`]: the single-threaded allocator, with an explicit
//!   `init`/`shut_down` lifecycle.
//! - [`LockedPool`]: a `TlsfPool` behind a spin lock, usable as a
//!   `#[global_allocator]`.
//! - [`MmapProvider`] (feature `use_libc`, on by default) and [`ToyHeap`]:
//!   providers backed by anonymous mappings and by a borrowed buffer.
//!
//! ```
//! use tlsf_pool::{TlsfPool, ToyHeap};
//!
//! let mut buffer = vec![0u8; 8 * 1024];
//! let mut allocator = TlsfPool::new(ToyHeap::new(&mut buffer));
//! allocator.init(1024, false).unwrap();
//!
//! let ptr = allocator.malloc(56).unwrap();
//! unsafe { allocator.free(ptr.as_ptr()).unwrap() };
//!
//! allocator.shut_down().unwrap();
//! ```

mod allocator;
mod bitscan;
mod block;
mod error;
mod free_list;
mod locked;
mod pool;
mod provider;
mod size_class;
mod stats;

pub use allocator::{PoolConfig, TlsfPool, DEFAULT_POOL_SIZE};
pub use bitscan::{find_lsb, find_msb};
pub use error::PoolError;
#[cfg(feature = "use_libc")]
pub use locked::UnixAllocator;
pub use locked::LockedPool;
#[cfg(feature = "use_libc")]
pub use provider::MmapProvider;
pub use provider::{PoolProvider, ToyHeap, ToyHeapOverflowError};
pub use size_class::{SizeClass, WORD};
pub use stats::{Stats, Validity};
