//! Sources of raw memory for pools and index tables.
//!
//! ## [`PoolProvider`](trait.PoolProvider.html)
//!
//! `PoolProvider` is a simple trait interface meant to abstract over the calls
//! to the OS to obtain and return regions of memory.
//!
//! ## [`MmapProvider`](struct.MmapProvider.html)
//!
//! Maps anonymous virtual memory pages with `libc::mmap`. Requires the
//! `use_libc` feature.
//!
//! ## [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` hands out pieces of a borrowed byte buffer, and can pretend to be
//! the OS for such a purpose. It is mainly useful for testing.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

#[cfg(feature = "use_libc")]
use core::ptr::null_mut;

#[cfg(feature = "use_libc")]
use errno::Errno;

use crate::size_class::round_up;

pub trait PoolProvider {
    type Err: fmt::Debug;

    /// Obtain a region of exactly `size` usable bytes, aligned to `align`.
    ///
    /// # Safety
    ///
    /// `align` must be a power of two. The returned memory must be available
    /// and untracked by any other rust code, and stays owned by the caller
    /// until it is passed back to [`release`](PoolProvider::release).
    unsafe fn acquire(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Return a region obtained from [`acquire`](PoolProvider::acquire).
    ///
    /// # Safety
    ///
    /// `ptr`, `size` and `align` must be exactly those of a previous
    /// successful `acquire` on this provider, and nothing may touch the region
    /// afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// MmapProvider uses virtual memory to back pools.
#[cfg(feature = "use_libc")]
#[derive(Default, Debug)]
pub struct MmapProvider {
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
}

#[cfg(feature = "use_libc")]
impl MmapProvider {
    pub const fn new() -> Self {
        MmapProvider {
            pages: 0,
            mappings: 0,
        }
    }

    /// Pages currently mapped.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Mappings currently live.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

#[cfg(feature = "use_libc")]
impl PoolProvider for MmapProvider {
    type Err = Errno;

    unsafe fn acquire(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Errno> {
        let pagesize = sysconf::page::pagesize();
        // Mappings are page aligned; anything stricter is not supported.
        if size == 0 || align > pagesize {
            return Err(Errno(libc::EINVAL));
        }
        let to_allocate = round_up(size, pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.mappings += 1;

        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize, _align: usize) {
        let pagesize = sysconf::page::pagesize();
        let to_release = match round_up(size, pagesize) {
            Some(to_release) => to_release,
            None => return,
        };

        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, to_release) != 0 {
            log::warn!(
                "munmap of {:?} ({} bytes) failed: {}",
                ptr,
                to_release,
                errno::errno()
            );
            return;
        }

        self.pages -= to_release / pagesize;
        self.mappings -= 1;
    }
}

/// A fixed buffer that pretends to be the OS.
///
/// Regions are carved off the front of the buffer in order. Releasing a region
/// only counts it; once every region has been released, the buffer is reused
/// from the start, so a shut down allocator that is initialized again gets
/// the same addresses as the first time.
pub struct ToyHeap<'a> {
    base: NonNull<u8>,
    len: usize,
    /// Bytes of the buffer handed out so far, including alignment padding.
    pub size: usize,
    /// Regions handed out and not yet released.
    pub live: usize,
    /// Successful acquisitions over the heap's lifetime.
    pub acquisitions: usize,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl<'a> ToyHeap<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        ToyHeap {
            // A slice pointer is never null.
            base: NonNull::new(buffer.as_mut_ptr()).unwrap_or(NonNull::dangling()),
            len: buffer.len(),
            size: 0,
            live: 0,
            acquisitions: 0,
            _buffer: PhantomData,
        }
    }

    /// Bytes of the buffer still available, ignoring alignment.
    pub fn remaining(&self) -> usize {
        self.len - self.size
    }
}

// A ToyHeap only hands out pointers into the buffer it mutably borrows, so
// moving it to another thread is as fine as moving the borrow.
unsafe impl Send for ToyHeap<'_> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError();

impl PoolProvider for ToyHeap<'_> {
    type Err = ToyHeapOverflowError;

    unsafe fn acquire(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, Self::Err> {
        let address = self.base.as_ptr() as usize;
        let start = round_up(address + self.size, align).ok_or(ToyHeapOverflowError())? - address;
        match start.checked_add(size) {
            Some(end) if end <= self.len => {
                self.size = end;
                self.live += 1;
                self.acquisitions += 1;
                Ok(NonNull::new_unchecked(self.base.as_ptr().add(start)))
            }
            _ => Err(ToyHeapOverflowError()),
        }
    }

    unsafe fn release(&mut self, _ptr: NonNull<u8>, _size: usize, _align: usize) {
        self.live -= 1;
        if self.live == 0 {
            self.size = 0;
        }
    }
}
