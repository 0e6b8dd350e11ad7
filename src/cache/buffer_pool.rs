//! Reusable page-aligned buffers for block transfer.
//!
//! Every buffer is a fixed 16 KiB allocation aligned to the page size;
//! callers see a logical length of at most 16 KiB. Released buffers return
//! to a lock-free free list, so steady-state block traffic allocates
//! nothing.

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::constants::{BLOCK_SIZE, BUFFER_ALIGNMENT, BUFFER_POOL_CAPACITY};

/// A 16 KiB page-aligned allocation.
struct AlignedBuf {
    ptr: NonNull<u8>,
}

// The buffer is an exclusively owned allocation.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    fn layout() -> Layout {
        Layout::from_size_align(BLOCK_SIZE as usize, BUFFER_ALIGNMENT)
            .expect("valid block buffer layout")
    }

    fn new() -> Self {
        // Zeroed so that a partially filled buffer never exposes
        // uninitialized bytes through its logical window.
        let ptr = unsafe { alloc::alloc_zeroed(Self::layout()) };
        let Some(ptr) = NonNull::new(ptr) else {
            alloc::handle_alloc_error(Self::layout());
        };
        Self { ptr }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), BLOCK_SIZE as usize) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), BLOCK_SIZE as usize) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout()) };
    }
}

/// Pool of reusable [`DiskBuffer`]s. Acquisition always succeeds: when the
/// free list is empty a fresh buffer is allocated.
pub struct DiskBufferPool {
    free: ArrayQueue<AlignedBuf>,
}

impl DiskBufferPool {
    pub fn new() -> Arc<Self> {
        let pool = Arc::new(Self {
            free: ArrayQueue::new(BUFFER_POOL_CAPACITY),
        });
        for _ in 0..BUFFER_POOL_CAPACITY {
            let _ = pool.free.push(AlignedBuf::new());
        }
        pool
    }

    /// Acquires a buffer with logical length `len` (clamped to 16 KiB).
    /// The buffer's contents are whatever the previous user left; the
    /// caller is expected to fill all `len` bytes.
    pub fn get(self: &Arc<Self>, len: usize) -> DiskBuffer {
        let buf = self.free.pop().unwrap_or_else(AlignedBuf::new);
        DiskBuffer {
            buf: Some(buf),
            len: len.min(BLOCK_SIZE as usize),
            pool: Arc::clone(self),
        }
    }

    /// Acquires a buffer pre-filled with a copy of `data`.
    pub fn get_from(self: &Arc<Self>, data: &[u8]) -> DiskBuffer {
        let mut buffer = self.get(data.len());
        buffer.copy_from_slice(data);
        buffer
    }

    /// Buffers currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A pooled 16 KiB block buffer with a caller-visible logical length.
/// Dropping it returns the memory to the pool.
pub struct DiskBuffer {
    buf: Option<AlignedBuf>,
    len: usize,
    pool: Arc<DiskBufferPool>,
}

impl DiskBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for DiskBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf.as_ref().expect("buffer taken").as_slice()[..self.len]
    }
}

impl DerefMut for DiskBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut().expect("buffer taken").as_mut_slice()[..self.len]
    }
}

impl AsRef<[u8]> for DiskBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            // A full free list just lets the allocation die.
            let _ = self.pool.free.push(buf);
        }
    }
}

impl std::fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBuffer").field("len", &self.len).finish()
    }
}
