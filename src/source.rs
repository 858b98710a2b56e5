//! Raw backing-memory capability
//!
//! Buffers do not acquire memory from a hard-coded allocator. The
//! capability is injected as a [`MemorySource`] handle so embedders can
//! route slab storage through their own accounting or a test double. It
//! is exercised only on the allocation slow path and at teardown.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::{AllocError, AllocResult};

/// Shared handle to a memory source
pub type SharedSource = Arc<dyn MemorySource>;

/// Raw-memory acquisition and release capability
///
/// # Safety
///
/// Implementors must ensure that:
/// - `acquire` returns a pointer valid for reads and writes of
///   `layout.size()` bytes, aligned to `layout.align()`, and exclusive
///   until released
/// - `release` is only required to accept pointers previously returned
///   by `acquire` on the same source with the same layout
pub unsafe trait MemorySource: Send + Sync {
    /// Acquires a region described by `layout`.
    ///
    /// # Safety
    /// `layout` must have a non-zero size.
    unsafe fn acquire(&self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Acquires a zero-filled region described by `layout`.
    ///
    /// # Safety
    /// `layout` must have a non-zero size.
    unsafe fn acquire_zeroed(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        let ptr = unsafe { self.acquire(layout)? };
        // SAFETY: the region just acquired spans layout.size() bytes.
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
        Ok(ptr)
    }

    /// Releases a region previously acquired from this source.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `acquire`/`acquire_zeroed` on
    ///   this source
    /// - `layout` must match the acquiring call exactly
    /// - `ptr` must not be used after this call
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Memory source backed by the system's global allocator
///
/// This is the default source. It is a zero-sized handle; cloning it or
/// wrapping it in an [`Arc`] costs nothing at allocation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSource;

impl SystemSource {
    /// Creates a new system source
    #[inline]
    pub const fn new() -> Self {
        SystemSource
    }

    /// Creates a shared handle to a system source
    pub fn shared() -> SharedSource {
        Arc::new(SystemSource)
    }
}

unsafe impl MemorySource for SystemSource {
    #[inline]
    unsafe fn acquire(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has non-zero size (caller contract).
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).ok_or_else(|| AllocError::out_of_memory(layout.size(), layout.align()))
    }

    #[inline]
    unsafe fn acquire_zeroed(&self, layout: Layout) -> AllocResult<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has non-zero size (caller contract).
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| AllocError::out_of_memory(layout.size(), layout.align()))
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: ptr was acquired from the system allocator with this
        // exact layout (caller contract).
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}
