//! Fixed-capacity slab with atomic bump allocation
//!
//! A [`Buffer`] holds `num_elems` slots of `elem_size` bytes and hands
//! them out by advancing a single monotonic atomic index. The index is
//! incremented unconditionally, so under contention it can overshoot
//! the capacity; any value at or above capacity uniformly means full
//! and the stored value is never corrected.
//!
//! The intrusive `next` slot links a buffer either into an owning
//! array's chain or into the free pool's stack, never both at once.
//! Exactly one structure owns a buffer at any time; hand-off between
//! owners is a single atomic pointer operation performed by the owner.

use std::alloc::Layout;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::error::{AllocError, AllocResult};
use crate::source::SharedSource;
use crate::utils::CheckedArithmetic;

/// A fixed-capacity slab of equal-size slots
pub struct Buffer {
    elem_size: u32,
    num_elems: u32,

    // Link slot shared between an array's chain and the pool's stack.
    next: AtomicPtr<Buffer>,

    // Index of the next slot to hand out. Full once >= num_elems; may
    // exceed num_elems after racing increments.
    next_allocate: AtomicU32,

    storage: NonNull<u8>,
    layout: Layout,
    source: SharedSource,
}

impl Buffer {
    /// Creates an unlinked buffer with zero-filled storage acquired
    /// from `source`.
    pub fn new(
        elem_size: u32,
        num_elems: u32,
        alignment: u32,
        source: SharedSource,
    ) -> AllocResult<Box<Buffer>> {
        Self::new_linked(elem_size, num_elems, alignment, ptr::null_mut(), source)
    }

    /// Creates a buffer whose link slot already points at `next`.
    pub(crate) fn new_linked(
        elem_size: u32,
        num_elems: u32,
        alignment: u32,
        next: *mut Buffer,
        source: SharedSource,
    ) -> AllocResult<Box<Buffer>> {
        if elem_size == 0 || num_elems == 0 {
            return Err(AllocError::invalid_config(
                "buffer element size and capacity must be non-zero",
            ));
        }
        let bytes = (num_elems as usize).try_mul(elem_size as usize)?;
        let layout = Layout::from_size_align(bytes, alignment as usize)
            .map_err(|_| AllocError::invalid_config("invalid buffer storage layout"))?;

        // SAFETY: bytes > 0 since both factors are non-zero.
        let storage = unsafe { source.acquire_zeroed(layout)? };

        Ok(Box::new(Buffer {
            elem_size,
            num_elems,
            next: AtomicPtr::new(next),
            next_allocate: AtomicU32::new(0),
            storage,
            layout,
            source,
        }))
    }

    /// Claims the next free slot, or `None` once the buffer is full.
    ///
    /// The pre-check keeps the overshoot past capacity bounded to the
    /// number of racing threads; it does not change the contract that
    /// any stored index `>= num_elems` means full.
    #[inline]
    pub fn allocate_slot(&self) -> Option<NonNull<u8>> {
        if self.next_allocate.load(Ordering::Relaxed) >= self.num_elems {
            return None;
        }
        let index = self.next_allocate.fetch_add(1, Ordering::Relaxed);
        if index >= self.num_elems {
            return None;
        }
        // SAFETY: index < num_elems, so the offset stays inside storage.
        let slot = unsafe {
            self.storage
                .as_ptr()
                .add(index as usize * self.elem_size as usize)
        };
        // SAFETY: derived from a NonNull base by an in-bounds offset.
        Some(unsafe { NonNull::new_unchecked(slot) })
    }

    /// Rewinds the allocation index, relinks the buffer and zero-fills
    /// its storage.
    ///
    /// Requires exclusive access (`&mut`), which the type system uses
    /// to guarantee no allocator or pool can observe the buffer while
    /// it is reinitialized.
    pub fn reset(&mut self, next: *mut Buffer) {
        debug_assert!(!ptr::eq(next, self), "buffer linked to itself");
        *self.next_allocate.get_mut() = 0;
        *self.next.get_mut() = next;
        // SAFETY: exclusive access; storage spans layout.size() bytes.
        unsafe { ptr::write_bytes(self.storage.as_ptr(), 0, self.layout.size()) };
    }

    /// Number of slots handed out, clamped to the capacity for display
    #[inline]
    pub fn length(&self) -> u32 {
        self.next_allocate.load(Ordering::Relaxed).min(self.num_elems)
    }

    /// Whether every slot has been handed out
    #[inline]
    pub fn is_full(&self) -> bool {
        self.next_allocate.load(Ordering::Relaxed) >= self.num_elems
    }

    /// Slot capacity of this buffer
    #[inline]
    pub fn num_elems(&self) -> u32 {
        self.num_elems
    }

    /// Size of one slot in bytes
    #[inline]
    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    /// Storage alignment of this buffer
    #[inline]
    pub fn alignment(&self) -> u32 {
        self.layout.align() as u32
    }

    /// Memory footprint: header plus backing storage
    #[inline]
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Buffer>() + self.layout.size()
    }

    /// Start of the backing storage
    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.storage
    }

    /// Currently linked successor
    #[inline]
    pub fn next(&self) -> *mut Buffer {
        self.next.load(Ordering::Acquire)
    }

    /// Direct access to the link slot for pool splicing
    #[inline]
    pub(crate) fn next_ptr(&self) -> &AtomicPtr<Buffer> {
        &self.next
    }

    /// Detaches and returns the successor link
    pub(crate) fn take_next(&mut self) -> *mut Buffer {
        std::mem::replace(self.next.get_mut(), ptr::null_mut())
    }

    /// Visits the allocated slots in index order
    pub fn iter_allocated(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        let len = self.length();
        (0..len).map(move |index| {
            // SAFETY: index < length() <= num_elems.
            let slot = unsafe {
                self.storage
                    .as_ptr()
                    .add(index as usize * self.elem_size as usize)
            };
            // SAFETY: in-bounds offset from a NonNull base.
            unsafe { NonNull::new_unchecked(slot) }
        })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: storage was acquired from this source with this layout
        // and is not referenced past this point.
        unsafe { self.source.release(self.storage, self.layout) };
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("elem_size", &self.elem_size)
            .field("num_elems", &self.num_elems)
            .field("length", &self.length())
            .field("mem_size", &self.mem_size())
            .finish()
    }
}

// SAFETY: the storage region is exclusively owned by this buffer and
// only reachable through it; the allocation index is atomic. Slot
// pointers handed out are raw and carry their own aliasing contract.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SystemSource;

    fn test_buffer(elem_size: u32, num_elems: u32) -> Box<Buffer> {
        Buffer::new(elem_size, num_elems, 8, SystemSource::shared()).unwrap()
    }

    #[test]
    fn test_bump_allocation() {
        let buffer = test_buffer(16, 4);

        let first = buffer.allocate_slot().unwrap();
        assert_eq!(first, buffer.start());

        let second = buffer.allocate_slot().unwrap();
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            16,
            "slots are contiguous"
        );
        assert_eq!(buffer.length(), 2);
        assert!(!buffer.is_full());
    }

    #[test]
    fn test_full_buffer() {
        let buffer = test_buffer(8, 2);

        assert!(buffer.allocate_slot().is_some());
        assert!(buffer.allocate_slot().is_some());
        assert!(buffer.allocate_slot().is_none());
        assert!(buffer.is_full());
        // Length stays clamped even after failed attempts.
        assert_eq!(buffer.length(), 2);
    }

    #[test]
    fn test_fresh_storage_is_zeroed() {
        let buffer = test_buffer(32, 4);
        let slot = buffer.allocate_slot().unwrap();

        unsafe {
            for i in 0..32 {
                assert_eq!(*slot.as_ptr().add(i), 0);
            }
        }
    }

    #[test]
    fn test_reset_zeroes_storage() {
        let mut buffer = test_buffer(8, 4);

        let slot = buffer.allocate_slot().unwrap();
        unsafe { slot.as_ptr().write_bytes(0xFF, 8) };

        buffer.reset(ptr::null_mut());
        assert_eq!(buffer.length(), 0);

        let slot = buffer.allocate_slot().unwrap();
        assert_eq!(slot, buffer.start(), "reset rewinds to offset zero");
        unsafe {
            for i in 0..8 {
                assert_eq!(*slot.as_ptr().add(i), 0);
            }
        }
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Buffer::new(0, 8, 8, SystemSource::shared()).is_err());
        assert!(Buffer::new(8, 0, 8, SystemSource::shared()).is_err());
    }

    #[test]
    fn test_accessors() {
        let buffer = test_buffer(16, 4);
        assert_eq!(buffer.elem_size(), 16);
        assert_eq!(buffer.num_elems(), 4);
        assert_eq!(buffer.alignment(), 8);
        assert_eq!(
            buffer.mem_size(),
            std::mem::size_of::<Buffer>() + 16 * 4
        );
        assert!(buffer.next().is_null());
    }

    #[test]
    fn test_concurrent_slots_are_distinct() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let buffer = test_buffer(8, 1024);
        let seen = Mutex::new(HashSet::new());

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let mut local = Vec::new();
                    while let Some(slot) = buffer.allocate_slot() {
                        local.push(slot.as_ptr() as usize);
                    }
                    seen.lock().unwrap().extend(local);
                });
            }
        });

        assert_eq!(seen.lock().unwrap().len(), 1024);
        assert!(buffer.is_full());
        assert_eq!(buffer.length(), 1024);
    }
}
