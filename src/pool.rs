//! Shared pool of recyclable buffers
//!
//! The pool is an intrusive lock-free stack: each [`Buffer`]'s own link
//! slot is the stack link, so no auxiliary nodes are allocated. All
//! operations are non-blocking and make progress through CAS or swap
//! retries; there is no mutual exclusion anywhere in this module.
//!
//! One pool serves all arrays of one element-size category. The
//! aggregate counters are independent relaxed atomics: transiently
//! stale under concurrent mutation, convergent once in-flight
//! operations complete.
//!
//! `pop` deliberately avoids the classic compare-and-swap head removal:
//! with recycled intrusive nodes, a stale `next` read racing a
//! pop/re-push cycle could be installed as the new head while the
//! buffer it points at is already owned by an array. Instead `pop`
//! swap-detaches the whole chain, keeps the head and re-splices the
//! remainder. Splicing is a pure push and never dereferences foreign
//! nodes, so no reclamation machinery is needed. A concurrent popper
//! can observe an empty pool while a chain is detached; emptiness is a
//! normal "acquire fresh memory" signal, not an error.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use tracing::debug;

use crate::buffer::Buffer;
use crate::source::{SharedSource, SystemSource};
use crate::utils::Backoff;

/// Lock-free stack of currently-unowned buffers
pub struct FreeBufferPool {
    head: AtomicPtr<Buffer>,
    num_buffers: AtomicUsize,
    mem_size: AtomicUsize,
    source: SharedSource,
    tag: &'static str,
}

impl FreeBufferPool {
    /// Creates an empty pool drawing backing memory from `source`
    pub fn new(tag: &'static str, source: SharedSource) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            num_buffers: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            source,
            tag,
        }
    }

    /// Creates an empty pool backed by the system allocator
    pub fn with_system(tag: &'static str) -> Self {
        Self::new(tag, SystemSource::shared())
    }

    /// The memory source arrays of this category acquire fresh buffers
    /// from
    pub(crate) fn source(&self) -> &SharedSource {
        &self.source
    }

    /// Category tag for diagnostics
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Pushes one buffer onto the stack
    pub fn push(&self, buffer: Box<Buffer>) {
        let bytes = buffer.mem_size();
        let node = Box::into_raw(buffer);
        // SAFETY: node came out of a Box and is exclusively ours until
        // the splice publishes it.
        unsafe { self.splice(node, node) };
        self.num_buffers.fetch_add(1, Ordering::Relaxed);
        self.mem_size.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Splices an already-linked chain onto the stack in one retry
    /// loop, then adds `count`/`bytes` to the aggregate counters.
    ///
    /// # Safety
    /// - the chain from `first` to `last` must be exclusively owned by
    ///   the caller and linked through the buffers' link slots
    /// - `last` must be the final node of that chain
    /// - `count` and `bytes` must describe exactly that chain
    pub unsafe fn bulk_push(
        &self,
        first: *mut Buffer,
        last: *mut Buffer,
        count: usize,
        bytes: usize,
    ) {
        debug_assert!(!first.is_null() && !last.is_null());
        // SAFETY: chain ownership per caller contract.
        unsafe { self.splice(first, last) };
        self.num_buffers.fetch_add(count, Ordering::Relaxed);
        self.mem_size.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Removes and returns one buffer, or `None` if the pool is empty
    pub fn pop(&self) -> Option<Box<Buffer>> {
        let first = NonNull::new(self.head.swap(ptr::null_mut(), Ordering::Acquire))?;
        // SAFETY: the swap transferred ownership of the whole detached
        // chain to this call.
        let mut buffer = unsafe { Box::from_raw(first.as_ptr()) };
        let rest = buffer.take_next();
        if !rest.is_null() {
            // SAFETY: the remainder is still exclusively ours.
            unsafe { self.requeue(rest) };
        }
        self.num_buffers.fetch_sub(1, Ordering::Relaxed);
        self.mem_size.fetch_sub(buffer.mem_size(), Ordering::Relaxed);
        Some(buffer)
    }

    /// Detaches the entire chain in one swap
    ///
    /// The returned chain owns its buffers; dropping it releases them.
    /// The reported count and bytes are exact for the detached set.
    pub fn drain(&self) -> DrainedChain {
        let first = self.head.swap(ptr::null_mut(), Ordering::Acquire);

        let mut count = 0usize;
        let mut bytes = 0usize;
        let mut cursor = first;
        while !cursor.is_null() {
            // SAFETY: the swap handed the chain to us.
            let buffer = unsafe { &*cursor };
            count += 1;
            bytes += buffer.mem_size();
            cursor = buffer.next();
        }

        if count > 0 {
            self.num_buffers.fetch_sub(count, Ordering::Relaxed);
            self.mem_size.fetch_sub(bytes, Ordering::Relaxed);
        }

        DrainedChain {
            head: first,
            count,
            bytes,
        }
    }

    /// Drains the pool and releases every buffer's backing memory
    pub fn release_all(&self) {
        let drained = self.drain();
        if !drained.is_empty() {
            debug!(
                tag = self.tag,
                buffers = drained.len(),
                bytes = drained.bytes(),
                "releasing pooled buffers"
            );
        }
        drop(drained);
    }

    /// Number of pooled buffers, best effort
    pub fn count(&self) -> usize {
        self.num_buffers.load(Ordering::Relaxed)
    }

    /// Bytes held by pooled buffers, best effort
    pub fn total_bytes(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// Prepends the chain `first..=last` without touching counters.
    ///
    /// # Safety
    /// Caller must exclusively own the chain and `last` must terminate
    /// it.
    unsafe fn splice(&self, first: *mut Buffer, last: *mut Buffer) {
        let mut backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: last is ours until the CAS below publishes it; the
            // release ordering of the CAS makes this store visible.
            unsafe { (*last).next_ptr().store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, first, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Returns a detached remainder chain to the stack.
    ///
    /// # Safety
    /// Caller must exclusively own the chain starting at `first`.
    unsafe fn requeue(&self, first: *mut Buffer) {
        // Common case: nothing was pushed while the chain was detached.
        if self
            .head
            .compare_exchange(
                ptr::null_mut(),
                first,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }
        // A push landed in the meantime; find our tail once and splice
        // behind the new head.
        let mut last = first;
        // SAFETY: the chain is ours until spliced back.
        unsafe {
            loop {
                let next = (*last).next_ptr().load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                last = next;
            }
            self.splice(first, last);
        }
    }
}

impl Drop for FreeBufferPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for FreeBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FreeBufferPool")
            .field("tag", &self.tag)
            .field("buffers", &self.count())
            .field("bytes", &self.total_bytes())
            .finish()
    }
}

/// An owned chain of buffers detached from a pool by
/// [`FreeBufferPool::drain`]
///
/// Iterating yields the buffers in stack order; any buffers not taken
/// are released when the chain is dropped.
pub struct DrainedChain {
    head: *mut Buffer,
    count: usize,
    bytes: usize,
}

impl DrainedChain {
    /// Number of buffers detached
    pub fn len(&self) -> usize {
        self.count
    }

    /// Total memory footprint of the detached buffers
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether the drain found nothing
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

impl Iterator for DrainedChain {
    type Item = Box<Buffer>;

    fn next(&mut self) -> Option<Box<Buffer>> {
        let head = NonNull::new(self.head)?;
        // SAFETY: the chain is exclusively owned by this value.
        let mut buffer = unsafe { Box::from_raw(head.as_ptr()) };
        self.head = buffer.take_next();
        Some(buffer)
    }
}

impl Drop for DrainedChain {
    fn drop(&mut self) {
        while self.next().is_some() {}
    }
}

impl fmt::Debug for DrainedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainedChain")
            .field("count", &self.count)
            .field("bytes", &self.bytes)
            .finish()
    }
}

// SAFETY: the chain is exclusively owned and buffers are Send.
unsafe impl Send for DrainedChain {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_buffer(num_elems: u32) -> Box<Buffer> {
        Buffer::new(8, num_elems, 8, SystemSource::shared()).unwrap()
    }

    #[test]
    fn test_lifo_order() {
        let pool = FreeBufferPool::with_system("test");

        let b1 = test_buffer(8);
        let b2 = test_buffer(8);
        let b3 = test_buffer(8);
        let (a1, a2, a3) = (b1.start(), b2.start(), b3.start());

        pool.push(b1);
        pool.push(b2);
        pool.push(b3);
        assert_eq!(pool.count(), 3);

        assert_eq!(pool.pop().unwrap().start(), a3);
        assert_eq!(pool.pop().unwrap().start(), a2);
        assert_eq!(pool.pop().unwrap().start(), a1);
        assert!(pool.pop().is_none());
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.total_bytes(), 0);
    }

    #[test]
    fn test_counters_track_bytes() {
        let pool = FreeBufferPool::with_system("test");
        let buffer = test_buffer(16);
        let bytes = buffer.mem_size();

        pool.push(buffer);
        assert_eq!(pool.total_bytes(), bytes);

        let buffer = pool.pop().unwrap();
        assert_eq!(pool.total_bytes(), 0);
        drop(buffer);
    }

    #[test]
    fn test_drain_returns_everything() {
        let pool = FreeBufferPool::with_system("test");
        let mut expected_bytes = 0;
        for _ in 0..5 {
            let buffer = test_buffer(8);
            expected_bytes += buffer.mem_size();
            pool.push(buffer);
        }

        let drained = pool.drain();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained.bytes(), expected_bytes);
        assert_eq!(pool.count(), 0);
        assert_eq!(pool.total_bytes(), 0);

        assert_eq!(drained.into_iter().count(), 5);
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_drain_empty() {
        let pool = FreeBufferPool::with_system("test");
        let drained = pool.drain();
        assert!(drained.is_empty());
        assert_eq!(drained.len(), 0);
        assert_eq!(drained.bytes(), 0);
    }

    #[test]
    fn test_release_all() {
        let pool = FreeBufferPool::with_system("test");
        for _ in 0..4 {
            pool.push(test_buffer(8));
        }
        pool.release_all();
        assert_eq!(pool.count(), 0);
        assert!(pool.pop().is_none());
    }

    #[test]
    fn test_concurrent_push_pop_converges() {
        let pool = Arc::new(FreeBufferPool::with_system("test"));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for _ in 0..200 {
                        pool.push(test_buffer(8));
                        if let Some(buffer) = pool.pop() {
                            pool.push(buffer);
                        }
                    }
                });
            }
        });

        // Every thread pushed 200 and re-pushed what it popped, so all
        // 800 buffers are pooled once the storm settles.
        assert_eq!(pool.count(), 800);
        let drained = pool.drain();
        assert_eq!(drained.len(), 800);
    }
}
