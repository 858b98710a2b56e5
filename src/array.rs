//! Per-owner buffer chain manager
//!
//! A [`SegmentedArray`] owns an ordered chain of buffers, newest first,
//! and serves `allocate()` from the head buffer with a single atomic
//! increment. When the head fills up the array enters a short
//! arbitration scope, takes a recycled buffer from the shared pool if
//! one is available or acquires a fresh one sized by its
//! [`GrowthPolicy`], and links it as the new head. Threads that lose
//! the arbitration simply retry the fast path.
//!
//! Bulk reclamation hands the entire chain to the pool in one splice;
//! the buffers are reset by whichever array later reuses them, so slots
//! always read as zero on first use after recycling.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::error::AllocResult;
use crate::policy::GrowthPolicy;
use crate::pool::FreeBufferPool;
use crate::utils::is_aligned_ptr;

/// Per-owner segmented allocation chain
pub struct SegmentedArray {
    name: &'static str,
    policy: GrowthPolicy,
    pool: Arc<FreeBufferPool>,

    // Chain of owned buffers; first is the current allocation target,
    // last is the oldest buffer and terminates the chain.
    first: AtomicPtr<Buffer>,
    last: AtomicPtr<Buffer>,

    // Aggregate counters; independently atomic, read lock-free.
    num_available: AtomicUsize,
    num_allocated: AtomicUsize,
    num_buffers: AtomicUsize,
    mem_size: AtomicUsize,

    // Arbitration for chain mutation: at most one thread installs a new
    // head buffer at a time.
    grow_lock: Mutex<()>,
}

impl SegmentedArray {
    /// Creates an empty array bound to a shared pool of the same
    /// element-size category
    ///
    /// `name` labels diagnostics only. The policy is validated here so
    /// every later slow-path computation is known to be in range.
    pub fn create(
        name: &'static str,
        policy: GrowthPolicy,
        pool: Arc<FreeBufferPool>,
    ) -> AllocResult<Self> {
        policy.validate()?;
        Ok(Self {
            name,
            policy,
            pool,
            first: AtomicPtr::new(ptr::null_mut()),
            last: AtomicPtr::new(ptr::null_mut()),
            num_available: AtomicUsize::new(0),
            num_allocated: AtomicUsize::new(0),
            num_buffers: AtomicUsize::new(0),
            mem_size: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
        })
    }

    /// Allocates one slot and returns its address
    ///
    /// The slot reads as all zero bytes on first use after the owning
    /// buffer was initialized or recycled. Fails only when fresh
    /// backing memory cannot be acquired; an exhausted head buffer or
    /// an empty pool are handled internally.
    pub fn allocate(&self) -> AllocResult<NonNull<u8>> {
        loop {
            let head = self.first.load(Ordering::Acquire);
            if !head.is_null() {
                // SAFETY: buffers linked into the chain stay alive until
                // drop_all, which requires exclusive access to self.
                if let Some(slot) = unsafe { (*head).allocate_slot() } {
                    self.num_allocated.fetch_add(1, Ordering::Relaxed);
                    debug_assert!(is_aligned_ptr(
                        slot.as_ptr(),
                        self.policy.alignment() as usize
                    ));
                    return Ok(slot);
                }
            }
            self.install_buffer(head)?;
        }
    }

    /// Slow path: install a new head buffer
    ///
    /// Exactly one thread mutates the chain at a time; a thread that
    /// finds the head already changed returns immediately and retries
    /// the fast path.
    fn install_buffer(&self, observed: *mut Buffer) -> AllocResult<()> {
        let _guard = self.grow_lock.lock();

        // Another thread may have installed a buffer while we waited.
        if self.first.load(Ordering::Acquire) != observed {
            return Ok(());
        }

        let slot_size = self.policy.slot_size();
        let buffer = match self.pool.pop() {
            Some(mut recycled) => {
                debug_assert_eq!(
                    recycled.elem_size(),
                    slot_size,
                    "pool category does not match this array's element size"
                );
                recycled.reset(observed);
                trace!(
                    array = self.name,
                    tag = self.policy.tag(),
                    capacity = recycled.num_elems(),
                    "reusing pooled buffer"
                );
                recycled
            }
            None => {
                let prev_capacity = if observed.is_null() {
                    0
                } else {
                    // SAFETY: observed is the current head, kept alive by
                    // the chain.
                    unsafe { (*observed).num_elems() }
                };
                let capacity = self.policy.next_capacity(prev_capacity);
                let fresh = Buffer::new_linked(
                    slot_size,
                    capacity,
                    self.policy.alignment(),
                    observed,
                    Arc::clone(self.pool.source()),
                )?;
                trace!(
                    array = self.name,
                    tag = self.policy.tag(),
                    capacity,
                    "acquired fresh buffer"
                );
                fresh
            }
        };

        self.num_buffers.fetch_add(1, Ordering::Relaxed);
        self.mem_size.fetch_add(buffer.mem_size(), Ordering::Relaxed);
        self.num_available
            .fetch_add(buffer.num_elems() as usize, Ordering::Relaxed);

        let raw = Box::into_raw(buffer);
        if observed.is_null() {
            self.last.store(raw, Ordering::Relaxed);
        }
        self.first.store(raw, Ordering::Release);
        Ok(())
    }

    /// Applies `visitor` to every currently-allocated slot, head buffer
    /// first, in index order within each buffer
    ///
    /// Intended for synchronized phases: the caller must ensure no
    /// `allocate()` call races the traversal, otherwise slots written
    /// concurrently may be observed mid-update through the returned
    /// pointers.
    pub fn iterate<F>(&self, mut visitor: F)
    where
        F: FnMut(NonNull<u8>),
    {
        let mut cursor = self.first.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: chain buffers stay alive while this array owns
            // them.
            let buffer = unsafe { &*cursor };
            for slot in buffer.iter_allocated() {
                visitor(slot);
            }
            cursor = buffer.next();
        }
    }

    /// Returns the entire chain to the shared pool and resets this
    /// array to empty
    ///
    /// Requires exclusive access; share the array with scoped threads
    /// and call this after the scope ends. The returned buffers keep
    /// their contents until some array's slow path resets them.
    pub fn drop_all(&mut self) {
        let first = *self.first.get_mut();
        if !first.is_null() {
            let last = *self.last.get_mut();
            let count = *self.num_buffers.get_mut();
            let bytes = *self.mem_size.get_mut();

            #[cfg(debug_assertions)]
            self.verify_chain(first, last, count, bytes);

            debug!(
                array = self.name,
                tag = self.policy.tag(),
                buffers = count,
                bytes,
                "returning buffer chain to pool"
            );
            // SAFETY: exclusive access; the chain from first to last is
            // fully owned by this array and last terminates it.
            unsafe { self.pool.bulk_push(first, last, count, bytes) };
        }

        *self.first.get_mut() = ptr::null_mut();
        *self.last.get_mut() = ptr::null_mut();
        *self.num_buffers.get_mut() = 0;
        *self.mem_size.get_mut() = 0;
        *self.num_available.get_mut() = 0;
        *self.num_allocated.get_mut() = 0;
    }

    #[cfg(debug_assertions)]
    fn verify_chain(&self, first: *mut Buffer, last: *mut Buffer, count: usize, bytes: usize) {
        let mut walked_count = 0;
        let mut walked_bytes = 0;
        let mut tail = first;
        let mut cursor = first;
        while !cursor.is_null() {
            // SAFETY: exclusive access to the owned chain.
            let buffer = unsafe { &*cursor };
            walked_count += 1;
            walked_bytes += buffer.mem_size();
            tail = cursor;
            cursor = buffer.next();
        }
        assert_eq!(walked_count, count, "buffer count inconsistent");
        assert_eq!(walked_bytes, bytes, "memory size inconsistent");
        assert!(ptr::eq(tail, last), "inconsistent last buffer");
    }

    /// Number of buffers currently chained
    pub fn num_buffers(&self) -> usize {
        self.num_buffers.load(Ordering::Relaxed)
    }

    /// Number of slots handed out since the last reclamation
    pub fn length(&self) -> usize {
        self.num_allocated.load(Ordering::Relaxed)
    }

    /// Number of slots the chain can hold in total
    pub fn num_available(&self) -> usize {
        self.num_available.load(Ordering::Relaxed)
    }

    /// Memory footprint of the chained buffers
    pub fn mem_size(&self) -> usize {
        self.mem_size.load(Ordering::Relaxed)
    }

    /// Diagnostic name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The sizing policy this array was created with
    pub fn policy(&self) -> &GrowthPolicy {
        &self.policy
    }
}

impl Drop for SegmentedArray {
    fn drop(&mut self) {
        self.drop_all();
    }
}

impl fmt::Debug for SegmentedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedArray")
            .field("name", &self.name)
            .field("tag", &self.policy.tag())
            .field("buffers", &self.num_buffers())
            .field("length", &self.length())
            .field("mem_size", &self.mem_size())
            .finish()
    }
}
