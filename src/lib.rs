//! Segmented arena allocation for fixed-size runtime bookkeeping records
//!
//! This crate provides a three-layer allocator built for workloads where
//! many independent owners continuously allocate small, uniformly-sized
//! records and reclaim them only in bulk:
//!
//! - [`Buffer`]: a fixed-capacity slab with atomic bump allocation
//! - [`FreeBufferPool`]: a shared, lock-free stack of recyclable buffers
//! - [`SegmentedArray`]: a per-owner buffer chain serving `allocate()`
//!   calls and returning its whole chain to the pool in one operation
//!
//! The per-element fast path is a single atomic increment. Buffer
//! recycling between owners goes through the pool without locks. The
//! only mutual exclusion in the design is the short arbitration scope a
//! [`SegmentedArray`] enters when its current buffer fills up.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use segmented_arena::{FreeBufferPool, GrowthPolicy, SegmentedArray};
//!
//! # fn main() -> segmented_arena::AllocResult<()> {
//! let pool = Arc::new(FreeBufferPool::with_system("example"));
//! let policy = GrowthPolicy::new(16)
//!     .with_initial_capacity(8)
//!     .with_max_capacity(64);
//! let mut array = SegmentedArray::create("records", policy, Arc::clone(&pool))?;
//!
//! let _slot = array.allocate()?;
//! assert_eq!(array.length(), 1);
//!
//! // Hand the whole chain back to the shared pool.
//! array.drop_all();
//! assert_eq!(array.length(), 0);
//! assert_eq!(pool.count(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

// Core modules
pub mod error;
pub mod utils;

pub mod array;
pub mod buffer;
pub mod policy;
pub mod pool;
pub mod source;

// Re-export common types for convenience
pub use array::SegmentedArray;
pub use buffer::Buffer;
pub use error::{AllocError, AllocResult};
pub use policy::{GrowthPolicy, GrowthStrategy};
pub use pool::{DrainedChain, FreeBufferPool};
pub use source::{MemorySource, SharedSource, SystemSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
