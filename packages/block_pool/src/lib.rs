#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Pools of equal-size memory blocks with O(1) allocation and release.
//!
//! This package provides two layers:
//!
//! * [`FixedBlockPool`] - a single contiguous slab split into a fixed number of blocks. Free
//!   blocks are tracked by a stack of block indexes, so both allocation and release are O(1).
//!   The number of blocks in one slab is capped at [`MAX_BLOCKS_PER_POOL`].
//! * [`GrowablePool`] - a set of [`FixedBlockPool`] slabs that grows on demand by a configurable
//!   factor. Slabs are kept ordered by address so the owner of a released block is found in
//!   O(log P). Unused slabs are returned to the process only when explicitly requested via
//!   [`GrowablePool::shrink()`].
//!
//! The pools hand out raw, uninitialized memory. They never read or write the contents of a
//! block - constructing and destroying whatever lives in a block is the caller's business.
//!
//! # Failure model
//!
//! The only recoverable failure is the process allocator refusing to supply a new slab, which
//! is reported as [`Error::OutOfMemory`]. Misuse (releasing a block the pool never handed out,
//! exceeding the per-slab block limit) is a programming error and panics. Releasing the same
//! block twice is detected in debug builds only.
//!
//! # Example
//!
//! ```rust
//! use block_pool::GrowablePool;
//!
//! let mut pool = GrowablePool::builder().block_layout_of::<u64>().build();
//!
//! let block = pool.allocate()?.cast::<u64>();
//!
//! // SAFETY: The block is valid for writes of the layout the pool was built for.
//! unsafe { block.write(42) };
//!
//! // SAFETY: We just wrote the value.
//! assert_eq!(unsafe { block.read() }, 42);
//!
//! pool.release(block.cast());
//! assert!(pool.is_empty());
//! # Ok::<(), block_pool::Error>(())
//! ```
//!
//! # Thread safety
//!
//! All types are thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). They perform no
//! internal locking and none of their operations block.

mod builder;
mod drop_policy;
mod error;
mod fixed;
mod growable;

pub use builder::*;
pub use drop_policy::*;
pub use error::Error;
pub(crate) use error::Result;
pub use fixed::*;
pub use growable::*;
