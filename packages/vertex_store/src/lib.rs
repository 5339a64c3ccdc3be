#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Address-ordered bookkeeping of the memory blocks tracked by a garbage collector.
//!
//! A [`VertexStore`] records one [`Vertex`] per tracked block: the block's base address, its size
//! and a callback that releases the block. The collector uses the store to:
//!
//! * start tracking a block ([`VertexStore::add_vertex()`]),
//! * resolve a raw address found during graph traversal to the vertex of the block it points
//!   into ([`VertexStore::get_vertex()`] for exact matches,
//!   [`VertexStore::get_container_vertex()`] for addresses anywhere within a block),
//! * stop tracking a dead block and release it ([`VertexStore::remove_vertex()`]).
//!
//! The store never owns the tracked memory. Releasing a block is delegated to the callback that
//! was supplied when the block started being tracked, which the store invokes exactly once.
//!
//! Vertices are kept in slots of a [`block_pool::GrowablePool`], so adding and removing vertices
//! does not go through the process allocator once the pool has warmed up. Unused slots are only
//! returned to the process on request, via [`VertexStore::shrink_pool()`].
//!
//! # Example
//!
//! ```rust
//! use std::ptr::NonNull;
//!
//! use vertex_store::VertexStore;
//!
//! fn release(address: NonNull<u8>) {
//!     println!("releasing block at {address:?}");
//! }
//!
//! let mut store: VertexStore = VertexStore::builder().build();
//!
//! let mut buffer = [0_u8; 32];
//! let address = NonNull::from(&mut buffer).cast::<u8>();
//!
//! let key = store.add_vertex(address, buffer.len(), release)?;
//!
//! // The collector marks reachable vertices while walking the object graph.
//! // SAFETY: The offset is within the buffer.
//! let interior = unsafe { address.add(17) };
//! store
//!     .get_container_vertex_mut(interior.as_ptr())
//!     .expect("address is inside a tracked block")
//!     .set_marked(true);
//!
//! assert!(store.get_vertex(address.as_ptr()).unwrap().is_marked());
//!
//! store.remove_vertex(key);
//! # Ok::<(), vertex_store::Error>(())
//! ```
//!
//! # Thread safety
//!
//! A store is thread-mobile ([`Send`]) as long as its release callbacks are, but never
//! thread-safe ([`Sync`]). All operations are synchronous and bounded; none of them block.

mod builder;
mod error;
mod store;
mod vertex;

pub use builder::*;
pub use error::Error;
pub(crate) use error::Result;
pub use store::*;
pub use vertex::*;
