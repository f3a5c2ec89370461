//! Primitives for exchanging OS handles between processes.
//!
//! This crate is `no_std`-compatible apart from the thread collision warner,
//! which needs thread-local storage.
//!
//! # Primitives
//!
//! - [`SharedHandleTable`]: a tag-to-handle lookup table laid over a block of
//!   shared memory, for handing kernel handles to a sandboxed child before a
//!   richer IPC channel exists.
//! - [`ThreadCollisionWarner`] (`std` feature): a lock-free guard that reports
//!   when two threads are inside a region that must be single-threaded.
//!
//! Both work over caller-owned memory described by a [`Region`].
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the collision warner across all
//! thread interleavings.
//!
//! ```text
//! cargo test -p handoff-primitives --features loom
//! ```

#![no_std]
#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(feature = "std")]
pub mod collision;
pub mod handle_table;
pub mod region;
pub mod sync;

#[cfg(feature = "std")]
pub use collision::{
    CollisionAsserter, CountingAsserter, DefaultAsserter, LogAsserter, PanicAsserter,
    ScopedCheck, ScopedRecursiveCheck, ThreadCollisionWarner, current_thread_id,
};
pub use handle_table::{EMPTY_TAG, HandleTableError, RawHandle, SharedHandleTable, SharedItem};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
