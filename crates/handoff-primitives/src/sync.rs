#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;

#[cfg(feature = "loom")]
pub(crate) use loom::thread_local;
#[cfg(all(not(feature = "loom"), feature = "std"))]
pub(crate) use std::thread_local;
