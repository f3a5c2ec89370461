//! Cross-process descriptor and handle exchange.
//!
//! Three independent pieces, usable on their own:
//!
//! - [`DescriptorSet`] (Unix, `fd` feature): descriptors attached to one IPC
//!   message, sent and received as `SCM_RIGHTS` by [`send_with_descriptors`]
//!   and [`recv_with_descriptors`].
//! - [`SharedHandleTable`]: tag-to-handle lookup over shared memory, for a
//!   broker to hand kernel handles to a sandboxed child during bootstrap.
//! - [`ThreadCollisionWarner`]: reports two threads inside a region that must
//!   be single-threaded.
//!
//! # Bootstrap sketch
//!
//! ```ignore
//! use handoff::prelude::*;
//!
//! // Broker
//! let segment = ShmSegment::create(&SegmentConfig::default())?;
//! let table = unsafe { SharedHandleTable::init(segment.region()) }?;
//! table.set_handle(LOG_PIPE, log_fd as RawHandle)?;
//!
//! let mut set = DescriptorSet::new();
//! set.add_and_auto_close(segment.try_clone_fd()?.into_raw_fd())?;
//! send_with_descriptors(&socket, b"boot", &mut set)?;
//!
//! // Child
//! let (_, mut set) = recv_with_descriptors(&socket, &mut buf)?;
//! let fd = set.next_descriptor().ok_or("missing segment")?;
//! let segment = ShmSegment::open(unsafe { OwnedFd::from_raw_fd(fd) })?;
//! let table = unsafe { SharedHandleTable::init(segment.region()) }?;
//! let log_fd = table.get_handle(LOG_PIPE)?;
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub use handoff_primitives;
pub use handoff_primitives::{
    CollisionAsserter, CountingAsserter, DefaultAsserter, EMPTY_TAG, HandleTableError,
    LogAsserter, PanicAsserter, RawHandle, Region, ScopedCheck, ScopedRecursiveCheck,
    SharedHandleTable, SharedItem, ThreadCollisionWarner,
};

#[cfg(all(unix, feature = "fd"))]
pub use handoff_fd;
#[cfg(all(unix, feature = "fd"))]
pub use handoff_fd::{
    DescriptorEntry, DescriptorSet, DescriptorSetError, MAX_DESCRIPTORS_PER_MESSAGE,
    recv_with_descriptors, send_with_descriptors,
};
#[cfg(all(any(target_os = "linux", target_os = "android"), feature = "fd"))]
pub use handoff_fd::{SegmentConfig, ShmSegment};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        CollisionAsserter, HandleTableError, RawHandle, SharedHandleTable,
        ThreadCollisionWarner,
    };
    #[cfg(all(unix, feature = "fd"))]
    pub use crate::{
        DescriptorSet, DescriptorSetError, recv_with_descriptors, send_with_descriptors,
    };
    #[cfg(all(any(target_os = "linux", target_os = "android"), feature = "fd"))]
    pub use crate::{SegmentConfig, ShmSegment};
}
