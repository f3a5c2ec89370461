//! POSIX side of handle exchange.
//!
//! - [`DescriptorSet`]: the descriptors attached to one IPC message, with
//!   close-on-drop for anything the receiver never consumed.
//! - [`scm`]: sending and receiving a set as `SCM_RIGHTS` ancillary data over
//!   a Unix domain socket.
//! - [`ShmSegment`] (Linux): a memfd-backed mapping to lay a
//!   [`SharedHandleTable`](handoff_primitives::SharedHandleTable) over.

#![cfg(unix)]
#![forbid(unsafe_op_in_unsafe_fn)]

mod descriptor_set;
pub mod scm;
#[cfg(any(target_os = "linux", target_os = "android"))]
mod segment;

pub use descriptor_set::{
    DescriptorEntry, DescriptorSet, DescriptorSetError, MAX_DESCRIPTORS_PER_MESSAGE,
};
pub use scm::{recv_with_descriptors, send_with_descriptors};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use segment::{SegmentConfig, ShmSegment};

#[cfg(test)]
pub(crate) mod test_util {
    use std::fs::File;
    use std::os::fd::{IntoRawFd, RawFd};

    use parking_lot::Mutex;

    /// Held by every test that checks whether a descriptor number is still
    /// open, so another test cannot reuse the number in between.
    pub static FD_LOCK: Mutex<()> = Mutex::new(());

    pub fn open_fd() -> RawFd {
        File::open("/dev/null").unwrap().into_raw_fd()
    }

    pub fn open_dir_fd() -> RawFd {
        File::open("/").unwrap().into_raw_fd()
    }

    pub fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    pub fn is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }
}
