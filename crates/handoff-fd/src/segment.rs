//! Anonymous shared memory segments backed by a memfd.
//!
//! The broker creates a segment, lays a
//! [`SharedHandleTable`](handoff_primitives::SharedHandleTable) over its
//! [`region`](ShmSegment::region), and sends the segment's descriptor to the
//! child (inherited, or in a [`DescriptorSet`](crate::DescriptorSet)). The
//! child maps the same pages with [`ShmSegment::open`].

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use handoff_primitives::Region;

/// Configuration for creating a segment.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Name shown in `/proc/<pid>/fd` (no filesystem entry is created).
    pub name: String,
    /// Size in bytes.
    pub size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: "handoff-handles".to_string(),
            size: 4096,
        }
    }
}

/// A `MAP_SHARED` mapping of a memfd.
pub struct ShmSegment {
    base_addr: *mut u8,
    size: usize,
    fd: OwnedFd,
}

// SAFETY: the mapping is plain shared memory; views built on it (the handle
// table) synchronize their own access.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create and map a new segment. Fresh memfd pages are zero-filled.
    pub fn create(config: &SegmentConfig) -> io::Result<Self> {
        if config.size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be > 0",
            ));
        }
        let name = CString::new(config.name.as_str()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment name contains a NUL byte",
            )
        })?;

        // SAFETY: name is a valid C string.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: memfd_create returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: ftruncate on an owned descriptor.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), config.size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let segment = Self::map(fd, config.size)?;
        tracing::debug!(name = %config.name, size = config.size, fd = segment.as_raw_fd(), "created shm segment");
        Ok(segment)
    }

    /// Map a segment from a descriptor received from the creator.
    pub fn open(fd: OwnedFd) -> io::Result<Self> {
        let mut stat = mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: fstat fills `stat` on success.
        if unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fstat returned 0.
        let size = unsafe { stat.assume_init() }.st_size as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory segment is empty",
            ));
        }

        let segment = Self::map(fd, size)?;
        tracing::debug!(size, fd = segment.as_raw_fd(), "opened shm segment");
        Ok(segment)
    }

    fn map(fd: OwnedFd, size: usize) -> io::Result<Self> {
        // SAFETY: mapping a descriptor we own; the result is checked below.
        let base_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base_addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            base_addr: base_addr as *mut u8,
            size,
            fd,
        })
    }

    /// A view over the whole mapping, valid while `self` lives.
    pub fn region(&self) -> Region {
        // SAFETY: the mapping stays in place until drop.
        unsafe { Region::from_raw(self.base_addr, self.size) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Duplicate the backing descriptor, for handing to another process.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl AsRawFd for ShmSegment {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for ShmSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: base_addr and size describe the mapping made in `map`.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("base_addr", &self.base_addr)
            .field("size", &self.size)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}
