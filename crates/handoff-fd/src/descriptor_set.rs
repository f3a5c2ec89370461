//! Auxiliary file descriptors attached to a single IPC message.
//!
//! A sender fills a [`DescriptorSet`] with [`add`](DescriptorSet::add) and
//! [`add_and_auto_close`](DescriptorSet::add_and_auto_close), flattens it with
//! [`get_descriptors`](DescriptorSet::get_descriptors) when encoding, then
//! releases its local copies with [`commit_all`](DescriptorSet::commit_all).
//!
//! A receiver loads the descriptors decoded from the wire with
//! [`set_descriptors`](DescriptorSet::set_descriptors) and hands them out in
//! order with [`next_descriptor`](DescriptorSet::next_descriptor).
//!
//! # Ownership
//!
//! Entries added with `add_and_auto_close`, and every received entry, are
//! owned by the set until consumed. Dropping a set closes the auto-close
//! entries nobody consumed. On the receiving side this is what stops a peer
//! from leaking descriptors into us by sending more than the message format
//! calls for.

use std::io;
use std::mem;
use std::os::fd::RawFd;

/// Default upper bound on descriptors carried by one message.
pub const MAX_DESCRIPTORS_PER_MESSAGE: usize = 7;

/// One descriptor in a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub fd: RawFd,
    /// The set closes this descriptor if it is never consumed.
    pub auto_close: bool,
}

/// Descriptors travelling with one message.
pub struct DescriptorSet {
    entries: Vec<DescriptorEntry>,
    capacity: usize,
    /// Number of entries handed out by `next_descriptor`.
    next_index: usize,
}

impl Default for DescriptorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorSet {
    /// An empty set holding at most [`MAX_DESCRIPTORS_PER_MESSAGE`] entries.
    pub fn new() -> Self {
        Self::with_capacity(MAX_DESCRIPTORS_PER_MESSAGE)
    }

    /// An empty set holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            next_index: 0,
        }
    }

    fn push(&mut self, fd: RawFd, auto_close: bool) -> Result<(), DescriptorSetError> {
        if self.entries.len() >= self.capacity {
            return Err(DescriptorSetError::Full {
                capacity: self.capacity,
            });
        }
        self.entries.push(DescriptorEntry { fd, auto_close });
        Ok(())
    }

    /// Append `fd`. The caller keeps responsibility for closing it.
    pub fn add(&mut self, fd: RawFd) -> Result<(), DescriptorSetError> {
        self.push(fd, false)
    }

    /// Append `fd` and hand the responsibility for closing it to the set.
    ///
    /// On error the set has not taken ownership; the caller still has to
    /// close `fd`.
    pub fn add_and_auto_close(&mut self, fd: RawFd) -> Result<(), DescriptorSetError> {
        self.push(fd, true)
    }

    /// Hand out the next unconsumed descriptor, or `None` once all have been
    /// handed out.
    ///
    /// A descriptor taken from here is no longer closed on drop. `commit_all`
    /// still closes it if it was added with auto-close.
    pub fn next_descriptor(&mut self) -> Option<RawFd> {
        let entry = self.entries.get(self.next_index)?;
        self.next_index += 1;
        Some(entry.fd)
    }

    /// Copy every descriptor, in order, into `buffer`. Returns the count.
    ///
    /// Only valid before anything has been consumed.
    pub fn get_descriptors(&self, buffer: &mut [RawFd]) -> Result<usize, DescriptorSetError> {
        if self.next_index != 0 {
            return Err(DescriptorSetError::AlreadyConsumed {
                consumed: self.next_index,
            });
        }
        if buffer.len() < self.entries.len() {
            return Err(DescriptorSetError::BufferTooSmall {
                needed: self.entries.len(),
                found: buffer.len(),
            });
        }

        for (slot, entry) in buffer.iter_mut().zip(&self.entries) {
            *slot = entry.fd;
        }
        Ok(self.entries.len())
    }

    /// [`get_descriptors`](Self::get_descriptors) into a fresh `Vec`.
    pub fn descriptors(&self) -> Result<Vec<RawFd>, DescriptorSetError> {
        let mut fds = vec![-1; self.entries.len()];
        self.get_descriptors(&mut fds)?;
        Ok(fds)
    }

    /// Close every auto-close entry and empty the set.
    ///
    /// Called by the sender once the message carrying these descriptors has
    /// been handed to the kernel, which now holds its own references.
    pub fn commit_all(&mut self) {
        for entry in self.entries.drain(..) {
            if entry.auto_close {
                close_descriptor(entry.fd);
            }
        }
        self.next_index = 0;
    }

    /// Load descriptors received from the wire. All of them become
    /// auto-close.
    ///
    /// The set must be empty. On error nothing is taken over and the caller
    /// must close `fds` itself.
    pub fn set_descriptors(&mut self, fds: &[RawFd]) -> Result<(), DescriptorSetError> {
        if !self.entries.is_empty() {
            return Err(DescriptorSetError::NotEmpty {
                len: self.entries.len(),
            });
        }
        if fds.len() > self.capacity {
            return Err(DescriptorSetError::TooMany {
                count: fds.len(),
                capacity: self.capacity,
            });
        }

        self.entries.extend(fds.iter().map(|&fd| DescriptorEntry {
            fd,
            auto_close: true,
        }));
        self.next_index = 0;
        Ok(())
    }

    /// Move all entries and the cursor out of `other`, leaving it empty.
    ///
    /// This set must be empty and able to hold everything in `other`.
    pub fn take_from(&mut self, other: &mut DescriptorSet) -> Result<(), DescriptorSetError> {
        if !self.entries.is_empty() {
            return Err(DescriptorSetError::NotEmpty {
                len: self.entries.len(),
            });
        }
        if other.entries.len() > self.capacity {
            return Err(DescriptorSetError::TooMany {
                count: other.entries.len(),
                capacity: self.capacity,
            });
        }

        self.entries = mem::take(&mut other.entries);
        self.next_index = mem::replace(&mut other.next_index, 0);
        Ok(())
    }

    /// True if any entry refers to a directory.
    ///
    /// A directory descriptor lets the holder open paths beneath it, so a
    /// broker should refuse to forward one across a trust boundary. Entries
    /// that cannot be inspected are treated as directories.
    pub fn contains_directory_descriptor(&self) -> bool {
        self.entries.iter().any(|entry| match descriptor_mode(entry.fd) {
            Ok(mode) => (mode & libc::S_IFMT) == libc::S_IFDIR,
            Err(error) => {
                tracing::debug!(fd = entry.fd, %error, "fstat failed while checking for directories");
                true
            }
        })
    }

    /// Number of entries, consumed or not.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries handed out so far.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.next_index
    }

    /// Number of entries not yet handed out.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.entries.len() - self.next_index
    }

    /// All entries, consumed or not.
    pub fn entries(&self) -> &[DescriptorEntry] {
        &self.entries
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        if self.next_index == self.entries.len() {
            return;
        }

        let unconsumed = self.entries.len() - self.next_index;
        let mut closed = 0usize;
        for entry in &self.entries[self.next_index..] {
            if entry.auto_close {
                close_descriptor(entry.fd);
                closed += 1;
            }
        }

        tracing::warn!(
            unconsumed,
            closed,
            "descriptor set dropped with unconsumed descriptors"
        );
    }
}

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("entries", &self.entries)
            .field("capacity", &self.capacity)
            .field("next_index", &self.next_index)
            .finish()
    }
}

pub(crate) fn close_descriptor(fd: RawFd) {
    // SAFETY: closing an integer descriptor has no memory-safety impact; the
    // caller owns `fd`.
    if unsafe { libc::close(fd) } != 0 {
        let error = io::Error::last_os_error();
        tracing::debug!(fd, %error, "close failed");
    }
}

fn descriptor_mode(fd: RawFd) -> io::Result<libc::mode_t> {
    let mut stat = mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills `stat` on success and we only read it then.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat returned 0.
    Ok(unsafe { stat.assume_init() }.st_mode)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from descriptor set operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorSetError {
    /// The set already holds `capacity` entries.
    Full { capacity: usize },
    /// More descriptors than the set can hold.
    TooMany { count: usize, capacity: usize },
    /// The operation needs an empty set.
    NotEmpty { len: usize },
    /// The operation needs a set nothing has been consumed from.
    AlreadyConsumed { consumed: usize },
    /// Output buffer shorter than the set.
    BufferTooSmall { needed: usize, found: usize },
}

impl std::fmt::Display for DescriptorSetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full { capacity } => {
                write!(f, "descriptor set full ({} descriptors)", capacity)
            }
            Self::TooMany { count, capacity } => {
                write!(
                    f,
                    "too many descriptors: {} given, at most {} allowed",
                    count, capacity
                )
            }
            Self::NotEmpty { len } => {
                write!(f, "descriptor set must be empty, holds {}", len)
            }
            Self::AlreadyConsumed { consumed } => {
                write!(f, "{} descriptors already consumed", consumed)
            }
            Self::BufferTooSmall { needed, found } => {
                write!(
                    f,
                    "descriptor buffer too small: need {}, got {}",
                    needed, found
                )
            }
        }
    }
}

impl std::error::Error for DescriptorSetError {}

impl From<DescriptorSetError> for io::Error {
    fn from(e: DescriptorSetError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, e)
    }
}
