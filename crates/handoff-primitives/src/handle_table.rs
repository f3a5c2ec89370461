//! Tag-to-handle lookup table over shared memory.
//!
//! A broker publishes kernel handle values under application-chosen tags and
//! a sandboxed child looks them up, before any richer IPC channel exists.
//!
//! ```text
//! slot 0            slot 1            slot 2
//! ┌──────┬───────┐  ┌──────┬───────┐  ┌──────┬───────┐
//! │ tag  │ item  │  │ tag  │ item  │  │ 0    │ 0     │  ...
//! │ u32  │ usize │  │ u32  │ usize │  │ free │       │
//! └──────┴───────┘  └──────┴───────┘  └──────┴───────┘
//! ```
//!
//! # Synchronization
//!
//! There is none. Slots are read and written with relaxed atomics, which
//! keeps cross-process access free of data races but orders nothing. A reader
//! must only call [`SharedHandleTable::get_handle`] after an external signal
//! (an event, a pipe write, an IPC message) tells it the writer's
//! [`SharedHandleTable::set_handle`] has happened.
//!
//! The backing memory must be zero-filled before either side touches it:
//! tag `0` is the only way a slot is recognized as free.
//!
//! # Duplicate tags
//!
//! Setting a tag that is already present writes a second slot rather than
//! replacing the first. Lookups scan from slot 0 and return the first match,
//! so the older value stays authoritative. Callers that need replacement
//! semantics must use a fresh tag.

use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::region::Region;

/// A platform handle value: a Windows `HANDLE` or a POSIX descriptor.
pub type RawHandle = usize;

/// Tag value marking an empty slot. Never a valid application tag.
pub const EMPTY_TAG: u32 = 0;

/// One slot of the table. This layout crosses a process boundary.
#[repr(C)]
pub struct SharedItem {
    pub tag: AtomicU32,
    pub item: AtomicUsize,
}

const _: () = assert!(size_of::<SharedItem>() == 2 * size_of::<usize>());
const _: () = assert!(align_of::<SharedItem>() == align_of::<usize>());
static_assertions::assert_eq_size!(AtomicU32, u32);
static_assertions::assert_eq_size!(AtomicUsize, RawHandle);

/// A view of a shared memory block as an array of [`SharedItem`]s.
pub struct SharedHandleTable {
    region: Region,
    slot_count: usize,
}

impl SharedHandleTable {
    /// Bind a table to `region`.
    ///
    /// The table holds `region.len() / size_of::<SharedItem>()` slots; any
    /// trailing bytes are ignored.
    ///
    /// # Safety
    ///
    /// The region must stay mapped for the lifetime of the table, must be
    /// zero-filled before first use by any participant, and must only be
    /// accessed by other `SharedHandleTable`s.
    pub unsafe fn init(region: Region) -> Result<Self, HandleTableError> {
        let required = size_of::<SharedItem>();
        if region.len() < required {
            return Err(HandleTableError::TooSmall {
                required,
                found: region.len(),
            });
        }
        if !region.is_aligned_for::<SharedItem>() {
            return Err(HandleTableError::Misaligned {
                align: align_of::<SharedItem>(),
            });
        }

        Ok(Self {
            slot_count: region.count_of::<SharedItem>(),
            region,
        })
    }

    #[inline]
    fn slot(&self, index: usize) -> &SharedItem {
        debug_assert!(index < self.slot_count);
        // SAFETY: index < slot_count keeps the item inside the region, init
        // checked alignment, and an all-zero SharedItem is valid.
        unsafe { self.region.get::<SharedItem>(index * size_of::<SharedItem>()) }
    }

    fn slots(&self) -> impl Iterator<Item = &SharedItem> {
        (0..self.slot_count).map(|i| self.slot(i))
    }

    /// Publish `handle` under `tag` in the first free slot.
    pub fn set_handle(&self, tag: u32, handle: RawHandle) -> Result<(), HandleTableError> {
        if tag == EMPTY_TAG {
            return Err(HandleTableError::ReservedTag);
        }

        let slot = self
            .slots()
            .find(|slot| slot.tag.load(Ordering::Relaxed) == EMPTY_TAG)
            .ok_or(HandleTableError::Full {
                capacity: self.slot_count,
            })?;

        slot.item.store(handle, Ordering::Relaxed);
        slot.tag.store(tag, Ordering::Relaxed);
        Ok(())
    }

    /// Look up the handle published under `tag`.
    ///
    /// The slot is left in place; this is a lookup table, not a queue.
    pub fn get_handle(&self, tag: u32) -> Result<RawHandle, HandleTableError> {
        if tag == EMPTY_TAG {
            return Err(HandleTableError::ReservedTag);
        }

        self.slots()
            .find(|slot| slot.tag.load(Ordering::Relaxed) == tag)
            .map(|slot| slot.item.load(Ordering::Relaxed))
            .ok_or(HandleTableError::NotFound { tag })
    }

    /// Number of slots in the table.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slot_count
    }

    /// Number of slots currently holding a tag (approximate if the other side
    /// is writing).
    pub fn occupied(&self) -> usize {
        self.slots()
            .filter(|slot| slot.tag.load(Ordering::Relaxed) != EMPTY_TAG)
            .count()
    }
}

impl core::fmt::Debug for SharedHandleTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedHandleTable")
            .field("base", &self.region.as_ptr())
            .field("capacity", &self.slot_count)
            .finish_non_exhaustive()
    }
}

/// Errors from handle table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleTableError {
    /// The backing memory cannot hold a single slot.
    TooSmall { required: usize, found: usize },
    /// The backing memory is not aligned for [`SharedItem`].
    Misaligned { align: usize },
    /// Tag 0 marks empty slots and cannot be stored or looked up.
    ReservedTag,
    /// Every slot is taken.
    Full { capacity: usize },
    /// No slot carries the tag.
    NotFound { tag: u32 },
}

impl core::fmt::Display for HandleTableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooSmall { required, found } => {
                write!(
                    f,
                    "handle table memory too small: need {} bytes, got {}",
                    required, found
                )
            }
            Self::Misaligned { align } => {
                write!(f, "handle table memory not {}-byte aligned", align)
            }
            Self::ReservedTag => write!(f, "tag 0 is reserved for empty slots"),
            Self::Full { capacity } => write!(f, "handle table full ({} slots)", capacity),
            Self::NotFound { tag } => write!(f, "no handle for tag {}", tag),
        }
    }
}

impl core::error::Error for HandleTableError {}
