//! Raw memory views.
//!
//! A [`Region`] is a `(ptr, len)` pair over memory that somebody else owns:
//! an `mmap` of a shared segment in production, a [`HeapRegion`] in tests.
//! It is `Copy` so that every view built on top of it can hold its own.

use core::mem::{align_of, size_of};

/// A view over a contiguous block of memory.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: a Region is only an address range. Whatever is layered on top of it
// is responsible for synchronizing access to the bytes.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a raw pointer and length.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes for as long as
    /// the region (or anything built on it) is used.
    #[inline]
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if the base address is aligned for `T`.
    #[inline]
    pub fn is_aligned_for<T>(&self) -> bool {
        (self.base as usize).is_multiple_of(align_of::<T>())
    }

    /// Number of whole `T`s that fit in the region.
    #[inline]
    pub fn count_of<T>(&self) -> usize {
        self.len / size_of::<T>()
    }

    /// Pointer `offset` bytes into the region.
    ///
    /// # Safety
    ///
    /// `offset` must be within the region.
    #[inline]
    pub unsafe fn offset(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        // SAFETY: the caller keeps `offset` within the region.
        unsafe { self.base.add(offset) }
    }

    /// Reference to a `T` at `offset`.
    ///
    /// # Safety
    ///
    /// `offset` must be aligned for `T`, `offset + size_of::<T>()` must be
    /// within the region, and the bytes must be a valid `T`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + size_of::<T>() <= self.len);
        // SAFETY: upheld by the caller.
        unsafe { &*(self.offset(offset) as *const T) }
    }
}

/// A zeroed, heap-allocated region that owns its memory.
///
/// Stands in for a shared mapping in tests: two [`Region`]s taken from the
/// same `HeapRegion` behave like two processes mapping the same segment.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: *mut u8,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
// SAFETY: the allocation is uniquely owned; access goes through Region views.
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    /// Allocate `len` zeroed bytes, 64-byte aligned.
    pub fn new_zeroed(len: usize) -> Self {
        let layout = alloc::alloc::Layout::from_size_align(len.max(1), 64)
            .unwrap_or_else(|_| panic!("invalid region size {len}"));
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    /// A view over the whole allocation.
    pub fn region(&self) -> Region {
        // SAFETY: the allocation lives as long as self.
        unsafe { Region::from_raw(self.ptr, self.layout.size()) }
    }

    /// A view over the first `len` bytes.
    pub fn region_prefix(&self, len: usize) -> Region {
        assert!(len <= self.layout.size(), "prefix longer than region");
        // SAFETY: len is within the allocation.
        unsafe { Region::from_raw(self.ptr, len) }
    }

    /// A view starting `offset` bytes in, for exercising alignment checks.
    pub fn region_at(&self, offset: usize) -> Region {
        assert!(offset <= self.layout.size(), "offset past end of region");
        // SAFETY: offset is within the allocation.
        unsafe { Region::from_raw(self.ptr.add(offset), self.layout.size() - offset) }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout in new_zeroed.
        unsafe { alloc::alloc::dealloc(self.ptr, self.layout) };
    }
}
