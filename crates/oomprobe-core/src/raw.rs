//! Raw reservations backing tracked allocations.
//!
//! Alignment comes from the host: every reservation is requested with a
//! `Layout` carrying the caller's alignment, so the block start is already
//! aligned and [`RawBlock::aligned_ptr`] resolves to offset 0. The size is
//! still padded to `size + alignment - 1`, which keeps the aligned window in
//! bounds even for a start address that needed rounding. The block keeps its
//! own start and `Layout`, so release is always exact.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::error::TrackerError;

/// Round `addr` up to a multiple of `alignment` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(addr: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (addr + mask) & !mask
}

/// Uniquely owned storage obtained from the system allocator.
#[derive(Debug)]
pub struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: a RawBlock is the only handle to its reservation; moving it between
// threads moves exclusive ownership of plain bytes.
unsafe impl Send for RawBlock {}

impl RawBlock {
    /// Reserve room for `size` bytes at `alignment`.
    pub fn reserve(size: usize, alignment: usize) -> Result<Self, TrackerError> {
        let invalid = TrackerError::InvalidLayout { size, alignment };
        if !alignment.is_power_of_two() {
            return Err(invalid);
        }
        let actual_size = size.checked_add(alignment - 1).ok_or(invalid)?;
        // The system allocator rejects zero-sized layouts.
        let layout = Layout::from_size_align(actual_size.max(1), alignment).map_err(|_| invalid)?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(TrackerError::HostOutOfMemory { size, alignment })?;
        Ok(Self { ptr, layout })
    }

    /// Start address of the reservation.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Bytes physically reserved.
    #[must_use]
    pub fn actual_size(&self) -> usize {
        self.layout.size()
    }

    /// First address inside the block that satisfies `alignment`.
    ///
    /// The returned window `[aligned, aligned + size)` lies inside the block
    /// for any `size` the block was reserved for at this alignment.
    #[must_use]
    pub fn aligned_ptr(&self, alignment: usize) -> NonNull<u8> {
        let offset = align_up(self.addr(), alignment) - self.addr();
        debug_assert!(offset < alignment);
        // SAFETY: offset < alignment <= actual_size + 1, and the reservation
        // holds size + alignment - 1 bytes, so the result stays in bounds
        // (or one past the end for a zero-sized window).
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by std::alloc::alloc with exactly this layout
        // and is released only here.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
