//! COM-style task memory for platforms without COM.
//!
//! `CoTaskMemAlloc` is itself layered over the process heap, so task memory is
//! served straight from the process heap facade here.

use crate::heap;

/// Allocates `size` bytes of task memory. The contents are uninitialized.
/// Returns null on failure.
pub fn alloc(size: usize) -> *mut u8 {
    unsafe { heap::alloc(heap::process_heap(), size, false) }
}

/// Resizes a task memory block. Returns null on failure, leaving the original
/// block untouched.
///
/// # Safety
///
/// `ptr` must come from [`alloc`] or [`realloc`] and not have been freed.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { heap::realloc(heap::process_heap(), ptr, size, false) }
}

/// Releases a task memory block.
///
/// # Safety
///
/// `ptr` must not be used afterwards.
pub unsafe fn free(ptr: *mut u8) -> bool {
    unsafe { heap::free(heap::process_heap(), ptr) }
}

/// Returns the size of a task memory block.
///
/// # Safety
///
/// `ptr` must be a live task memory block.
pub unsafe fn size(ptr: *mut u8) -> Option<usize> {
    unsafe { heap::size(heap::process_heap(), ptr) }
}

/// Returns `true` if `ptr` is a live task memory block.
///
/// # Safety
///
/// `ptr` must be null or a task memory block.
pub unsafe fn validate(ptr: *mut u8) -> bool {
    unsafe { heap::validate(heap::process_heap(), ptr) }
}
