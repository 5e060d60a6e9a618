//! Network-API style buffers for platforms without the NetApi allocator,
//! served from the process heap facade.

use crate::heap;

/// Allocates a zeroed `size`-byte network buffer. Returns null on failure.
pub fn alloc(size: usize) -> *mut u8 {
    unsafe { heap::alloc(heap::process_heap(), size, true) }
}

/// Releases a network buffer.
///
/// # Safety
///
/// `ptr` must come from [`alloc`] and not be used afterwards.
pub unsafe fn free(ptr: *mut u8) -> bool {
    unsafe { heap::free(heap::process_heap(), ptr) }
}

/// Returns the size of a network buffer.
///
/// # Safety
///
/// `ptr` must be a live network buffer.
pub unsafe fn size(ptr: *mut u8) -> Option<usize> {
    unsafe { heap::size(heap::process_heap(), ptr) }
}

/// Returns `true` if `ptr` is a live network buffer.
///
/// # Safety
///
/// `ptr` must be null or a network buffer.
pub unsafe fn validate(ptr: *mut u8) -> bool {
    unsafe { heap::validate(heap::process_heap(), ptr) }
}
