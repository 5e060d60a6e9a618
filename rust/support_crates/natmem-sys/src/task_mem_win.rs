//! COM task memory (`CoTaskMemAlloc` and friends).

use windows_sys::Win32::System::Com::{CoTaskMemAlloc, CoTaskMemFree, CoTaskMemRealloc};

/// Allocates `size` bytes of task memory. The contents are uninitialized.
/// Returns null on failure.
pub fn alloc(size: usize) -> *mut u8 {
    unsafe { CoTaskMemAlloc(size) as *mut u8 }
}

/// Resizes a task memory block. Returns null on failure, leaving the original
/// block untouched.
///
/// # Safety
///
/// `ptr` must come from [`alloc`] or [`realloc`] and not have been freed.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { CoTaskMemRealloc(ptr as _, size) as *mut u8 }
}

/// Releases a task memory block.
///
/// # Safety
///
/// `ptr` must not be used afterwards.
pub unsafe fn free(ptr: *mut u8) -> bool {
    unsafe { CoTaskMemFree(ptr as _) };
    true
}

/// Task memory exposes no size query without going through `IMalloc`.
///
/// # Safety
///
/// `ptr` must be a live task memory block.
pub unsafe fn size(_ptr: *mut u8) -> Option<usize> {
    None
}

/// Task memory offers no validation primitive; a non-null pointer is assumed live.
///
/// # Safety
///
/// `ptr` must be null or a task memory block.
pub unsafe fn validate(ptr: *mut u8) -> bool {
    !ptr.is_null()
}
