//! Network management API buffers (`NetApiBufferAllocate` and friends).
//!
//! The API has a reallocation entry point, but buffers handed across the
//! NetApi boundary are treated as single-shot: callers resize by allocating a
//! new buffer and copying.

use windows_sys::Win32::NetworkManagement::NetManagement::{
    NERR_Success, NetApiBufferAllocate, NetApiBufferFree, NetApiBufferSize,
};

/// Allocates a `size`-byte network buffer. Returns null on failure.
pub fn alloc(size: usize) -> *mut u8 {
    let Ok(size) = u32::try_from(size) else {
        return std::ptr::null_mut();
    };
    let mut buffer = std::ptr::null_mut();
    let status = unsafe { NetApiBufferAllocate(size, &mut buffer) };
    if status != NERR_Success {
        return std::ptr::null_mut();
    }
    buffer as *mut u8
}

/// Releases a network buffer.
///
/// # Safety
///
/// `ptr` must come from [`alloc`] and not be used afterwards.
pub unsafe fn free(ptr: *mut u8) -> bool {
    unsafe { NetApiBufferFree(ptr as _) == NERR_Success }
}

/// Returns the size of a network buffer (`NetApiBufferSize`).
///
/// # Safety
///
/// `ptr` must be a live network buffer.
pub unsafe fn size(ptr: *mut u8) -> Option<usize> {
    let mut size = 0u32;
    let status = unsafe { NetApiBufferSize(ptr as _, &mut size) };
    (status == NERR_Success).then_some(size as usize)
}

/// Returns `true` if the API still recognizes `ptr` as a buffer.
///
/// # Safety
///
/// `ptr` must be null or a network buffer.
pub unsafe fn validate(ptr: *mut u8) -> bool {
    !ptr.is_null() && unsafe { size(ptr) }.is_some()
}
