//! Heap facade for Windows, a direct call-through to the Win32 heap functions.
//!
//! See <https://learn.microsoft.com/en-us/windows/win32/memory/heap-functions>.

use windows_sys::Win32::{
    Foundation::{ERROR_NO_MORE_ITEMS, GetLastError, HANDLE},
    System::Memory::{
        GetProcessHeap, HEAP_ZERO_MEMORY, HeapAlloc, HeapCreate, HeapDestroy, HeapFree, HeapLock,
        HeapReAlloc, HeapSize, HeapUnlock, HeapValidate, HeapWalk, PROCESS_HEAP_ENTRY,
        PROCESS_HEAP_REGION,
    },
};

use crate::{HeapHandle, RegionInfo};

fn raw(heap: HeapHandle) -> HANDLE {
    heap.as_raw() as HANDLE
}

fn zero_flag(zero: bool) -> u32 {
    if zero { HEAP_ZERO_MEMORY } else { 0 }
}

/// Returns the handle of the process-wide default heap.
pub fn process_heap() -> HeapHandle {
    HeapHandle::from_raw(unsafe { GetProcessHeap() } as usize)
}

/// Creates a private heap (`HeapCreate`).
///
/// `max_size == 0` makes the heap growable.
pub fn create(initial_size: usize, max_size: usize) -> std::io::Result<HeapHandle> {
    let heap = unsafe { HeapCreate(0, initial_size, max_size) };
    if heap.is_null() {
        return Err(std::io::Error::last_os_error());
    }
    Ok(HeapHandle::from_raw(heap as usize))
}

/// Destroys a private heap (`HeapDestroy`), releasing every block in it.
///
/// # Safety
///
/// `heap` must come from [`create`], must not be destroyed twice, and none of
/// its blocks may be used afterwards.
pub unsafe fn destroy(heap: HeapHandle) -> std::io::Result<()> {
    if heap == process_heap() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "the process heap cannot be destroyed",
        ));
    }
    if unsafe { HeapDestroy(raw(heap)) } == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Allocates `size` bytes from `heap` (`HeapAlloc`). Returns null on failure.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn alloc(heap: HeapHandle, size: usize, zero: bool) -> *mut u8 {
    unsafe { HeapAlloc(raw(heap), zero_flag(zero), size) as *mut u8 }
}

/// Resizes a block (`HeapReAlloc`). Returns null on failure, leaving the
/// original block untouched.
///
/// # Safety
///
/// `heap` must be live and `ptr` must be a block allocated from it.
pub unsafe fn realloc(heap: HeapHandle, ptr: *mut u8, size: usize, zero: bool) -> *mut u8 {
    unsafe { HeapReAlloc(raw(heap), zero_flag(zero), ptr as _, size) as *mut u8 }
}

/// Releases a block (`HeapFree`).
///
/// # Safety
///
/// `heap` must be live; `ptr` must not be used afterwards.
pub unsafe fn free(heap: HeapHandle, ptr: *mut u8) -> bool {
    unsafe { HeapFree(raw(heap), 0, ptr as _) != 0 }
}

/// Returns the size of a block (`HeapSize`).
///
/// # Safety
///
/// `heap` must be live and `ptr` must be a block allocated from it.
pub unsafe fn size(heap: HeapHandle, ptr: *mut u8) -> Option<usize> {
    match unsafe { HeapSize(raw(heap), 0, ptr as _) } {
        usize::MAX => None,
        size => Some(size),
    }
}

/// Returns `true` if `ptr` is a valid block of `heap` (`HeapValidate`).
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn validate(heap: HeapHandle, ptr: *mut u8) -> bool {
    unsafe { HeapValidate(raw(heap), 0, ptr as _) != 0 }
}

/// Walks the heap until the first `PROCESS_HEAP_REGION` entry and reports
/// its committed and uncommitted sizes.
///
/// The walk holds the heap lock; other threads allocating from the same heap
/// block until it completes.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn first_region(heap: HeapHandle) -> std::io::Result<Option<RegionInfo>> {
    let heap = raw(heap);
    unsafe {
        if HeapLock(heap) == 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut entry: PROCESS_HEAP_ENTRY = std::mem::zeroed();
        let mut found = None;
        let mut error = None;
        loop {
            if HeapWalk(heap, &mut entry) == 0 {
                let last = GetLastError();
                if last != ERROR_NO_MORE_ITEMS {
                    error = Some(std::io::Error::from_raw_os_error(last as i32));
                }
                break;
            }
            if (entry.wFlags as u32) & PROCESS_HEAP_REGION != 0 {
                let region = entry.Anonymous.Region;
                found = Some(RegionInfo {
                    committed: region.dwCommittedSize as usize,
                    uncommitted: region.dwUnCommittedSize as usize,
                });
                break;
            }
        }
        HeapUnlock(heap);
        match error {
            Some(e) => Err(e),
            None => Ok(found),
        }
    }
}
