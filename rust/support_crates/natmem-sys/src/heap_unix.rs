//! Heap facade for Unix targets.
//!
//! There is no native private-heap API, so each heap is a bookkeeping record
//! over `malloc`: it knows every block it handed out, which gives exact size
//! queries, validation, a `max_size` bound, and bulk release on destroy. The
//! process heap is one such record that lives for the rest of the process.
//! Blocks are plain `malloc` memory and stay compatible with `libc::free`
//! callers once released from the facade.

use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use ahash::AHashMap;

use crate::{HeapHandle, RegionInfo, round_up, virt};

struct PrivateHeap {
    initial_size: usize,
    max_size: usize,
    blocks: Mutex<Blocks>,
}

#[derive(Default)]
struct Blocks {
    live: AHashMap<usize, usize>,
    in_use: usize,
}

impl PrivateHeap {
    fn new(initial_size: usize, max_size: usize) -> PrivateHeap {
        PrivateHeap {
            initial_size,
            max_size,
            blocks: Mutex::new(Blocks::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Blocks> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, in_use: usize, size: usize) -> bool {
        self.max_size == 0
            || in_use
                .checked_add(size)
                .is_some_and(|total| total <= self.max_size)
    }
}

fn process() -> &'static PrivateHeap {
    static PROCESS_HEAP: OnceLock<PrivateHeap> = OnceLock::new();
    PROCESS_HEAP.get_or_init(|| PrivateHeap::new(0, 0))
}

/// # Safety
///
/// `heap` must be the process heap or a live handle returned by [`create`].
unsafe fn resolve<'a>(heap: HeapHandle) -> &'a PrivateHeap {
    unsafe { &*(heap.as_raw() as *const PrivateHeap) }
}

/// Returns the handle of the process-wide default heap.
pub fn process_heap() -> HeapHandle {
    HeapHandle::from_raw(process() as *const PrivateHeap as usize)
}

/// Creates a private heap.
///
/// `max_size == 0` makes the heap growable; otherwise the sum of live block
/// sizes may never exceed `max_size`.
pub fn create(initial_size: usize, max_size: usize) -> std::io::Result<HeapHandle> {
    if max_size != 0 && initial_size > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "initial heap size exceeds the maximum size",
        ));
    }
    let heap = Box::new(PrivateHeap::new(initial_size, max_size));
    Ok(HeapHandle::from_raw(Box::into_raw(heap) as usize))
}

/// Destroys a private heap, releasing every block still allocated from it.
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
    let heap = unsafe { Box::from_raw(heap.as_raw() as *mut PrivateHeap) };
    let blocks = std::mem::take(&mut *heap.lock());
    for &ptr in blocks.live.keys() {
        unsafe { libc::free(ptr as *mut libc::c_void) };
    }
    Ok(())
}

/// Allocates `size` bytes from `heap`, optionally zeroed.
///
/// Returns null when the heap refuses the request.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn alloc(heap: HeapHandle, size: usize, zero: bool) -> *mut u8 {
    let heap = unsafe { resolve(heap) };
    let mut blocks = heap.lock();
    if !heap.fits(blocks.in_use, size) {
        return std::ptr::null_mut();
    }
    let ptr = unsafe {
        if zero {
            libc::calloc(1, size.max(1))
        } else {
            libc::malloc(size.max(1))
        }
    } as *mut u8;
    if !ptr.is_null() {
        blocks.live.insert(ptr as usize, size);
        blocks.in_use += size;
    }
    ptr
}

/// Resizes a block in place when possible, moving it otherwise.
///
/// When `zero` is set, bytes past the old size are zeroed. Returns null on
/// failure, in which case the original block is left untouched.
///
/// # Safety
///
/// `heap` must be live and `ptr` must be a block allocated from it.
pub unsafe fn realloc(heap: HeapHandle, ptr: *mut u8, size: usize, zero: bool) -> *mut u8 {
    let heap = unsafe { resolve(heap) };
    let mut blocks = heap.lock();
    let Some(&old_size) = blocks.live.get(&(ptr as usize)) else {
        return std::ptr::null_mut();
    };
    if !heap.fits(blocks.in_use - old_size, size) {
        return std::ptr::null_mut();
    }
    let new_ptr = unsafe { libc::realloc(ptr as *mut libc::c_void, size.max(1)) } as *mut u8;
    if new_ptr.is_null() {
        return new_ptr;
    }
    blocks.live.remove(&(ptr as usize));
    blocks.live.insert(new_ptr as usize, size);
    blocks.in_use = blocks.in_use - old_size + size;
    if zero && size > old_size {
        unsafe { new_ptr.add(old_size).write_bytes(0, size - old_size) };
    }
    new_ptr
}

/// Releases a block. Returns `false` if `ptr` is not a live block of `heap`.
///
/// # Safety
///
/// `heap` must be live; `ptr` must not be used afterwards.
pub unsafe fn free(heap: HeapHandle, ptr: *mut u8) -> bool {
    let heap = unsafe { resolve(heap) };
    let mut blocks = heap.lock();
    match blocks.live.remove(&(ptr as usize)) {
        Some(size) => {
            blocks.in_use -= size;
            unsafe { libc::free(ptr as *mut libc::c_void) };
            true
        }
        None => false,
    }
}

/// Returns the size of a live block.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn size(heap: HeapHandle, ptr: *mut u8) -> Option<usize> {
    let heap = unsafe { resolve(heap) };
    heap.lock().live.get(&(ptr as usize)).copied()
}

/// Returns `true` if `ptr` is a live block of `heap`.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn validate(heap: HeapHandle, ptr: *mut u8) -> bool {
    let heap = unsafe { resolve(heap) };
    heap.lock().live.contains_key(&(ptr as usize))
}

/// Reports the heap's single emulated region.
///
/// Committed space is the page-rounded larger of the initial size and the live
/// bytes; a bounded heap reserves its page-rounded maximum.
///
/// # Safety
///
/// `heap` must be a live heap handle.
pub unsafe fn first_region(heap: HeapHandle) -> std::io::Result<Option<RegionInfo>> {
    let heap = unsafe { resolve(heap) };
    let page_size = virt::get_page_size();
    let in_use = heap.lock().in_use;
    let committed = round_up(in_use.max(heap.initial_size), page_size);
    let reserved = if heap.max_size == 0 {
        committed
    } else {
        round_up(heap.max_size, page_size).max(committed)
    };
    Ok(Some(RegionInfo {
        committed,
        uncommitted: reserved - committed,
    }))
}
