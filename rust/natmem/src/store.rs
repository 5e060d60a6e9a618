//! Backend dispatch for buffer memory.
//!
//! A [`Store`] is the per-kind state a buffer needs to talk to the allocator
//! that produced its memory. Every operation routes through that allocator,
//! so a block is never released through the wrong one.

use std::mem::size_of;

use natmem_common::{Error, Result};
use natmem_sys::{HeapHandle, heap, net_buf, task_mem, virt};

use crate::options::{BackingStore, BufferOptions, StoreKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Store {
    Heap {
        heap: HeapHandle,
    },
    Aligned {
        heap: HeapHandle,
        alignment: usize,
        len: usize,
    },
    Virtual {
        capacity: usize,
        large_pages: bool,
        prefer_large_pages: bool,
    },
    ComTask {
        len: usize,
    },
    NetworkApi {
        len: usize,
    },
}

const SLOT: usize = size_of::<usize>();

impl Store {
    pub fn new(options: &BufferOptions, heap: HeapHandle) -> Store {
        match options.kind {
            StoreKind::Heap => Store::Heap { heap },
            StoreKind::Aligned => Store::Aligned {
                heap,
                alignment: options.alignment,
                len: 0,
            },
            StoreKind::Virtual => Store::Virtual {
                capacity: 0,
                large_pages: false,
                prefer_large_pages: options.prefer_large_pages,
            },
            StoreKind::ComTask => Store::ComTask { len: 0 },
            StoreKind::NetworkApi => Store::NetworkApi { len: 0 },
        }
    }

    pub fn kind(&self) -> StoreKind {
        match self {
            Store::Heap { .. } => StoreKind::Heap,
            Store::Aligned { .. } => StoreKind::Aligned,
            Store::Virtual { .. } => StoreKind::Virtual,
            Store::ComTask { .. } => StoreKind::ComTask,
            Store::NetworkApi { .. } => StoreKind::NetworkApi,
        }
    }

    pub fn backing_store(&self) -> BackingStore {
        match self {
            Store::Heap { heap } if *heap == heap::process_heap() => BackingStore::GeneralHeap,
            Store::Heap { .. } => BackingStore::CustomHeap,
            Store::Aligned { .. } => BackingStore::Aligned,
            Store::Virtual { .. } => BackingStore::Virtual,
            Store::ComTask { .. } => BackingStore::ComTask,
            Store::NetworkApi { .. } => BackingStore::NetworkApi,
        }
    }

    /// The heap this store's memory lives in, if any.
    pub fn resident_heap(&self) -> Option<HeapHandle> {
        match self {
            Store::Heap { heap } | Store::Aligned { heap, .. } => Some(*heap),
            _ => None,
        }
    }

    /// Returns a copy of this store that allocates from `target` instead.
    pub fn rebound(&self, target: HeapHandle) -> Store {
        let mut store = *self;
        match &mut store {
            Store::Heap { heap } | Store::Aligned { heap, .. } => *heap = target,
            _ => (),
        }
        store
    }

    /// Allocates a fresh block of `size` bytes.
    ///
    /// Per-kind bookkeeping (recorded length, capacity) is updated only on
    /// success.
    pub fn allocate(&mut self, size: usize, zero: bool) -> Result<*mut u8> {
        match self {
            Store::Heap { heap } => {
                let ptr = unsafe { heap::alloc(*heap, size, zero) };
                if ptr.is_null() {
                    return Err(refused(StoreKind::Heap, size));
                }
                Ok(ptr)
            }
            Store::Aligned {
                heap,
                alignment,
                len,
            } => {
                let raw_size = size
                    .checked_add(*alignment - 1)
                    .and_then(|n| n.checked_add(SLOT));
                let origin = match raw_size {
                    Some(raw_size) => unsafe { heap::alloc(*heap, raw_size, zero) },
                    None => std::ptr::null_mut(),
                };
                if origin.is_null() {
                    return Err(refused(StoreKind::Aligned, size));
                }
                let aligned = align_past_slot(origin, *alignment);
                unsafe { (aligned as *mut usize).sub(1).write_unaligned(origin as usize) };
                *len = size;
                Ok(aligned)
            }
            Store::Virtual {
                capacity,
                large_pages,
                prefer_large_pages,
            } => {
                let (ptr, granted, large) = allocate_pages(size, *prefer_large_pages)
                    .map_err(|e| {
                        log::warn!("virtual allocation of {size} bytes failed: {e}");
                        Error::allocation_failure(StoreKind::Virtual.name(), size)
                    })?;
                *capacity = granted;
                *large_pages = large;
                Ok(ptr)
            }
            Store::ComTask { len } => {
                let ptr = task_mem::alloc(size);
                if ptr.is_null() {
                    return Err(refused(StoreKind::ComTask, size));
                }
                if zero {
                    unsafe { ptr.write_bytes(0, size) };
                }
                *len = size;
                Ok(ptr)
            }
            Store::NetworkApi { len } => {
                let ptr = net_buf::alloc(size);
                if ptr.is_null() {
                    return Err(refused(StoreKind::NetworkApi, size));
                }
                if zero {
                    // The allocator may round up; clear everything it reports.
                    let span = unsafe { net_buf::size(ptr) }.unwrap_or(size).max(size);
                    unsafe { ptr.write_bytes(0, span) };
                }
                *len = size;
                Ok(ptr)
            }
        }
    }

    /// Resizes the block at `ptr`, preserving `[0, min(old_len, new_size))`.
    ///
    /// On failure the original block and the store are left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this store whose size is `old_len`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        old_len: usize,
        new_size: usize,
        zero_on_grow: bool,
    ) -> Result<*mut u8> {
        match self {
            Store::Heap { heap } => {
                let new_ptr = unsafe { heap::realloc(*heap, ptr, new_size, zero_on_grow) };
                if new_ptr.is_null() {
                    return Err(refused(StoreKind::Heap, new_size));
                }
                Ok(new_ptr)
            }
            Store::ComTask { len } => {
                let new_ptr = unsafe { task_mem::realloc(ptr, new_size) };
                if new_ptr.is_null() {
                    return Err(refused(StoreKind::ComTask, new_size));
                }
                if zero_on_grow && new_size > old_len {
                    unsafe { new_ptr.add(old_len).write_bytes(0, new_size - old_len) };
                }
                *len = new_size;
                Ok(new_ptr)
            }
            Store::Aligned { .. } | Store::Virtual { .. } | Store::NetworkApi { .. } => {
                let mut fresh = *self;
                let new_ptr = fresh.allocate(new_size, zero_on_grow)?;
                let mut old = *self;
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr, new_ptr, old_len.min(new_size));
                    if let Err(e) = old.release(ptr) {
                        let _ = fresh.release(new_ptr);
                        return Err(e);
                    }
                }
                *self = fresh;
                Ok(new_ptr)
            }
        }
    }

    /// Releases the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this store and must not be used
    /// afterwards.
    pub unsafe fn release(&mut self, ptr: *mut u8) -> Result<()> {
        let released = match self {
            Store::Heap { heap } => unsafe { heap::free(*heap, ptr) },
            Store::Aligned { heap, len, .. } => {
                *len = 0;
                unsafe { heap::free(*heap, origin_of(ptr)) }
            }
            Store::Virtual {
                capacity,
                large_pages,
                ..
            } => {
                let result = unsafe {
                    if *large_pages {
                        virt::free_large_pages(ptr, *capacity)
                    } else {
                        virt::free(ptr, *capacity)
                    }
                };
                *capacity = 0;
                *large_pages = false;
                result.map_err(|e| Error::io("release virtual region", e))?;
                true
            }
            Store::ComTask { len } => {
                *len = 0;
                unsafe { task_mem::free(ptr) }
            }
            Store::NetworkApi { len } => {
                *len = 0;
                unsafe { net_buf::free(ptr) }
            }
        };
        if !released {
            return Err(Error::invalid_operation(format!(
                "release of a block unknown to the {} allocator",
                self.kind().name()
            )));
        }
        Ok(())
    }

    /// Size of the block at `ptr` as the allocator reports it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this store.
    pub unsafe fn query_size(&self, ptr: *mut u8) -> usize {
        match self {
            Store::Heap { heap } => unsafe { heap::size(*heap, ptr) }.unwrap_or(0),
            Store::Aligned { len, .. } | Store::ComTask { len } => *len,
            Store::Virtual { capacity, .. } => unsafe { virt::region_size(ptr, *capacity) },
            Store::NetworkApi { len } => unsafe { net_buf::size(ptr) }.unwrap_or(*len),
        }
    }

    /// Asks the allocator whether `ptr` is still a live block.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an address previously produced by this store.
    pub unsafe fn validate(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        match self {
            Store::Heap { heap } => unsafe { heap::validate(*heap, ptr) },
            Store::Aligned { heap, .. } => unsafe { heap::validate(*heap, origin_of(ptr)) },
            Store::Virtual { capacity, .. } => virt::is_mapped(ptr, *capacity),
            Store::ComTask { .. } => unsafe { task_mem::validate(ptr) },
            Store::NetworkApi { .. } => unsafe { net_buf::validate(ptr) },
        }
    }

    /// Rebuilds the store for memory adopted from a foreign owner.
    pub fn adopt(&mut self, ptr: *mut u8, len: usize) -> usize {
        match self {
            Store::Heap { heap } => unsafe { heap::size(*heap, ptr) }.unwrap_or(len),
            Store::Aligned { len: l, .. }
            | Store::ComTask { len: l }
            | Store::NetworkApi { len: l } => {
                *l = len;
                len
            }
            Store::Virtual { capacity, .. } => {
                *capacity = len;
                len
            }
        }
    }
}

fn refused(kind: StoreKind, size: usize) -> Error {
    log::warn!("{} allocator refused {size} bytes", kind.name());
    Error::allocation_failure(kind.name(), size)
}

/// Rounds `origin` up past a pointer-width slot to the next multiple of
/// `alignment`.
fn align_past_slot(origin: *mut u8, alignment: usize) -> *mut u8 {
    let base = origin as usize + SLOT;
    let aligned = (base + alignment - 1) & !(alignment - 1);
    origin.wrapping_add(aligned - origin as usize)
}

/// Reads the unaligned origin stored just before an aligned block.
///
/// # Safety
///
/// `ptr` must have been returned by an aligned allocation.
unsafe fn origin_of(ptr: *mut u8) -> *mut u8 {
    unsafe { (ptr as *const usize).sub(1).read_unaligned() as *mut u8 }
}

fn allocate_pages(
    size: usize,
    prefer_large_pages: bool,
) -> std::io::Result<(*mut u8, usize, bool)> {
    if prefer_large_pages {
        match virt::try_enable_large_pages().and_then(|_| virt::allocate_large_pages(size)) {
            Ok((ptr, capacity)) => return Ok((ptr, capacity, true)),
            Err(e) => log::debug!("large pages unavailable, falling back to regular pages: {e}"),
        }
    }
    virt::allocate(size).map(|(ptr, capacity)| (ptr, capacity, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_store(kind: StoreKind) -> Store {
        let options = BufferOptions::new(kind).with_alignment(64);
        Store::new(&options, heap::process_heap())
    }

    #[test]
    fn test_aligned_layout() {
        for alignment in [1usize, 2, 8, 64, 4096] {
            let options = BufferOptions::aligned(alignment);
            let mut store = Store::new(&options, heap::process_heap());
            let ptr = store.allocate(100, true).unwrap();
            assert_eq!(ptr as usize % alignment, 0);
            unsafe {
                let origin = origin_of(ptr);
                assert!((origin as usize) + SLOT <= ptr as usize);
                assert!(ptr as usize - origin as usize <= SLOT + alignment - 1);
                assert!(store.validate(ptr));
                assert_eq!(store.query_size(ptr), 100);
                store.release(ptr).unwrap();
            }
        }
    }

    #[test]
    fn test_reallocate_preserves_prefix() {
        for kind in [
            StoreKind::Heap,
            StoreKind::Aligned,
            StoreKind::Virtual,
            StoreKind::ComTask,
            StoreKind::NetworkApi,
        ] {
            let mut store = process_store(kind);
            let ptr = store.allocate(32, true).unwrap();
            unsafe {
                for i in 0..32 {
                    *ptr.add(i) = i as u8;
                }
                let ptr = store.reallocate(ptr, 32, 64, true).unwrap();
                let bytes = std::slice::from_raw_parts(ptr, 64);
                assert!((0..32).all(|i| bytes[i] == i as u8), "{kind:?}");
                assert!(bytes[32..].iter().all(|&b| b == 0), "{kind:?}");
                assert!(store.query_size(ptr) >= 64);
                store.release(ptr).unwrap();
            }
        }
    }

    #[test]
    fn test_virtual_reports_capacity() {
        let mut store = process_store(StoreKind::Virtual);
        let ptr = store.allocate(10, false).unwrap();
        let page_size = virt::get_page_size();
        unsafe {
            assert_eq!(store.query_size(ptr), page_size);
            store.release(ptr).unwrap();
        }
        assert!(matches!(store, Store::Virtual { capacity: 0, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_release_keeps_store() {
        let foreign_heap = heap::create(0, 0).unwrap();
        let mut store = process_store(StoreKind::NetworkApi);
        let ptr = store.allocate(32, true).unwrap();
        unsafe {
            // Not a network buffer, so releasing it as one is refused.
            let foreign = heap::alloc(foreign_heap, 32, true);
            assert!(!foreign.is_null());
            assert!(store.reallocate(foreign, 32, 64, true).is_err());
            assert!(matches!(store, Store::NetworkApi { len: 32 }));
            assert_eq!(store.query_size(ptr), 32);

            assert!(heap::free(foreign_heap, foreign));
            store.release(ptr).unwrap();
            heap::destroy(foreign_heap).unwrap();
        }
    }

    #[test]
    fn test_rebound_and_backing_store() {
        let custom = heap::create(0, 0).unwrap();
        let store = Store::new(&BufferOptions::heap(), custom);
        assert_eq!(store.backing_store(), BackingStore::CustomHeap);
        assert_eq!(store.resident_heap(), Some(custom));
        let moved = store.rebound(heap::process_heap());
        assert_eq!(moved.backing_store(), BackingStore::GeneralHeap);
        assert_eq!(process_store(StoreKind::Virtual).resident_heap(), None);
        unsafe { heap::destroy(custom).unwrap() };
    }
}
