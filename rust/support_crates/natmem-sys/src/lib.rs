//! Thin facade over the native allocators backing natmem buffers.
//!
//! | Module       | Windows                                   | Unix                                  |
//! | -------------| ------------------------------------------| --------------------------------------|
//! | [`heap`]     | `HeapCreate`/`HeapAlloc`/`HeapWalk`        | tracked `malloc` blocks per heap      |
//! | [`virt`]     | `VirtualAlloc`/`VirtualQuery`              | anonymous `mmap`                      |
//! | [`task_mem`] | `CoTaskMemAlloc`/`CoTaskMemRealloc`        | process heap                          |
//! | [`net_buf`]  | `NetApiBufferAllocate`/`NetApiBufferSize`  | process heap                          |
//!
//! Every function here is a direct call-through: failures surface as null
//! pointers, `false` or `std::io::Error`, never as panics.

#[cfg_attr(unix, path = "heap_unix.rs")]
#[cfg_attr(windows, path = "heap_win.rs")]
pub mod heap;

#[cfg_attr(unix, path = "virt_unix.rs")]
#[cfg_attr(windows, path = "virt_win.rs")]
pub mod virt;

#[cfg_attr(unix, path = "task_mem_emulated.rs")]
#[cfg_attr(windows, path = "task_mem_win.rs")]
pub mod task_mem;

#[cfg_attr(unix, path = "net_buf_emulated.rs")]
#[cfg_attr(windows, path = "net_buf_win.rs")]
pub mod net_buf;


/// Opaque handle to a native heap.
///
/// On Windows this is the `HANDLE` returned by `GetProcessHeap`/`HeapCreate`;
/// elsewhere it addresses the facade's own heap bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapHandle(usize);

impl HeapHandle {
    /// Wraps a raw native heap handle.
    pub const fn from_raw(raw: usize) -> HeapHandle {
        HeapHandle(raw)
    }

    /// Returns the raw native heap handle.
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Sizes of the first region entry found while walking a heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionInfo {
    /// Bytes of the region currently backed by committed pages.
    pub committed: usize,
    /// Bytes of the region reserved but not yet committed.
    pub uncommitted: usize,
}

/// Rounds `n` up to the next multiple of `alignment` (a power of two).
#[inline]
pub(crate) fn round_up(n: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}
