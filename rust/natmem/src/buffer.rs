//! The buffer handle.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use natmem_common::{Error, Result, result::verify_range, verify_arg};
use natmem_pressure::accountant;

use crate::dependents::{DependentKey, Link, LinkState};
use crate::options::{BackingStore, BufferOptions, StoreKind, Teardown, TeardownOutcome};
use crate::registry::HeapRegistry;
use crate::store::Store;

/// A heap registry's claim on a buffer.
pub(crate) struct Dependent {
    pub key: DependentKey,
    pub link: Arc<Link>,
}

/// An owned block of native memory drawn from one allocator family.
///
/// A buffer starts out unallocated and is sized with [`allocate`],
/// [`reallocate`] and [`free`]. It is move-only; [`try_clone`] makes an
/// independent copy. The memory is released on drop unless it was adopted
/// with `owns_memory == false`.
///
/// When the custom heap owning a buffer is closed, the buffer follows its
/// [`Teardown`] policy: it is either emptied and detached, or its contents
/// move to the process heap.
///
/// [`allocate`]: NativeBuffer::allocate
/// [`reallocate`]: NativeBuffer::reallocate
/// [`free`]: NativeBuffer::free
/// [`try_clone`]: NativeBuffer::try_clone
pub struct NativeBuffer {
    ptr: *mut u8,
    len: usize,
    store: Store,
    options: BufferOptions,
    heap: Option<HeapRegistry>,
    dependent: Option<Dependent>,
    owns_memory: bool,
    reported: u64,
    outcome: Option<TeardownOutcome>,
}

// The buffer exclusively owns its allocation; every mutation goes through
// `&mut self`.
unsafe impl Send for NativeBuffer {}

/// The allocation as it currently stands, including a teardown the buffer has
/// not yet observed.
struct View {
    ptr: *mut u8,
    len: usize,
    store: Store,
}

impl NativeBuffer {
    /// Creates an unallocated buffer on the process heap.
    pub fn new(options: BufferOptions) -> Result<NativeBuffer> {
        HeapRegistry::process_ref().create_buffer(options, None)
    }

    /// Creates a zero-filled buffer of `size` bytes on the process heap.
    pub fn with_size(options: BufferOptions, size: usize) -> Result<NativeBuffer> {
        let mut buffer = NativeBuffer::new(options)?;
        buffer.allocate(size, true)?;
        Ok(buffer)
    }

    /// Creates a buffer on the process heap holding a copy of `bytes`.
    pub fn from_bytes(options: BufferOptions, bytes: &[u8]) -> Result<NativeBuffer> {
        let mut buffer = NativeBuffer::new(options)?;
        buffer.copy_from_slice(bytes)?;
        Ok(buffer)
    }

    pub(crate) fn bound(
        heap: HeapRegistry,
        store: Store,
        options: BufferOptions,
        dependent: Option<Dependent>,
    ) -> NativeBuffer {
        NativeBuffer {
            ptr: std::ptr::null_mut(),
            len: 0,
            store,
            options,
            heap: Some(heap),
            dependent,
            owns_memory: true,
            reported: 0,
            outcome: None,
        }
    }

    /// Adopts memory produced by the allocator named in `options.kind`.
    ///
    /// For virtual memory `len` must be the committed capacity; for the heap
    /// kinds the allocator's own size query takes precedence over `len`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of the process-heap flavor of that
    /// allocator, valid for `len` bytes. When `owns_memory` is `true` the
    /// buffer frees it, so no one else may.
    pub unsafe fn from_raw_parts(
        ptr: *mut u8,
        len: usize,
        options: BufferOptions,
        owns_memory: bool,
    ) -> Result<NativeBuffer> {
        let mut buffer = NativeBuffer::new(options)?;
        if !ptr.is_null() {
            buffer.ptr = ptr;
            buffer.len = buffer.store.adopt(ptr, len);
        }
        buffer.owns_memory = owns_memory;
        buffer.report_pressure();
        Ok(buffer)
    }

    /// Releases the allocation to the caller without freeing it.
    ///
    /// Returns the address and size; the caller becomes responsible for
    /// freeing the block through the allocator that produced it.
    pub fn into_raw_parts(mut self) -> (*mut u8, usize) {
        self.sync();
        let parts = (self.ptr, self.len);
        self.ptr = std::ptr::null_mut();
        self.len = 0;
        (parts.0, parts.1)
    }

    /// Allocates `size` bytes. Succeeds without change if the buffer already
    /// has that size, and resizes it if it has another.
    pub fn allocate(&mut self, size: usize, zero: bool) -> Result<()> {
        self.sync();
        verify_arg!(size, size > 0);
        if !self.ptr.is_null() {
            if size == self.len {
                return Ok(());
            }
            return self.reallocate(size);
        }
        self.ensure_attached("allocate")?;
        let ptr = self.store.allocate(size, zero)?;
        self.install(ptr);
        Ok(())
    }

    /// Resizes the buffer, preserving the common prefix.
    ///
    /// An unallocated buffer is allocated zeroed; `new_size == 0` frees it.
    /// Growth is zero-filled when the buffer was created with `zero_on_grow`.
    pub fn reallocate(&mut self, new_size: usize) -> Result<()> {
        self.sync();
        if self.ptr.is_null() {
            if new_size == 0 {
                return Ok(());
            }
            return self.allocate(new_size, true);
        }
        if new_size == 0 {
            return self.free();
        }
        if new_size == self.len {
            return Ok(());
        }
        if !self.owns_memory {
            return Err(Error::invalid_operation(
                "reallocate of memory the buffer does not own",
            ));
        }
        let ptr = unsafe {
            self.store
                .reallocate(self.ptr, self.len, new_size, self.options.zero_on_grow)?
        };
        self.install(ptr);
        Ok(())
    }

    /// Releases the allocation. Freeing an unallocated buffer is a no-op.
    ///
    /// Memory the buffer does not own is only forgotten.
    pub fn free(&mut self) -> Result<()> {
        self.sync();
        if self.ptr.is_null() {
            return Ok(());
        }
        let ptr = std::mem::replace(&mut self.ptr, std::ptr::null_mut());
        let result = if self.owns_memory {
            unsafe { self.store.release(ptr) }
        } else {
            self.owns_memory = true;
            Ok(())
        };
        self.len = 0;
        self.publish();
        self.report_pressure();
        result
    }

    /// Current size in bytes, as reported by the allocator.
    pub fn size(&self) -> u64 {
        self.view().len as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.view().len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_allocated(&self) -> bool {
        !self.view().ptr.is_null()
    }

    /// Asks the allocator whether the buffer still refers to a live block.
    pub fn validate(&self) -> bool {
        let view = self.view();
        unsafe { view.store.validate(view.ptr) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.view().ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.sync();
        self.ptr
    }

    pub fn as_bytes(&self) -> &[u8] {
        let view = self.view();
        if view.ptr.is_null() {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(view.ptr, view.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.sync();
        if self.ptr.is_null() {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let bytes = self.as_bytes();
        verify_range(offset as u64, len as u64, bytes.len() as u64)?;
        Ok(&bytes[offset..offset + len])
    }

    /// Returns a mutable view of `len` bytes starting at `offset`.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let bytes = self.as_bytes_mut();
        verify_range(offset as u64, len as u64, bytes.len() as u64)?;
        Ok(&mut bytes[offset..offset + len])
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.bytes_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Sets every byte of the buffer to `value`.
    pub fn fill(&mut self, value: u8) {
        self.as_bytes_mut().fill(value);
    }

    /// Makes an independent copy on the same heap.
    pub fn try_clone(&self) -> Result<NativeBuffer> {
        let heap = self.heap().unwrap_or(HeapRegistry::process_ref());
        heap.create_buffer(self.options, Some(self))
    }

    /// CRC-32 of the buffer contents.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(self.as_bytes())
    }

    pub fn kind(&self) -> StoreKind {
        self.options.kind
    }

    pub fn backing_store(&self) -> BackingStore {
        self.view().store.backing_store()
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    pub fn teardown(&self) -> Teardown {
        self.options.teardown
    }

    pub fn owns_memory(&self) -> bool {
        self.owns_memory
    }

    pub fn reports_pressure(&self) -> bool {
        self.options.reports_pressure
    }

    /// The heap the buffer allocates from, or `None` once a cascading close
    /// has detached it.
    pub fn heap(&self) -> Option<&HeapRegistry> {
        match self.pending_outcome() {
            Some(TeardownOutcome::Released) => None,
            Some(_) => Some(HeapRegistry::process_ref()),
            None => self.heap.as_ref(),
        }
    }

    /// How the buffer fared when its owning heap was closed, if it was.
    pub fn teardown_outcome(&self) -> Option<TeardownOutcome> {
        self.pending_outcome().or(self.outcome)
    }

    fn pending_outcome(&self) -> Option<TeardownOutcome> {
        let dependent = self.dependent.as_ref()?;
        if !dependent.link.is_pending() {
            return None;
        }
        dependent.link.lock().outcome
    }

    fn view(&self) -> View {
        if let Some(dependent) = &self.dependent {
            if dependent.link.is_pending() {
                let state = dependent.link.lock();
                let live = state.outcome == Some(TeardownOutcome::Transferred);
                return View {
                    ptr: if live { state.ptr } else { std::ptr::null_mut() },
                    len: if live { state.len } else { 0 },
                    store: state.store,
                };
            }
        }
        View {
            ptr: self.ptr,
            len: self.len,
            store: self.store,
        }
    }

    /// Picks up a teardown recorded by the owning heap.
    fn sync(&mut self) {
        let pending = self
            .dependent
            .as_ref()
            .is_some_and(|dependent| dependent.link.is_pending());
        if !pending {
            return;
        }
        if let Some(dependent) = self.dependent.take() {
            let state = dependent.link.lock();
            self.apply_outcome(&state);
        }
    }

    fn apply_outcome(&mut self, state: &LinkState) {
        let Some(outcome) = state.outcome else {
            return;
        };
        self.outcome = Some(outcome);
        self.ptr = state.ptr;
        self.len = state.len;
        self.store = state.store;
        self.heap = match outcome {
            TeardownOutcome::Released => None,
            TeardownOutcome::Transferred | TeardownOutcome::Lost => Some(HeapRegistry::process()),
        };
        self.report_pressure();
    }

    fn ensure_attached(&self, operation: &str) -> Result<()> {
        match &self.heap {
            Some(_) => Ok(()),
            None => Err(Error::invalid_operation(format!(
                "{operation} on a buffer detached from its closed heap"
            ))),
        }
    }

    fn install(&mut self, ptr: *mut u8) {
        self.ptr = ptr;
        self.len = unsafe { self.store.query_size(ptr) };
        self.publish();
        self.report_pressure();
    }

    /// Shares the current allocation descriptor with the owning heap.
    fn publish(&self) {
        if let Some(dependent) = &self.dependent {
            let mut state = dependent.link.lock();
            state.ptr = self.ptr;
            state.len = self.len;
            state.store = self.store;
            state.owns_memory = self.owns_memory;
        }
    }

    fn report_pressure(&mut self) {
        if !self.options.reports_pressure {
            return;
        }
        let current = if self.owns_memory { self.len as u64 } else { 0 };
        accountant().adjust_pressure(self.reported, current);
        self.reported = current;
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        if let Some(dependent) = self.dependent.take() {
            let torn_down = {
                let mut state = dependent.link.lock();
                state.detached = true;
                if state.outcome.is_some() {
                    self.apply_outcome(&state);
                    true
                } else {
                    false
                }
            };
            if !torn_down {
                if let Some(heap) = &self.heap {
                    heap.unregister(dependent.key);
                }
            }
        }
        if !self.ptr.is_null() && self.owns_memory {
            if let Err(e) = unsafe { self.store.release(self.ptr) } {
                log::warn!("failed to release {} buffer: {e}", self.kind().name());
            }
        }
        self.ptr = std::ptr::null_mut();
        self.len = 0;
        self.report_pressure();
    }
}

impl PartialEq for NativeBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.size() == other.size() && self.checksum() == other.checksum()
    }
}

impl Eq for NativeBuffer {}

impl Hash for NativeBuffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.size());
        state.write_u32(self.checksum());
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view();
        f.debug_struct("NativeBuffer")
            .field("ptr", &view.ptr)
            .field("len", &view.len)
            .field("backing_store", &view.store.backing_store())
            .field("teardown", &self.options.teardown)
            .field("owns_memory", &self.owns_memory)
            .finish()
    }
}
