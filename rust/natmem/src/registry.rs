//! Native heaps and the buffers that depend on them.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use natmem_common::{Error, Result};
use natmem_pressure::accountant;
use natmem_sys::{HeapHandle, heap};
use serde::{Deserialize, Serialize};

use crate::buffer::{Dependent, NativeBuffer};
use crate::dependents::{DependentArena, DependentKey, Link, LinkState};
use crate::options::{BufferOptions, HeapOptions, Teardown, TeardownOutcome};
use crate::store::Store;

/// A shared handle to a native heap.
///
/// Cloning is cheap; all clones refer to the same heap. A custom heap is
/// destroyed by [`HeapRegistry::close`] or when the last clone is dropped.
/// Buffers allocated from a registry hold a clone of it, so an implicit close
/// only ever happens once every dependent buffer is gone.
#[derive(Clone)]
pub struct HeapRegistry(Arc<HeapInner>);

struct HeapInner {
    heap: HeapHandle,
    initial_size: usize,
    max_size: usize,
    is_process_heap: bool,
    reservation: u64,
    state: Mutex<RegistryState>,
}

struct RegistryState {
    open: bool,
    dependents: DependentArena,
}

/// Region accounting snapshot returned by [`HeapRegistry::measure`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapMeasurement {
    pub committed: u64,
    pub uncommitted: u64,
    pub total: u64,
}

/// Per-outcome counts of the dependents torn down by a close.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSummary {
    pub released: usize,
    pub transferred: usize,
    pub lost: usize,
}

impl CloseSummary {
    fn record(&mut self, outcome: TeardownOutcome) {
        match outcome {
            TeardownOutcome::Released => self.released += 1,
            TeardownOutcome::Transferred => self.transferred += 1,
            TeardownOutcome::Lost => self.lost += 1,
        }
    }
}

impl HeapRegistry {
    /// Creates a fresh native heap.
    pub fn create(options: HeapOptions) -> Result<HeapRegistry> {
        let handle = heap::create(options.initial_size, options.max_size)
            .map_err(|e| Error::io("create heap", e))?;
        log::debug!(
            "created heap {:#x} (initial {} bytes, max {} bytes)",
            handle.as_raw(),
            options.initial_size,
            options.max_size
        );
        Ok(HeapRegistry::wrap(handle, options))
    }

    /// Takes ownership of an existing native heap. The registry destroys it on
    /// close.
    ///
    /// # Safety
    ///
    /// `handle` must be a live heap that nothing else destroys, and
    /// `initial_size`/`max_size` must describe how it was created.
    pub unsafe fn from_raw_heap(
        handle: HeapHandle,
        initial_size: usize,
        max_size: usize,
    ) -> Result<HeapRegistry> {
        if handle == heap::process_heap() {
            return Err(Error::invalid_arg(
                "handle",
                "the process heap is only available through HeapRegistry::process",
            ));
        }
        let options = HeapOptions::new(initial_size).with_max_size(max_size);
        Ok(HeapRegistry::wrap(handle, options))
    }

    fn wrap(handle: HeapHandle, options: HeapOptions) -> HeapRegistry {
        let reservation = options.reservation();
        accountant().reserve(reservation);
        HeapRegistry(Arc::new(HeapInner {
            heap: handle,
            initial_size: options.initial_size,
            max_size: options.max_size,
            is_process_heap: false,
            reservation,
            state: Mutex::new(RegistryState {
                open: true,
                dependents: DependentArena::default(),
            }),
        }))
    }

    /// The registry wrapping the process heap. It is never closed.
    pub fn process() -> HeapRegistry {
        HeapRegistry::process_ref().clone()
    }

    pub(crate) fn process_ref() -> &'static HeapRegistry {
        static PROCESS: OnceLock<HeapRegistry> = OnceLock::new();
        PROCESS.get_or_init(|| {
            HeapRegistry(Arc::new(HeapInner {
                heap: heap::process_heap(),
                initial_size: 0,
                max_size: 0,
                is_process_heap: true,
                reservation: 0,
                state: Mutex::new(RegistryState {
                    open: true,
                    dependents: DependentArena::default(),
                }),
            }))
        })
    }

    /// Creates an unallocated buffer bound to this heap, optionally filled
    /// with a copy of `copy_from`.
    ///
    /// Buffers of the process heap are not tracked as dependents, since that
    /// heap never closes.
    pub fn create_buffer(
        &self,
        options: BufferOptions,
        copy_from: Option<&NativeBuffer>,
    ) -> Result<NativeBuffer> {
        options.validate()?;
        let store = Store::new(&options, self.0.heap);
        let dependent = {
            let mut state = self.0.lock();
            if !state.open {
                return Err(Error::invalid_operation("create_buffer on a closed heap"));
            }
            (!self.0.is_process_heap).then(|| {
                let link = Link::new(store, options.teardown);
                let key = state.dependents.insert(link.clone());
                Dependent { key, link }
            })
        };

        let mut buffer = NativeBuffer::bound(self.clone(), store, options, dependent);
        if let Some(source) = copy_from {
            let bytes = source.as_bytes();
            if !bytes.is_empty() {
                buffer.allocate(bytes.len(), false)?;
                buffer.as_bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(buffer)
    }

    /// Tears down every live dependent according to its policy, then destroys
    /// the native heap.
    ///
    /// Closing an already closed registry returns an empty summary; closing
    /// the process registry fails with `InvalidOperation`.
    ///
    /// # Safety
    ///
    /// Teardown releases or moves the memory of dependent buffers behind their
    /// backs. For the duration of the call no dependent buffer may be in use
    /// on another thread, and no slice or raw pointer obtained from a
    /// dependent buffer may be used afterwards.
    pub unsafe fn close(&self) -> Result<CloseSummary> {
        if self.0.is_process_heap {
            return Err(Error::invalid_operation("close of the process heap"));
        }
        unsafe { self.0.shutdown() }
    }

    /// Reports committed and uncommitted bytes of the heap's first region.
    ///
    /// The readout is advisory and may be outdated as soon as it returns.
    pub fn measure(&self) -> Result<HeapMeasurement> {
        let state = self.0.lock();
        if !state.open {
            return Err(Error::invalid_operation("measure on a closed heap"));
        }
        let region = unsafe { heap::first_region(self.0.heap) }
            .map_err(|e| Error::io("walk heap", e))?
            .unwrap_or_default();
        drop(state);
        let committed = region.committed as u64;
        let uncommitted = region.uncommitted as u64;
        Ok(HeapMeasurement {
            committed,
            uncommitted,
            total: committed + uncommitted,
        })
    }

    /// Number of live buffers that depend on this heap.
    pub fn dependent_count(&self) -> usize {
        self.0.lock().dependents.len()
    }

    pub fn is_open(&self) -> bool {
        self.0.lock().open
    }

    pub fn is_process_heap(&self) -> bool {
        self.0.is_process_heap
    }

    pub fn initial_size(&self) -> usize {
        self.0.initial_size
    }

    pub fn max_size(&self) -> usize {
        self.0.max_size
    }

    pub fn handle(&self) -> HeapHandle {
        self.0.heap
    }

    /// Returns `true` if both registries refer to the same heap.
    pub fn same_heap(&self, other: &HeapRegistry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn unregister(&self, key: DependentKey) {
        self.0.lock().dependents.remove(key);
    }
}

impl std::fmt::Debug for HeapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegistry")
            .field("heap", &format_args!("{:#x}", self.0.heap.as_raw()))
            .field("is_process_heap", &self.0.is_process_heap)
            .field("initial_size", &self.0.initial_size)
            .field("max_size", &self.0.max_size)
            .finish_non_exhaustive()
    }
}

impl HeapInner {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Safety
    ///
    /// See [`HeapRegistry::close`].
    unsafe fn shutdown(&self) -> Result<CloseSummary> {
        let links = {
            let mut state = self.lock();
            if !state.open {
                return Ok(CloseSummary::default());
            }
            state.open = false;
            state.dependents.drain()
        };

        let mut summary = CloseSummary::default();
        for link in links {
            if let Some(outcome) = unsafe { self.tear_down(&link) } {
                summary.record(outcome);
            }
        }

        let destroyed = unsafe { heap::destroy(self.heap) };
        accountant().release(self.reservation);
        log::debug!(
            "closed heap {:#x}: {} released, {} transferred, {} lost",
            self.heap.as_raw(),
            summary.released,
            summary.transferred,
            summary.lost
        );
        destroyed.map_err(|e| Error::io("destroy heap", e))?;
        Ok(summary)
    }

    unsafe fn tear_down(&self, link: &Link) -> Option<TeardownOutcome> {
        let mut state = link.lock();
        if state.detached {
            return None;
        }
        let outcome = match state.teardown {
            Teardown::Cascade => {
                unsafe { self.release_block(&mut state) };
                TeardownOutcome::Released
            }
            Teardown::TransferOut => unsafe { self.transfer_out(&mut state) },
        };
        link.set_outcome(&mut state, outcome);
        Some(outcome)
    }

    unsafe fn release_block(&self, state: &mut LinkState) {
        if state.owns_memory && !state.ptr.is_null() {
            if let Err(e) = unsafe { state.store.release(state.ptr) } {
                log::warn!("failed to release dependent of heap {:#x}: {e}", self.heap.as_raw());
            }
        }
        state.ptr = std::ptr::null_mut();
        state.len = 0;
    }

    unsafe fn transfer_out(&self, state: &mut LinkState) -> TeardownOutcome {
        if state.store.resident_heap().is_none() {
            // Not heap memory; it outlives the heap as is.
            return TeardownOutcome::Transferred;
        }
        let mut target = state.store.rebound(heap::process_heap());
        if state.ptr.is_null() {
            state.store = target;
            return TeardownOutcome::Transferred;
        }
        if !state.owns_memory {
            unsafe { self.release_block(state) };
            state.store = target;
            return TeardownOutcome::Released;
        }

        let len = state.len;
        match target.allocate(len, false) {
            Ok(new_ptr) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(state.ptr, new_ptr, len);
                    self.release_block(state);
                }
                state.ptr = new_ptr;
                state.len = len;
                state.store = target;
                log::debug!(
                    "transferred {len} bytes out of heap {:#x}",
                    self.heap.as_raw()
                );
                TeardownOutcome::Transferred
            }
            Err(e) => {
                unsafe { self.release_block(state) };
                state.store = target;
                log::error!(
                    "transfer of {len} bytes out of heap {:#x} failed, contents lost: {e}",
                    self.heap.as_raw()
                );
                TeardownOutcome::Lost
            }
        }
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        if self.is_process_heap {
            return;
        }
        // Every dependent holds a registry clone, so none is left here.
        if let Err(e) = unsafe { self.shutdown() } {
            log::error!("failed to close heap {:#x}: {e}", self.heap.as_raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StoreKind;

    #[test]
    fn test_process_registry() {
        let process = HeapRegistry::process();
        assert!(process.is_process_heap());
        assert!(process.same_heap(&HeapRegistry::process()));
        assert!(unsafe { process.close() }.is_err());
        assert!(process.is_open());

        let buffer = process.create_buffer(BufferOptions::heap(), None).unwrap();
        assert_eq!(process.dependent_count(), 0);
        drop(buffer);
    }

    #[test]
    fn test_dependents_are_tracked() {
        let registry = HeapRegistry::create(HeapOptions::new(4096)).unwrap();
        let a = registry.create_buffer(BufferOptions::heap(), None).unwrap();
        let b = registry
            .create_buffer(BufferOptions::new(StoreKind::Virtual), None)
            .unwrap();
        assert_eq!(registry.dependent_count(), 2);
        drop(a);
        assert_eq!(registry.dependent_count(), 1);
        drop(b);
        assert_eq!(registry.dependent_count(), 0);
    }

    #[test]
    fn test_closed_registry_refuses_buffers() {
        let registry = HeapRegistry::create(HeapOptions::default()).unwrap();
        let summary = unsafe { registry.close() }.unwrap();
        assert_eq!(summary, CloseSummary::default());
        assert!(!registry.is_open());
        assert!(registry.create_buffer(BufferOptions::heap(), None).is_err());
        assert!(registry.measure().is_err());
        assert_eq!(unsafe { registry.close() }.unwrap(), CloseSummary::default());
    }

    #[test]
    fn test_from_raw_heap_rejects_process_heap() {
        let result = unsafe { HeapRegistry::from_raw_heap(heap::process_heap(), 0, 0) };
        assert!(result.is_err());

        let handle = heap::create(0, 0).unwrap();
        let registry = unsafe { HeapRegistry::from_raw_heap(handle, 0, 0) }.unwrap();
        assert_eq!(registry.handle(), handle);
        assert!(!registry.is_process_heap());
    }

    #[test]
    fn test_measure() {
        let registry = HeapRegistry::create(HeapOptions::new(4096).with_max_size(1 << 20)).unwrap();
        let m = registry.measure().unwrap();
        assert_eq!(m.total, m.committed + m.uncommitted);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(serde_json::from_str::<HeapMeasurement>(&json).unwrap(), m);
    }
}
