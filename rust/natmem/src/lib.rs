//! Native memory buffers over interchangeable OS allocators.
//!
//! A [`NativeBuffer`] owns one block of raw memory drawn from a heap, aligned
//! heap blocks, virtual memory pages, COM task memory or the network API
//! allocator, and offers the same sizing, typed access, text and editing
//! operations whichever allocator produced it.
//!
//! Buffers are created from a [`HeapRegistry`]: either the process heap or a
//! custom heap. Closing a custom heap tears down the buffers that still
//! depend on it according to each buffer's [`Teardown`] policy.
//!
//! ```no_run
//! use natmem::{BufferOptions, HeapOptions, HeapRegistry, Teardown};
//!
//! let heap = HeapRegistry::create(HeapOptions::new(4096))?;
//! let options = BufferOptions::heap().with_teardown(Teardown::TransferOut);
//! let mut kept = heap.create_buffer(options, None)?;
//! kept.allocate(100, true)?;
//! kept.set_u64(0, 42)?;
//!
//! // No slices of `kept` are alive here.
//! unsafe { heap.close()? };
//! assert_eq!(kept.get_u64(0)?, 42);
//! # Ok::<(), natmem::Error>(())
//! ```

mod buffer;
mod dependents;
mod edit;
mod options;
mod registry;
mod store;
mod text;
mod typed;
mod values;

pub use buffer::NativeBuffer;
pub use natmem_common::{Error, ErrorKind, Result};
pub use natmem_sys::HeapHandle;
pub use options::{
    BackingStore, BufferOptions, DEFAULT_ALIGNMENT, HeapOptions, StoreKind, Teardown,
    TeardownOutcome,
};
pub use registry::{CloseSummary, HeapMeasurement, HeapRegistry};
pub use values::{Decimal128, Guid, TICKS_TILL_UNIX_TIME, Timestamp};
