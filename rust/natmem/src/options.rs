//! Creation options for heaps and buffers.

use serde::{Deserialize, Serialize};

/// The allocator family a buffer draws its memory from.
///
/// Fixed when the buffer is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    /// Blocks of the owning heap (the process heap or a custom heap).
    #[default]
    Heap,
    /// Over-allocated blocks of the owning heap, aligned to a power of two.
    Aligned,
    /// Whole pages mapped straight from the OS.
    Virtual,
    /// COM task memory.
    ComTask,
    /// Buffers of the network management API allocator.
    NetworkApi,
}

impl StoreKind {
    pub fn name(self) -> &'static str {
        match self {
            StoreKind::Heap => "heap",
            StoreKind::Aligned => "aligned",
            StoreKind::Virtual => "virtual",
            StoreKind::ComTask => "COM task",
            StoreKind::NetworkApi => "network API",
        }
    }
}

/// The backing store a live buffer reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackingStore {
    GeneralHeap,
    CustomHeap,
    Virtual,
    ComTask,
    NetworkApi,
    Aligned,
}

/// What happens to a buffer when the heap that owns it is closed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Teardown {
    /// Free the memory together with the heap and detach the handle.
    #[default]
    Cascade,
    /// Move the memory to the process heap and keep the handle usable.
    TransferOut,
}

/// The result of tearing down one buffer during a heap close.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeardownOutcome {
    /// The memory went away with the heap.
    Released,
    /// The contents now live outside the closed heap.
    Transferred,
    /// Transfer-out could not allocate a destination; the contents are gone.
    Lost,
}

/// Options for [`HeapRegistry::create`](crate::HeapRegistry::create).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapOptions {
    /// Bytes committed up front.
    pub initial_size: usize,
    /// Upper bound on the heap's size. Zero makes the heap growable.
    pub max_size: usize,
}

impl HeapOptions {
    pub fn new(initial_size: usize) -> HeapOptions {
        HeapOptions {
            initial_size,
            max_size: 0,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> HeapOptions {
        self.max_size = max_size;
        self
    }

    /// Bytes reported to the accountant as reserved while the heap is open.
    pub(crate) fn reservation(&self) -> u64 {
        if self.max_size != 0 {
            self.max_size as u64
        } else {
            self.initial_size as u64
        }
    }
}

/// Options for a new buffer.
///
/// `alignment` only applies to [`StoreKind::Aligned`] and
/// `prefer_large_pages` only to [`StoreKind::Virtual`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferOptions {
    pub kind: StoreKind,
    pub teardown: Teardown,
    pub alignment: usize,
    pub prefer_large_pages: bool,
    pub reports_pressure: bool,
    pub zero_on_grow: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions {
            kind: StoreKind::Heap,
            teardown: Teardown::Cascade,
            alignment: DEFAULT_ALIGNMENT,
            prefer_large_pages: false,
            reports_pressure: false,
            zero_on_grow: true,
        }
    }
}

pub const DEFAULT_ALIGNMENT: usize = 16;

impl BufferOptions {
    pub fn new(kind: StoreKind) -> BufferOptions {
        BufferOptions {
            kind,
            ..Default::default()
        }
    }

    pub fn heap() -> BufferOptions {
        BufferOptions::new(StoreKind::Heap)
    }

    pub fn aligned(alignment: usize) -> BufferOptions {
        BufferOptions::new(StoreKind::Aligned).with_alignment(alignment)
    }

    pub fn virtual_memory() -> BufferOptions {
        BufferOptions::new(StoreKind::Virtual)
    }

    pub fn com_task() -> BufferOptions {
        BufferOptions::new(StoreKind::ComTask)
    }

    pub fn network_api() -> BufferOptions {
        BufferOptions::new(StoreKind::NetworkApi)
    }

    pub fn with_teardown(mut self, teardown: Teardown) -> BufferOptions {
        self.teardown = teardown;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> BufferOptions {
        self.alignment = alignment;
        self
    }

    pub fn with_large_pages(mut self, prefer_large_pages: bool) -> BufferOptions {
        self.prefer_large_pages = prefer_large_pages;
        self
    }

    pub fn with_pressure(mut self, reports_pressure: bool) -> BufferOptions {
        self.reports_pressure = reports_pressure;
        self
    }

    pub fn with_zero_on_grow(mut self, zero_on_grow: bool) -> BufferOptions {
        self.zero_on_grow = zero_on_grow;
        self
    }

    pub(crate) fn validate(&self) -> natmem_common::Result<()> {
        if self.kind == StoreKind::Aligned && !self.alignment.is_power_of_two() {
            return Err(natmem_common::Error::invalid_arg(
                "alignment",
                format!("{} is not a non-zero power of two", self.alignment),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_options_serde() {
        let options = BufferOptions::aligned(64)
            .with_teardown(Teardown::TransferOut)
            .with_pressure(true);
        let json = serde_json::to_string(&options).unwrap();
        let back: BufferOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);

        let partial: BufferOptions = serde_json::from_str(r#"{"kind":"Virtual"}"#).unwrap();
        assert_eq!(partial.kind, StoreKind::Virtual);
        assert!(partial.zero_on_grow);
        assert_eq!(partial.alignment, DEFAULT_ALIGNMENT);
    }

    #[test]
    fn test_heap_options_serde() {
        let options: HeapOptions = serde_json::from_str(r#"{"initial_size":4096}"#).unwrap();
        assert_eq!(options, HeapOptions::new(4096));
        assert_eq!(options.reservation(), 4096);
        assert_eq!(options.with_max_size(65536).reservation(), 65536);
    }

    #[test]
    fn test_alignment_validation() {
        for alignment in [1, 2, 4, 8, 16, 4096] {
            assert!(BufferOptions::aligned(alignment).validate().is_ok());
        }
        for alignment in [0, 3, 5, 12, 17, 100] {
            assert!(BufferOptions::aligned(alignment).validate().is_err());
        }
        // Alignment is ignored by other kinds.
        assert!(BufferOptions::heap().with_alignment(3).validate().is_ok());
    }
}
