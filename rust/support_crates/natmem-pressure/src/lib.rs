//! Process-wide accounting of unmanaged memory.
//!
//! Buffers that opt into pressure reporting credit their allocated size here,
//! and custom heaps credit the address space they reserve. There is no tracing
//! collector to inform, so the tallies exist purely for introspection: a host
//! can poll [`Accountant::outstanding`] and [`Accountant::reserved`] to see how
//! much memory lives outside the Rust allocator.

use tally::Tally;

pub mod tally;

/// Tracks outstanding buffer bytes and reserved heap bytes.
pub struct Accountant {
    outstanding: Tally,
    reserved: Tally,
}

impl Accountant {
    pub const fn new() -> Accountant {
        Accountant {
            outstanding: Tally::new(0),
            reserved: Tally::new(0),
        }
    }

    /// Records `bytes` of newly allocated buffer memory.
    pub fn add_pressure(&self, bytes: u64) {
        if bytes != 0 {
            self.outstanding.add(bytes);
        }
    }

    /// Records the release of `bytes` of buffer memory.
    pub fn remove_pressure(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let removed = self.outstanding.remove(bytes);
        if removed < bytes {
            log::warn!(
                "unbalanced pressure release: {bytes} bytes requested, {removed} outstanding"
            );
        }
    }

    /// Applies the difference between an old and a new buffer size.
    pub fn adjust_pressure(&self, old_bytes: u64, new_bytes: u64) {
        if new_bytes > old_bytes {
            self.add_pressure(new_bytes - old_bytes);
        } else {
            self.remove_pressure(old_bytes - new_bytes);
        }
    }

    /// Records address space reserved by a heap.
    pub fn reserve(&self, bytes: u64) {
        self.reserved.add(bytes);
    }

    /// Returns address space previously recorded with [`Accountant::reserve`].
    pub fn release(&self, bytes: u64) {
        self.reserved.remove(bytes);
    }

    /// Buffer bytes currently reported as allocated.
    ///
    /// **Note**: the value may be outdated in a concurrent environment.
    pub fn outstanding(&self) -> u64 {
        self.outstanding.read()
    }

    /// Heap bytes currently reported as reserved.
    pub fn reserved(&self) -> u64 {
        self.reserved.read()
    }
}

impl Default for Accountant {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the process-wide accountant.
pub fn accountant() -> &'static Accountant {
    static ACCOUNTANT: Accountant = Accountant::new();
    &ACCOUNTANT
}
