use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe byte tally that can be credited and debited by multiple
/// threads, never dropping below zero.
pub struct Tally(AtomicU64);

impl Tally {
    /// Creates a new `Tally` with the given initial amount.
    pub const fn new(amount: u64) -> Tally {
        Tally(AtomicU64::new(amount))
    }

    /// Adds `amount` to the tally.
    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Release);
    }

    /// Subtracts up to `amount` from the tally, clamping at zero.
    ///
    /// Returns the amount that was actually subtracted. A shortfall means some
    /// caller removed more than it had added.
    pub fn remove(&self, amount: u64) -> u64 {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let taken = current.min(amount);
            match self.0.compare_exchange_weak(
                current,
                current - taken,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return taken,
                Err(updated) => current = updated,
            }
        }
    }

    /// Returns the tally value (most likely stale by the time it is observed by the caller).
    pub fn read(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Drains the tally, setting its value to 0 and returning the previous amount.
    pub fn drain(&mut self) -> u64 {
        std::mem::replace(self.0.get_mut(), 0)
    }
}
