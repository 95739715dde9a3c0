//! Device memory budget tracking.
//!
//! Every [`Buffer`](crate::memory::Buffer) charges its allocation size against
//! the [`MemoryBudget`] owned by its context before asking the driver for
//! memory. The charge is held as a [`Reservation`] and returned when the
//! reservation drops, so the running total is back where it started once all
//! buffers are gone.

use crate::error::{ComputeError, Result};
use parking_lot::Mutex;

/// Running total of device memory handed out through one context.
#[derive(Debug, Default)]
pub struct MemoryBudget {
    allocated: Mutex<u64>,
}

impl MemoryBudget {
    /// Create an empty budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently reserved.
    pub fn allocated(&self) -> u64 {
        *self.allocated.lock()
    }

    /// Charge `requested` bytes against a heap of `capacity` bytes.
    ///
    /// Fails with [`ComputeError::OutOfMemory`] if the new total would exceed
    /// `capacity`; the total is left unchanged in that case.
    pub fn reserve(&self, requested: u64, capacity: u64) -> Result<Reservation<'_>> {
        let mut allocated = self.allocated.lock();
        let total = allocated.saturating_add(requested);

        if total > capacity {
            return Err(ComputeError::OutOfMemory {
                requested,
                allocated: *allocated,
                capacity,
                overage: total - capacity,
            });
        }

        *allocated = total;
        Ok(Reservation {
            budget: self,
            bytes: requested,
        })
    }

    /// Reserve, then run `allocate` only if the reservation succeeded.
    ///
    /// If `allocate` fails the reservation is released before the error is
    /// returned.
    pub fn allocate_with<T, F>(
        &self,
        requested: u64,
        capacity: u64,
        allocate: F,
    ) -> Result<(Reservation<'_>, T)>
    where
        F: FnOnce() -> Result<T>,
    {
        let reservation = self.reserve(requested, capacity)?;
        let value = allocate()?;
        Ok((reservation, value))
    }

    fn release(&self, bytes: u64) {
        let mut allocated = self.allocated.lock();
        *allocated = allocated.saturating_sub(bytes);
    }
}

/// Bytes charged against a [`MemoryBudget`], returned on drop.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a MemoryBudget,
    bytes: u64,
}

impl Reservation<'_> {
    /// Size of the charge in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}
