// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Small synchronization helpers shared by connections and acceptors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{TransportError, TransportResult};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission slot for an operation that may have at most one instance
/// outstanding.
#[derive(Debug)]
pub(crate) struct OpSlot {
    operation: &'static str,
    taken: AtomicBool,
}

impl OpSlot {
    pub const fn new(operation: &'static str) -> Self {
        Self {
            operation,
            taken: AtomicBool::new(false),
        }
    }

    /// Claim the slot, or fail with `Busy` if it is already held.
    pub fn try_acquire(&self) -> TransportResult<SlotGuard<'_>> {
        if self
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::Busy {
                operation: self.operation,
            });
        }
        Ok(SlotGuard { slot: self })
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }
}

/// Releases its slot on drop, including when a pending future is dropped.
#[derive(Debug)]
pub(crate) struct SlotGuard<'a> {
    slot: &'a OpSlot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.taken.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_slot_is_exclusive() {
        let slot = OpSlot::new("receive");
        let guard = slot.try_acquire().unwrap();

        let err = slot.try_acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.to_string().contains("receive"));

        drop(guard);
        assert!(slot.try_acquire().is_ok());
    }
}
