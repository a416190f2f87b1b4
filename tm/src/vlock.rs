// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The version lock is a special type of word sized spin lock, that
//! contains a single bit to indicate a lock, while using the rest
//! of the bits for versioning.

use crate::error::TxError;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// A [`VersionLock`] combines a try-only lock with a version counter in a
/// single atomic word. The lowest bit holds the lock state, the remaining
/// bits hold the version, so one atomic load observes both as a consistent
/// pair. The version never decreases; only the current lock holder may
/// store a new one.
#[derive(Default, Clone)]
pub struct VersionLock {
    atomic: Arc<AtomicUsize>,
}

impl VersionLock {
    /// Creates a new unlocked [`VersionLock`] with the desired version
    pub fn new(version: usize) -> Self {
        Self {
            atomic: Arc::new(AtomicUsize::new(version << shift_by())),
        }
    }

    /// Tries to acquire the lock and returns `Ok(())` on success.
    ///
    /// There is no waiting: if the lock is held, or another thread wins the
    /// race for it, an error is returned immediately.
    ///
    /// # Example
    /// ```
    /// use stronghold_tm::vlock::VersionLock;
    /// let lock = VersionLock::default();
    /// lock.try_lock().expect("failed to acquire lock");
    /// assert!(lock.is_locked());
    /// ```
    pub fn try_lock(&self) -> Result<(), TxError> {
        let observed = self.atomic.load(Ordering::SeqCst);
        if observed & mask() != 0 {
            return Err(TxError::LockPresent);
        }

        self.atomic
            .compare_exchange(observed, observed | mask(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| TxError::LockPresent)
    }

    /// Clears the lock bit and keeps the version. Only the current holder
    /// may call this.
    pub fn release(&self) {
        self.atomic.fetch_and(!mask(), Ordering::SeqCst);
    }

    /// Stores `version` and clears the lock bit in one atomic store, so a
    /// reader that observes the cleared bit also observes the new version.
    /// Only the current holder may call this.
    pub fn release_set(&self, version: usize) {
        self.atomic.store(version << shift_by(), Ordering::SeqCst);
    }

    /// Atomically samples the `(version, locked)` pair.
    pub fn sample(&self) -> (usize, bool) {
        let n = self.atomic.load(Ordering::SeqCst);
        (n >> shift_by(), n & mask() != 0)
    }

    /// Returns the stored version
    pub fn version(&self) -> usize {
        self.atomic.load(Ordering::SeqCst) >> shift_by()
    }

    /// Returns `true`, if the lock is present
    pub fn is_locked(&self) -> bool {
        self.atomic.load(Ordering::SeqCst) & mask() != 0
    }
}

/// An atomic version counter with a simpler interface. This type is used
/// for the global clock of a transactional memory region.
#[derive(Clone, Default)]
pub struct VersionClock {
    atomic: Arc<AtomicUsize>,
}

impl VersionClock {
    pub fn new(version: usize) -> Self {
        Self {
            atomic: Arc::new(AtomicUsize::new(version)),
        }
    }

    /// Atomically increments the clock and returns the incremented value
    pub fn increment(&self) -> usize {
        self.atomic.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the current version
    pub fn version(&self) -> usize {
        self.atomic.load(Ordering::SeqCst)
    }
}

/// Returns the number of bits the version is shifted by
const fn shift_by() -> usize {
    1
}

/// Returns a bitmask filtering the lock bit
const fn mask() -> usize {
    1
}
