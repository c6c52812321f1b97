//! Subscription Guard
//!
//! Single-entry subscription changes are internally synchronized by the
//! tables and may run side by side. Producing a full subscription snapshot
//! for a peer must not interleave with any of them. The guard therefore
//! admits many mutators at once, or one snapshot taker alone.
//!
//! Hold a guard only around the table call itself. Message delivery can
//! re-enter subscription management, so it must never run under a guard.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared/exclusive lock between subscription mutations and snapshots
#[derive(Debug, Default)]
pub struct SharedExclusiveLock {
    lock: RwLock<()>,
}

/// Held while mutating a subscription table; shared with other mutators
#[must_use = "the mutation is only protected while the guard is held"]
pub struct ConcurrentMutationGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Held while copying a full subscription table; excludes all mutators
#[must_use = "the snapshot is only protected while the guard is held"]
pub struct ExclusiveSnapshotGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl SharedExclusiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_for_concurrent_mutation(&self) -> ConcurrentMutationGuard<'_> {
        ConcurrentMutationGuard {
            _guard: self.lock.read(),
        }
    }

    pub fn acquire_for_exclusive_snapshot(&self) -> ExclusiveSnapshotGuard<'_> {
        ExclusiveSnapshotGuard {
            _guard: self.lock.write(),
        }
    }
}
