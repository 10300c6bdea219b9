//! Per-group locking (§5).
//!
//! `N_LOCKS` shared `spin::Mutex`es; group `g` takes the lock at slot
//! `g mod N_LOCKS`. This bounds lock-array memory to a constant regardless
//! of `num_groups`, at the cost of false sharing between co-resident
//! groups that hash to the same slot — the tradeoff this design
//! deliberately keeps (see DESIGN.md); a host with memory to spare may
//! give every group its own lock instead by setting `N_LOCKS` to
//! `num_groups`.

use crate::geometry::N_LOCKS;
use crate::ids::GroupNumber;
use spin::Mutex;

/// The mount's per-group lock array. Readers of a group's refmap/bitmap
/// never take these locks; only allocator/deallocator mutation does.
pub struct GroupLocks {
    locks: [Mutex<()>; N_LOCKS],
}

impl Default for GroupLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: core::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Runs `f` while holding the lock for `group`.
    ///
    /// Lock ordering across two groups is ascending by group number: the
    /// allocator only ever takes one group lock at a time, so this bound is
    /// trivially satisfied as long as callers never nest two `with` calls
    /// for different groups.
    pub fn with<T>(&self, group: GroupNumber, f: impl FnOnce() -> T) -> T {
        let slot = (group.0 as usize) % self.locks.len();
        let _guard = self.locks[slot].lock();
        f()
    }
}
