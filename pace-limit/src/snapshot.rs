//! An atomically replaced, immutable state snapshot.
//!
//! State that must change as a whole (more than one word) lives behind a
//! pointer to a heap allocated snapshot. Writers never touch a published
//! snapshot: they build a replacement and compare-and-swap the pointer,
//! retrying against the fresh snapshot if another writer got there first.
//! Superseded snapshots are reclaimed through epoch based deferred
//! destruction, once no pinned reader can still see them.

use std::fmt;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use tracing::trace;

pub(crate) struct SnapshotCell<T> {
    current: Atomic<T>,
}

impl<T> SnapshotCell<T> {
    pub(crate) fn new(initial: T) -> Self {
        Self {
            current: Atomic::new(initial),
        }
    }

    /// Applies `transition` to the current snapshot and publishes the
    /// snapshot it returns, retrying until the swap wins.
    ///
    /// `transition` may run several times under contention and must be a
    /// pure function of the snapshot (plus whatever it samples, e.g. the
    /// clock). The value returned alongside the winning snapshot is handed
    /// back to the caller.
    pub(crate) fn update<F, R>(&self, mut transition: F) -> R
    where
        F: FnMut(&T) -> (T, R),
    {
        let guard = epoch::pin();
        let mut retries = 0usize;
        loop {
            let current = self.current.load(Ordering::Acquire, &guard);
            // SAFETY: the pointer is never null, and a snapshot is only
            // destroyed after every thread pinned at the time of its removal
            // has unpinned, which includes us.
            let snapshot = unsafe { current.deref() };
            let (next, output) = transition(snapshot);

            match self.current.compare_exchange(
                current,
                Owned::new(next),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if retries > 0 {
                        trace!(retries, "snapshot swap won after contention");
                    }
                    // SAFETY: `current` is no longer reachable through the
                    // cell, so only already pinned readers can hold it.
                    unsafe { guard.defer_destroy(current) };
                    return output;
                }
                Err(_) => retries += 1,
            }
        }
    }
}

impl<T: Clone> SnapshotCell<T> {
    /// Returns a copy of the current snapshot.
    pub(crate) fn load(&self) -> T {
        let guard = epoch::pin();
        let current = self.current.load(Ordering::Acquire, &guard);
        // SAFETY: see `update`.
        unsafe { current.deref() }.clone()
    }
}

impl<T> Drop for SnapshotCell<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no other thread can reach the cell.
        unsafe {
            let current = self.current.load(Ordering::Relaxed, epoch::unprotected());
            if !current.is_null() {
                drop(current.into_owned());
            }
        }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for SnapshotCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotCell").field(&self.load()).finish()
    }
}
