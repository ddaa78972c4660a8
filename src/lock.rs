#![forbid(unsafe_code)]

//! Per-hierarchy structural mutation lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::types::{HierarchyId, Result, TreeError};

/// Serializes structural mutations (child creation, reassignment, reconcile
/// writes) within a hierarchy.
///
/// Leases are released on drop, so every exit path of the holder, unwinding
/// included, frees the hierarchy.
#[derive(Clone, Default)]
pub struct TreeLock {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    held: Mutex<FxHashSet<HierarchyId>>,
    released: Condvar,
}

/// Snapshot of lock state for observability.
#[derive(Clone, Debug, Default)]
pub struct LockSnapshot {
    /// Hierarchies with an outstanding lease.
    pub held: Vec<HierarchyId>,
}

/// Proof that the caller holds a hierarchy's lock.
pub struct TreeLease {
    inner: Arc<Inner>,
    hierarchy: HierarchyId,
    acquired_at: Instant,
}

impl TreeLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the hierarchy's lease is free.
    ///
    /// With `timeout == None` this waits forever; a holder that never
    /// releases is a deadlock, not a recoverable condition.
    pub fn acquire(&self, hierarchy: HierarchyId, timeout: Option<Duration>) -> Result<TreeLease> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut held = self.inner.held.lock();
        while held.contains(&hierarchy) {
            match deadline {
                None => self.inner.released.wait(&mut held),
                Some(deadline) => {
                    if self.inner.released.wait_until(&mut held, deadline).timed_out()
                        && held.contains(&hierarchy)
                    {
                        warn!(hierarchy = %hierarchy, "tree.lock.timeout");
                        return Err(TreeError::LockTimeout(hierarchy));
                    }
                }
            }
        }
        held.insert(hierarchy);
        debug!(hierarchy = %hierarchy, "tree.lock.acquired");
        Ok(self.lease(hierarchy))
    }

    /// Takes the lease only if it is free right now.
    pub fn try_acquire(&self, hierarchy: HierarchyId) -> Option<TreeLease> {
        let mut held = self.inner.held.lock();
        if !held.insert(hierarchy) {
            return None;
        }
        Some(self.lease(hierarchy))
    }

    /// Returns true when a lease for `hierarchy` is outstanding.
    pub fn is_held(&self, hierarchy: HierarchyId) -> bool {
        self.inner.held.lock().contains(&hierarchy)
    }

    /// Returns a snapshot of the outstanding leases.
    pub fn snapshot(&self) -> LockSnapshot {
        let mut held: Vec<HierarchyId> = self.inner.held.lock().iter().copied().collect();
        held.sort();
        LockSnapshot { held }
    }

    fn lease(&self, hierarchy: HierarchyId) -> TreeLease {
        TreeLease {
            inner: Arc::clone(&self.inner),
            hierarchy,
            acquired_at: Instant::now(),
        }
    }
}

impl TreeLease {
    /// Hierarchy this lease covers.
    pub fn hierarchy(&self) -> HierarchyId {
        self.hierarchy
    }
}

impl Drop for TreeLease {
    fn drop(&mut self) {
        {
            let mut held = self.inner.held.lock();
            held.remove(&self.hierarchy);
        }
        self.inner.released.notify_all();
        debug!(
            hierarchy = %self.hierarchy,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "tree.lock.released"
        );
    }
}
