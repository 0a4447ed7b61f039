//! Live-handle registry - host-side bookkeeping for owned references
//!
//! Every owned wrapper registers its handle when it claims a reference and
//! unregisters it exactly once when released. The registry is what turns
//! "drop a wrapper" into "exactly one decref":
//! - Releasing a handle that is not registered is refused (no double decref)
//! - Whatever is still registered at teardown is a leak and gets reported

use crate::ffi::Handle;
use crate::logging::{error, log_claim, log_release};
use dashmap::DashMap;
use std::cell::Cell;

/// Registry of owned references, keyed by handle address
pub(crate) struct Registry {
    live: DashMap<usize, usize>,
    total: Cell<usize>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            live: DashMap::with_capacity(256),
            total: Cell::new(0),
        }
    }

    /// Record one more owned reference to `handle`
    #[inline]
    pub(crate) fn register(&self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        *self.live.entry(handle.addr()).or_insert(0) += 1;
        self.total.set(self.total.get() + 1);
        log_claim(handle.addr(), self.total.get());
    }

    /// Forget one owned reference; `false` if none was recorded
    #[inline]
    pub(crate) fn unregister(&self, handle: Handle) -> bool {
        if handle.is_null() {
            return false;
        }

        let removed = match self.live.get_mut(&handle.addr()) {
            Some(mut count) => {
                *count -= 1;
                true
            }
            None => false,
        };

        if !removed {
            error!(target: "refcount", handle = handle.addr(), "release of unregistered handle refused");
            return false;
        }

        self.live.remove_if(&handle.addr(), |_, count| *count == 0);
        self.total.set(self.total.get() - 1);
        log_release(handle.addr(), self.total.get());
        true
    }

    /// Owned references currently held for `handle`
    #[cfg(test)]
    pub(crate) fn count(&self, handle: Handle) -> usize {
        self.live.get(&handle.addr()).map_or(0, |c| *c)
    }

    /// Total owned references held by the host
    pub(crate) fn live(&self) -> usize {
        self.total.get()
    }

    /// Distinct handles with at least one owned reference
    pub(crate) fn handles(&self) -> usize {
        self.live.len()
    }
}
