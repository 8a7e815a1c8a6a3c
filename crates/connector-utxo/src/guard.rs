//! Boolean in-flight flags released on drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-reentrant marker for an operation that must not overlap with itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct InFlight(Arc<AtomicBool>);

impl InFlight {
    /// Sets the flag, or returns `None` if it is already set.
    pub(crate) fn try_enter(&self) -> Option<InFlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(self.0.clone()))
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the owning [`InFlight`] flag when dropped, whatever the exit path.
#[derive(Debug)]
pub(crate) struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
