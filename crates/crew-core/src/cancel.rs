//! Cancellation capabilities for background operations
//!
//! Every outstanding agent request and every running merge/PR/push carries
//! one of these next to it in session state, so cleanup code has nothing to
//! cross-reference: whoever clears the state triggers the capability.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot cancellation capability.
///
/// Wraps an opaque action with a single `cancel()` operation. Cancelling is
/// idempotent: only the first call runs the action.
#[derive(Clone)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    action: Arc<dyn Fn() + Send + Sync>,
}

impl Cancellation {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            action: Arc::new(action),
        }
    }

    /// A cancellation that only records that it fired.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Trigger the cancellation. Only the first call runs the action.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            (self.action)();
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
