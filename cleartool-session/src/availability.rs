//! Sticky "tool unavailable" state.
//!
//! Once the tool fails to start, every later attempt to start it is skipped
//! until [`ToolAvailability::reset`] is called. Clients share the
//! process-global holder unless they are given their own.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

static GLOBAL: Lazy<Arc<ToolAvailability>> = Lazy::new(|| Arc::new(ToolAvailability::default()));

#[derive(Debug, Default)]
pub struct ToolAvailability {
    unavailable: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ToolAvailability {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The holder shared by every client of this process.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Why the tool was marked unavailable.
    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mark the tool unavailable. Returns `true` only for the call that
    /// flipped the flag.
    pub fn mark_unavailable(&self, reason: impl Into<String>) -> bool {
        let mut slot = self
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.unavailable.swap(true, Ordering::AcqRel) {
            return false;
        }
        *slot = Some(reason.into());
        true
    }

    /// Administrative reset; the next client call tries to start the tool again.
    pub fn reset(&self) {
        let mut slot = self
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.unavailable.store(false, Ordering::Release);
        *slot = None;
    }
}
