//! Notification seam for capacity requests that could not be granted at once
//!
//! A Capacity never blocks the caller. A request it cannot satisfy is queued
//! together with a [`Waiting`] reference, and `acquired` is invoked later,
//! exactly once, from whichever thread released enough of the capacity.
//!
//! The Capacity only holds a `Weak` reference while the request is queued, so
//! a requester that disappears simply drops out of the queue.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Callback invoked when a queued request has been granted
pub trait Waiting: Send + Sync {
    /// The queued amount has been granted in full
    fn acquired(&self, amount: u32);

    /// Diagnostic label shown in waiting lists
    fn name(&self) -> String {
        "(unknown)".to_string()
    }
}

/// Waiter that records the grant for the tick thread to pick up
///
/// A Controller blocked on a cue cannot be called back directly (it lives on
/// the tick thread and may be mid-update), so it hands one of these to the
/// Acquisition and polls [`WaitSignal::take`] on every tick.
#[derive(Debug)]
pub struct WaitSignal {
    label: String,
    fired: AtomicBool,
    amount: AtomicU32,
}

impl WaitSignal {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            fired: AtomicBool::new(false),
            amount: AtomicU32::new(0),
        })
    }

    /// Whether the grant has arrived (without consuming it)
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Consume the grant, returning the granted amount if it arrived
    pub fn take(&self) -> Option<u32> {
        if self.fired.swap(false, Ordering::AcqRel) {
            Some(self.amount.swap(0, Ordering::AcqRel))
        } else {
            None
        }
    }
}

impl Waiting for WaitSignal {
    fn acquired(&self, amount: u32) {
        self.amount.store(amount, Ordering::Release);
        self.fired.store(true, Ordering::Release);
    }

    fn name(&self) -> String {
        self.label.clone()
    }
}

/// Address of a waiter, for identity comparisons that ignore vtables
pub(crate) fn waiter_addr<T: ?Sized>(ptr: *const T) -> *const () {
    ptr as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Anonymous;

    impl Waiting for Anonymous {
        fn acquired(&self, _amount: u32) {}
    }

    #[test]
    fn test_default_name_is_placeholder() {
        assert_eq!(Anonymous.name(), "(unknown)");
    }

    #[test]
    fn test_signal_take_consumes_once() {
        let signal = WaitSignal::new("cue: fog burst");
        assert!(!signal.is_fired());
        assert_eq!(signal.take(), None);

        signal.acquired(2);
        assert!(signal.is_fired());
        assert_eq!(signal.take(), Some(2));
        assert_eq!(signal.take(), None);
        assert_eq!(signal.name(), "cue: fog burst");
    }
}
