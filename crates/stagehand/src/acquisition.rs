//! Per-consumer ledger against one Capacity
//!
//! An [`Acquisition`] tracks how much of a single [`Capacity`] one consumer
//! (usually a Controller acting for its cues) currently holds. Dropping it
//! cancels any queued request and returns everything held, which is the one
//! path that guarantees a capacity never leaks.
//!
//! Queued requests are registered with the Capacity through an internal relay
//! rather than the caller's waiter directly. The relay credits the ledger
//! first, then forwards the grant, so `held` is correct by the time the caller
//! hears about it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capacity::{Capacity, CapacityError, Grant};
use crate::waiting::Waiting;

struct RelayState {
    held: u32,
    pending: Option<Arc<dyn Waiting>>,
    closed: bool,
}

struct AcquisitionRelay {
    capacity: Arc<Capacity>,
    state: Mutex<RelayState>,
}

impl Waiting for AcquisitionRelay {
    fn acquired(&self, amount: u32) {
        let forward = {
            let mut state = self.state.lock();
            if state.closed {
                None
            } else {
                state.held += amount;
                Some(state.pending.take())
            }
        };

        match forward {
            // The Acquisition is gone; hand the grant straight back
            None => {
                debug!(
                    capacity = %self.capacity.name(),
                    amount,
                    "grant arrived after drop, returning it"
                );
                if let Err(e) = self.capacity.release(amount) {
                    warn!("failed to return late grant: {e}");
                }
            }
            Some(Some(waiter)) => waiter.acquired(amount),
            Some(None) => {}
        }
    }

    fn name(&self) -> String {
        let pending = self.state.lock().pending.clone();
        match pending {
            Some(waiter) => waiter.name(),
            None => format!("acquisition of {}", self.capacity.name()),
        }
    }
}

/// One consumer's claim against a Capacity
pub struct Acquisition {
    relay: Arc<AcquisitionRelay>,
}

impl Acquisition {
    pub fn new(capacity: Arc<Capacity>) -> Self {
        Self {
            relay: Arc::new(AcquisitionRelay {
                capacity,
                state: Mutex::new(RelayState {
                    held: 0,
                    pending: None,
                    closed: false,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> &Arc<Capacity> {
        &self.relay.capacity
    }

    /// Amount currently granted to this Acquisition
    pub fn held(&self) -> u32 {
        self.relay.state.lock().held
    }

    /// Whether a request is queued on the Capacity
    pub fn is_pending(&self) -> bool {
        self.relay.state.lock().pending.is_some()
    }

    /// Hold at least `amount`, requesting only the shortfall
    ///
    /// Returns `Ok(true)` when the amount is held on return. Otherwise the
    /// shortfall is queued and `waiter` is called once it has been granted. A
    /// previously queued request is cancelled first, so at most one request
    /// is ever in flight.
    pub fn acquire(&self, amount: u32, waiter: Arc<dyn Waiting>) -> Result<bool, CapacityError> {
        if amount == 0 {
            return Err(CapacityError::ZeroAmount);
        }

        let shortfall = {
            let state = self.relay.state.lock();
            if state.held >= amount {
                return Ok(true);
            }
            amount - state.held
        };

        self.cancel();

        // Registered before queueing so a grant from another thread finds it
        self.relay.state.lock().pending = Some(waiter);

        let relay = self.relay_waiter();
        match self.relay.capacity.acquire(shortfall, &relay) {
            Ok(Grant::Granted) => {
                let mut state = self.relay.state.lock();
                state.held += shortfall;
                state.pending = None;
                Ok(true)
            }
            Ok(Grant::Queued) => Ok(false),
            Err(e) => {
                self.relay.state.lock().pending = None;
                Err(e)
            }
        }
    }

    /// Top up to at least `amount`; same contract as [`Acquisition::acquire`]
    pub fn ensure(&self, amount: u32, waiter: Arc<dyn Waiting>) -> Result<bool, CapacityError> {
        self.acquire(amount, waiter)
    }

    /// Return up to `amount`, clamped to what is held; returns the amount released
    pub fn release(&self, amount: u32) -> Result<u32, CapacityError> {
        let amount = {
            let mut state = self.relay.state.lock();
            let amount = amount.min(state.held);
            state.held -= amount;
            amount
        };

        if amount > 0 {
            if let Err(e) = self.relay.capacity.release(amount) {
                self.relay.state.lock().held += amount;
                return Err(e);
            }
        }
        Ok(amount)
    }

    /// Return everything held
    pub fn release_all(&self) -> Result<u32, CapacityError> {
        self.release(u32::MAX)
    }

    /// Withdraw a queued request; the amount already held is kept
    pub fn cancel(&self) -> bool {
        let pending = self.relay.state.lock().pending.take();
        if pending.is_none() {
            return false;
        }
        self.relay.capacity.cancel(&self.relay_waiter())
    }

    fn relay_waiter(&self) -> Arc<dyn Waiting> {
        self.relay.clone()
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        let held = {
            let mut state = self.relay.state.lock();
            state.closed = true;
            state.pending = None;
            std::mem::take(&mut state.held)
        };

        self.relay.capacity.cancel(&self.relay_waiter());

        if held > 0 {
            if let Err(e) = self.relay.capacity.release(held) {
                warn!("acquisition drop failed to release {held}: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("capacity", &self.relay.capacity.id())
            .field("held", &self.held())
            .field("pending", &self.is_pending())
            .finish()
    }
}
