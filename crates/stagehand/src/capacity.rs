//! Named counting resources with a FIFO wait queue
//!
//! A [`Capacity`] gates how many concurrent consumers may use a limited
//! resource (fog machines, pyro channels, a shared projector). Requests that
//! fit are granted immediately; the rest queue in arrival order and are
//! granted from [`Capacity::release`] as soon as the head of the queue fits.
//!
//! **Key invariant:** `value + outstanding == initial` whenever the lock is
//! not held.
//!
//! Waiter callbacks are always invoked after the lock has been dropped, so a
//! callback may re-enter the same Capacity (release what it just received,
//! queue a new request) without deadlocking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::primitives::CapacityId;
use crate::waiting::{waiter_addr, Waiting};

/// Errors from capacity operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapacityError {
    #[error("capacity amounts must be greater than zero")]
    ZeroAmount,

    #[error("capacity '{name}' is in use ({outstanding} outstanding)")]
    InUse { name: String, outstanding: u32 },

    #[error("cannot release {amount} of capacity '{name}': only {outstanding} outstanding")]
    OverRelease {
        name: String,
        amount: u32,
        outstanding: u32,
    },

    #[error("capacity not found: {0}")]
    NotFound(CapacityId),
}

/// Receives a notification after every capacity mutation, so a UI can repaint
///
/// Never required for correctness.
pub trait View: Send + Sync {
    fn capacity_changed(&self, capacity: &Capacity);
}

/// Persisted attributes of a capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityDefinition {
    pub id: CapacityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub initial: u32,
}

impl CapacityDefinition {
    pub fn new(name: impl Into<String>, initial: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            initial,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Outcome of [`Capacity::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The amount was available and is now held by the caller
    Granted,
    /// The request was queued; the waiter will be called back
    Queued,
}

impl Grant {
    pub fn is_granted(&self) -> bool {
        matches!(self, Grant::Granted)
    }
}

/// Snapshot of one queued request, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub amount: u32,
    pub name: String,
}

struct QueuedRequest {
    amount: u32,
    waiter: Weak<dyn Waiting>,
}

struct CapacityState {
    name: String,
    description: String,
    initial: u32,
    current: u32,
    outstanding: u32,
    queue: VecDeque<QueuedRequest>,
}

impl CapacityState {
    /// Grant queued requests from the head while they fit
    ///
    /// Strictly FIFO: stops at the first live request that does not fit, even
    /// if a smaller request further back would. Requests whose waiter has been
    /// dropped are discarded without being granted.
    fn service_queue(&mut self) -> Vec<(Arc<dyn Waiting>, u32)> {
        let mut granted = Vec::new();

        while let Some(front) = self.queue.front() {
            let Some(waiter) = front.waiter.upgrade() else {
                trace!(capacity = %self.name, "dropping queued request of vanished waiter");
                self.queue.pop_front();
                continue;
            };

            if front.amount > self.current {
                break;
            }

            let amount = front.amount;
            self.queue.pop_front();
            self.current -= amount;
            self.outstanding += amount;
            granted.push((waiter, amount));
        }

        granted
    }
}

/// A named integer resource pool with a FIFO wait queue
pub struct Capacity {
    id: CapacityId,
    state: Mutex<CapacityState>,
    view: Option<Arc<dyn View>>,
}

impl Capacity {
    pub fn new(definition: CapacityDefinition) -> Self {
        Self::with_view(definition, None)
    }

    pub fn with_view(definition: CapacityDefinition, view: Option<Arc<dyn View>>) -> Self {
        Self {
            id: definition.id,
            state: Mutex::new(CapacityState {
                name: definition.name,
                description: definition.description,
                initial: definition.initial,
                current: definition.initial,
                outstanding: 0,
                queue: VecDeque::new(),
            }),
            view,
        }
    }

    /// Copy of this capacity with a fresh identity and nothing held
    pub fn duplicate(&self) -> Self {
        let mut definition = self.definition();
        definition.id = Uuid::new_v4();
        Self::with_view(definition, self.view.clone())
    }

    pub fn id(&self) -> CapacityId {
        self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().name = name.into();
        self.notify_view();
    }

    pub fn description(&self) -> String {
        self.state.lock().description.clone()
    }

    /// Currently available amount
    pub fn value(&self) -> u32 {
        self.state.lock().current
    }

    pub fn initial_value(&self) -> u32 {
        self.state.lock().initial
    }

    /// Sum of all amounts currently granted
    pub fn outstanding(&self) -> u32 {
        self.state.lock().outstanding
    }

    /// Persisted attributes
    pub fn definition(&self) -> CapacityDefinition {
        let state = self.state.lock();
        CapacityDefinition {
            id: self.id,
            name: state.name.clone(),
            description: state.description.clone(),
            initial: state.initial,
        }
    }

    /// Request `amount`, granting it now if available or queueing `waiter`
    pub fn acquire(&self, amount: u32, waiter: &Arc<dyn Waiting>) -> Result<Grant, CapacityError> {
        if amount == 0 {
            return Err(CapacityError::ZeroAmount);
        }

        let grant = {
            let mut state = self.state.lock();
            if state.current >= amount {
                state.current -= amount;
                state.outstanding += amount;
                debug!(
                    capacity = %state.name,
                    amount,
                    remaining = state.current,
                    "capacity granted"
                );
                Grant::Granted
            } else {
                state.queue.push_back(QueuedRequest {
                    amount,
                    waiter: Arc::downgrade(waiter),
                });
                debug!(
                    capacity = %state.name,
                    amount,
                    available = state.current,
                    queued = state.queue.len(),
                    "capacity request queued"
                );
                Grant::Queued
            }
        };

        self.notify_view();
        Ok(grant)
    }

    /// Return `amount` and grant queued requests that now fit
    pub fn release(&self, amount: u32) -> Result<(), CapacityError> {
        if amount == 0 {
            return Ok(());
        }

        let granted = {
            let mut state = self.state.lock();
            if amount > state.outstanding {
                return Err(CapacityError::OverRelease {
                    name: state.name.clone(),
                    amount,
                    outstanding: state.outstanding,
                });
            }
            state.current += amount;
            state.outstanding -= amount;
            debug!(capacity = %state.name, amount, available = state.current, "capacity released");
            state.service_queue()
        };

        for (waiter, amount) in granted {
            debug!(capacity = %self.id, waiter = %waiter.name(), amount, "queued request granted");
            waiter.acquired(amount);
        }

        self.notify_view();
        Ok(())
    }

    /// Remove the first queued request of `waiter`, returning whether one was found
    pub fn cancel(&self, waiter: &Arc<dyn Waiting>) -> bool {
        let target = waiter_addr(Arc::as_ptr(waiter));
        let removed = {
            let mut state = self.state.lock();
            let position = state
                .queue
                .iter()
                .position(|entry| waiter_addr(entry.waiter.as_ptr()) == target);
            match position {
                Some(idx) => {
                    state.queue.remove(idx);
                    true
                }
                None => false,
            }
        };

        if removed {
            self.notify_view();
        }
        removed
    }

    /// Restore the initial value and drop every queued request
    ///
    /// Refused while any amount is outstanding.
    pub fn reset(&self) -> Result<(), CapacityError> {
        {
            let mut state = self.state.lock();
            if state.outstanding != 0 {
                warn!(capacity = %state.name, outstanding = state.outstanding, "reset refused");
                return Err(CapacityError::InUse {
                    name: state.name.clone(),
                    outstanding: state.outstanding,
                });
            }
            state.queue.clear();
            state.current = state.initial;
        }

        self.notify_view();
        Ok(())
    }

    /// Resize the pool; refused while any amount is outstanding
    pub fn set_initial_value(&self, initial: u32) -> Result<(), CapacityError> {
        let granted = {
            let mut state = self.state.lock();
            if state.outstanding != 0 {
                return Err(CapacityError::InUse {
                    name: state.name.clone(),
                    outstanding: state.outstanding,
                });
            }
            state.initial = initial;
            state.current = initial;
            state.service_queue()
        };

        for (waiter, amount) in granted {
            waiter.acquired(amount);
        }

        self.notify_view();
        Ok(())
    }

    /// Snapshot of the queue, head first
    pub fn waiting_list(&self) -> Vec<WaitingEntry> {
        let live: Vec<(Arc<dyn Waiting>, u32)> = {
            let state = self.state.lock();
            state
                .queue
                .iter()
                .filter_map(|entry| entry.waiter.upgrade().map(|w| (w, entry.amount)))
                .collect()
        };

        live.into_iter()
            .map(|(waiter, amount)| WaitingEntry {
                amount,
                name: waiter.name(),
            })
            .collect()
    }

    fn notify_view(&self) {
        if let Some(view) = &self.view {
            view.capacity_changed(self);
        }
    }
}

impl fmt::Debug for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Capacity")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("initial", &state.initial)
            .field("current", &state.current)
            .field("outstanding", &state.outstanding)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// The capacities of one show
#[derive(Default)]
pub struct Capacities {
    items: Vec<Arc<Capacity>>,
    view: Option<Arc<dyn View>>,
}

impl Capacities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacities added from now on report to `view`
    pub fn with_view(view: Arc<dyn View>) -> Self {
        Self {
            items: Vec::new(),
            view: Some(view),
        }
    }

    pub fn add(&mut self, definition: CapacityDefinition) -> Arc<Capacity> {
        let capacity = Arc::new(Capacity::with_view(definition, self.view.clone()));
        self.items.push(Arc::clone(&capacity));
        capacity
    }

    pub fn get(&self, id: CapacityId) -> Option<&Arc<Capacity>> {
        self.items.iter().find(|c| c.id() == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<Capacity>> {
        self.items.iter().find(|c| c.name() == name)
    }

    /// Remove a capacity; refused while it is in use
    pub fn remove(&mut self, id: CapacityId) -> Result<Arc<Capacity>, CapacityError> {
        let idx = self
            .items
            .iter()
            .position(|c| c.id() == id)
            .ok_or(CapacityError::NotFound(id))?;

        let outstanding = self.items[idx].outstanding();
        if outstanding != 0 {
            return Err(CapacityError::InUse {
                name: self.items[idx].name(),
                outstanding,
            });
        }
        Ok(self.items.remove(idx))
    }

    /// Reset every capacity, returning the first refusal
    pub fn reset_all(&self) -> Result<(), CapacityError> {
        let mut first_error = None;
        for capacity in &self.items {
            if let Err(e) = capacity.reset() {
                warn!("{e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn definitions(&self) -> Vec<CapacityDefinition> {
        self.items.iter().map(|c| c.definition()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Capacity>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
