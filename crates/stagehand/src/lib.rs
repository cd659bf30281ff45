//! Stagehand: show-control playback scheduler
//!
//! Plays timelines of tracks against real time. Each timeline runs in a
//! [`Controller`], a small state machine that scans its cue list, drives one
//! Player per track, and admits cues against named [`Capacity`] pools.
//! Instancer tracks spawn nested Controllers for sub-timelines, forming a
//! tree rooted in [`Instances`].
//!
//! - **Capacity / Acquisition / Waiting**: counting resources with a FIFO wait
//!   queue; requests never block, they queue and call back
//! - **Controller**: Stopped / Playing / Paused / Waiting, with head-of-line
//!   blocking when a cue cannot get its capacity
//! - **Instancer**: child Controllers with marshaled variables
//! - **TickDriver**: the worker thread that ticks the whole tree

pub mod acquisition;
pub mod capacity;
pub mod controller;
pub mod driver;
pub mod instancer;
pub mod instances;
pub mod primitives;
pub mod show;
pub mod tick_clock;
pub mod timeline;
pub mod variables;
pub mod waiting;

pub use acquisition::Acquisition;
pub use capacity::{
    Capacities, Capacity, CapacityDefinition, CapacityError, Grant, View, WaitingEntry,
};
pub use controller::{Controller, ControllerError, CueOutcome, MAX_TRIGGER_DEPTH};
pub use driver::{DriverError, TickDriver};
pub use instancer::{
    InstancerDefinition, InstancerError, InstancerPlayer, InstancerTrack, TriggerEntry,
};
pub use instances::{InstanceInfo, Instances, ROOT_PATH};
pub use primitives::*;
pub use show::{Show, ShowContext, ShowError};
pub use tick_clock::TickClock;
pub use timeline::{
    CapacityOp, CapacityUse, Cue, CueAction, CueList, Playback, Player, Timeline, Track,
};
pub use variables::{
    Assignment, Comparison, Condition, SubscriptionId, Value, Variable, VariableError,
    VariableList, VariableScope,
};
pub use waiting::{WaitSignal, Waiting};
