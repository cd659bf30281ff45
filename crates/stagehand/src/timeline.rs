//! Timelines, cue lists, and the Track/Player seams
//!
//! A [`Timeline`] is authored data: a flat set of tracks, a cue list, and
//! declared variables. It is shared read-only (`Arc<Timeline>`) by every
//! Controller playing it. Tracks produce [`Player`]s; a Controller owns at
//! most one live Player per track.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::Controller;
use crate::primitives::{CapacityId, CueId, RunMode, Time, TimelineId, TrackId};
use crate::show::ShowContext;
use crate::variables::{Assignment, Condition, VariableList, VariableScope};

// =============================================================================
// CUES
// =============================================================================

/// Transport effect a cue has on the Controller playing it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CueAction {
    #[default]
    None,
    Start,
    Stop,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "amount", rename_all = "snake_case")]
pub enum CapacityOp {
    /// Hold at least this much in total
    Acquire(u32),
    Release(u32),
    ReleaseAll,
}

/// A capacity requirement or release performed when a cue fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityUse {
    pub capacity: CapacityId,
    pub op: CapacityOp,
}

/// A time-stamped, optionally guarded action on a cue list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub id: CueId,
    pub name: String,
    pub time: Time,
    #[serde(default)]
    pub action: CueAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<Assignment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capacities: Vec<CapacityUse>,
    /// Cue in the same list to trigger once this one completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<CueId>,
    /// Only reachable from this timeline's own scan and links
    #[serde(default)]
    pub private: bool,
}

impl Cue {
    pub fn new(name: impl Into<String>, time: Time) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            time,
            action: CueAction::None,
            condition: None,
            assignments: Vec::new(),
            capacities: Vec::new(),
            link: None,
            private: false,
        }
    }

    pub fn with_action(mut self, action: CueAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn assign(mut self, assignment: Assignment) -> Self {
        self.assignments.push(assignment);
        self
    }

    pub fn acquire(mut self, capacity: CapacityId, amount: u32) -> Self {
        self.capacities.push(CapacityUse {
            capacity,
            op: CapacityOp::Acquire(amount),
        });
        self
    }

    pub fn release(mut self, capacity: CapacityId, amount: u32) -> Self {
        self.capacities.push(CapacityUse {
            capacity,
            op: CapacityOp::Release(amount),
        });
        self
    }

    pub fn release_all(mut self, capacity: CapacityId) -> Self {
        self.capacities.push(CapacityUse {
            capacity,
            op: CapacityOp::ReleaseAll,
        });
        self
    }

    pub fn link_to(mut self, cue: CueId) -> Self {
        self.link = Some(cue);
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// Cues ordered by time; equal times keep insertion order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CueList {
    cues: Vec<Cue>,
}

impl CueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cue: Cue) -> CueId {
        let id = cue.id;
        let idx = self.cues.partition_point(|c| c.time <= cue.time);
        self.cues.insert(idx, cue);
        id
    }

    pub fn get(&self, idx: usize) -> Option<&Cue> {
        self.cues.get(idx)
    }

    pub fn find(&self, id: CueId) -> Option<&Cue> {
        self.cues.iter().find(|c| c.id == id)
    }

    pub fn index_of(&self, id: CueId) -> Option<usize> {
        self.cues.iter().position(|c| c.id == id)
    }

    /// Index of the first cue at or after `time` (may equal `len()`)
    pub fn first_at_or_after(&self, time: Time) -> usize {
        self.cues.partition_point(|c| c.time < time)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cue> {
        self.cues.iter()
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }
}

// =============================================================================
// TRACK / PLAYER
// =============================================================================

/// What a Player gets to work with when its track starts
#[derive(Clone)]
pub struct Playback {
    pub context: Arc<ShowContext>,
    /// Variable scope of the Controller starting the player
    pub locals: Arc<VariableScope>,
    pub run_mode: RunMode,
}

impl fmt::Debug for Playback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Playback")
            .field("run_mode", &self.run_mode)
            .finish_non_exhaustive()
    }
}

/// Live playback of one track, owned by exactly one Controller
///
/// All calls come from the tick thread.
pub trait Player: Send {
    fn start(&mut self, pos: Time, playback: &Playback, speed: f64) -> anyhow::Result<()>;

    fn stop(&mut self);

    /// Called once per tick with the Controller's new position
    fn tick(&mut self, pos: Time);

    /// Resynchronize output at a new position without replaying what was skipped
    fn jump(&mut self, pos: Time, paused: bool);

    fn pause(&mut self, _paused: bool) {}

    fn set_speed(&mut self, _speed: f64) {}

    /// Next time at or after `after` where this player changes output
    fn next_event(&self, _after: Time) -> Option<Time> {
        None
    }

    fn set_output(&mut self, _enabled: bool) {}

    /// Nested Controller owned by this player, if any
    fn child(&self) -> Option<&Controller> {
        None
    }

    fn child_mut(&mut self) -> Option<&mut Controller> {
        None
    }
}

/// Authored track; a factory for Players
pub trait Track: Send + Sync {
    fn id(&self) -> TrackId;

    fn name(&self) -> &str;

    fn supports(&self, _mode: RunMode) -> bool {
        true
    }

    fn create_player(&self) -> Box<dyn Player>;
}

// =============================================================================
// TIMELINE
// =============================================================================

pub struct Timeline {
    pub id: TimelineId,
    pub name: String,
    pub tracks: Vec<Arc<dyn Track>>,
    pub cues: CueList,
    pub variables: VariableList,
    /// May only be played as the root, never instanced
    pub singleton: bool,
    /// Playback stops on its own once the cursor passes this
    pub length: Option<Time>,
}

impl Timeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tracks: Vec::new(),
            cues: CueList::new(),
            variables: VariableList::new(),
            singleton: false,
            length: None,
        }
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_length(mut self, length: Time) -> Self {
        self.length = Some(length);
        self
    }

    pub fn add_track(&mut self, track: Arc<dyn Track>) -> TrackId {
        let id = track.id();
        self.tracks.push(track);
        id
    }

    pub fn add_cue(&mut self, cue: Cue) -> CueId {
        self.cues.push(cue)
    }

    pub fn track(&self, id: TrackId) -> Option<&Arc<dyn Track>> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn track_by_name(&self, name: &str) -> Option<&Arc<dyn Track>> {
        self.tracks.iter().find(|t| t.name() == name)
    }
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracks: Vec<&str> = self.tracks.iter().map(|t| t.name()).collect();
        f.debug_struct("Timeline")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tracks", &tracks)
            .field("cues", &self.cues.len())
            .field("singleton", &self.singleton)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cue_list_orders_by_time_stably() {
        let mut list = CueList::new();
        let late = list.push(Cue::new("late", Time(2000)));
        let a = list.push(Cue::new("a", Time(1000)));
        let b = list.push(Cue::new("b", Time(1000)));
        let early = list.push(Cue::new("early", Time(0)));

        let order: Vec<CueId> = list.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![early, a, b, late]);
    }

    #[test]
    fn test_first_at_or_after() {
        let mut list = CueList::new();
        list.push(Cue::new("one", Time(1000)));
        list.push(Cue::new("two", Time(2000)));

        assert_eq!(list.first_at_or_after(Time(0)), 0);
        assert_eq!(list.first_at_or_after(Time(1000)), 0);
        assert_eq!(list.first_at_or_after(Time(1001)), 1);
        assert_eq!(list.first_at_or_after(Time(5000)), 2);
    }

    #[test]
    fn test_cue_builder_collects_capacity_uses() {
        let fog = Uuid::new_v4();
        let cue = Cue::new("smoke", Time(500))
            .acquire(fog, 2)
            .release(fog, 1)
            .release_all(fog)
            .private();

        let ops: Vec<CapacityOp> = cue.capacities.iter().map(|u| u.op).collect();
        assert_eq!(
            ops,
            vec![
                CapacityOp::Acquire(2),
                CapacityOp::Release(1),
                CapacityOp::ReleaseAll
            ]
        );
        assert!(cue.private);
    }

    #[test]
    fn test_cue_serialization_omits_empty_fields() {
        let cue = Cue::new("blackout", Time(250)).with_action(CueAction::Stop);
        let json = serde_json::to_value(&cue).unwrap();

        assert_eq!(json["action"], "stop");
        assert_eq!(json["time"], 250);
        assert!(json.get("capacities").is_none());
        assert!(json.get("link").is_none());
    }
}
