//! Instancer track: spawns a child Controller for a sub-timeline
//!
//! Each [`InstancerPlayer`] that starts creates an independent child
//! Controller with its own variable scope, cloned from the target timeline's
//! declarations. Parameters are marshaled into input variables at spawn, and
//! output variable changes are forwarded to the parent's outlets for as long
//! as the instance lives.
//!
//! The child runs on its own clock. It starts at zero whatever the parent
//! position was when the track started, and advances by the parent's deltas.
//! Trigger entries are authored in track time; entries the child cannot take
//! while it is blocked on a capacity are retried once it unblocks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::controller::{Controller, ControllerError};
use crate::primitives::{CueId, Time, TimelineId, TrackId, VariableId};
use crate::timeline::{Playback, Player, Track};
use crate::variables::{SubscriptionId, VariableScope};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstancerError {
    #[error("no target timeline selected")]
    NoTimeline,

    #[error("timeline not found: {0}")]
    TimelineNotFound(TimelineId),

    #[error("timeline '{0}' is a singleton and can only be played as the root")]
    SingletonTimeline(String),

    #[error("cannot change the target timeline while {players} instance(s) are live")]
    TargetLocked { players: usize },
}

/// Persisted attributes of an instancer track
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancerDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<TimelineId>,
    /// Child variable id → literal marshaled into it at spawn
    #[serde(default)]
    pub parameters: HashMap<VariableId, String>,
}

/// "Trigger child cue `cue` when the track reaches `time`"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub time: Time,
    pub cue: CueId,
}

#[derive(Default)]
struct InstancerConfig {
    timeline: Option<TimelineId>,
    parameters: HashMap<VariableId, String>,
    /// Child output variable → parent variable
    outlets: HashMap<VariableId, VariableId>,
    triggers: Vec<TriggerEntry>,
}

struct InstancerShared {
    config: Mutex<InstancerConfig>,
    player_count: AtomicUsize,
}

/// Keeps the live-player count up for as long as an instance exists
struct PlayerCountGuard(Arc<InstancerShared>);

impl PlayerCountGuard {
    fn new(shared: &Arc<InstancerShared>) -> Self {
        shared.player_count.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(shared))
    }
}

impl Drop for PlayerCountGuard {
    fn drop(&mut self) {
        self.0.player_count.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct InstancerTrack {
    id: TrackId,
    name: String,
    shared: Arc<InstancerShared>,
}

impl InstancerTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            shared: Arc::new(InstancerShared {
                config: Mutex::new(InstancerConfig::default()),
                player_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_definition(name: impl Into<String>, definition: InstancerDefinition) -> Self {
        let track = Self::new(name);
        {
            let mut config = track.shared.config.lock();
            config.timeline = definition.timeline;
            config.parameters = definition.parameters;
        }
        track
    }

    pub fn definition(&self) -> InstancerDefinition {
        let config = self.shared.config.lock();
        InstancerDefinition {
            timeline: config.timeline,
            parameters: config.parameters.clone(),
        }
    }

    pub fn timeline(&self) -> Option<TimelineId> {
        self.shared.config.lock().timeline
    }

    /// Retarget the track; refused while any instance is live
    ///
    /// Parameters and outlets refer to the old timeline's variables and are
    /// cleared.
    pub fn set_timeline(&self, timeline: Option<TimelineId>) -> Result<(), InstancerError> {
        let players = self.player_count();
        if players > 0 {
            warn!(track = %self.name, players, "target timeline change refused");
            return Err(InstancerError::TargetLocked { players });
        }

        let mut config = self.shared.config.lock();
        if config.timeline != timeline {
            config.timeline = timeline;
            config.parameters.clear();
            config.outlets.clear();
        }
        Ok(())
    }

    pub fn set_parameter(&self, variable: VariableId, literal: impl Into<String>) {
        self.shared
            .config
            .lock()
            .parameters
            .insert(variable, literal.into());
    }

    pub fn parameters(&self) -> HashMap<VariableId, String> {
        self.shared.config.lock().parameters.clone()
    }

    /// Forward changes of child output variable `child` to parent variable `parent`
    pub fn set_outlet(&self, child: VariableId, parent: VariableId) {
        self.shared.config.lock().outlets.insert(child, parent);
    }

    pub fn add_trigger(&self, time: Time, cue: CueId) {
        let mut config = self.shared.config.lock();
        let idx = config.triggers.partition_point(|t| t.time <= time);
        config.triggers.insert(idx, TriggerEntry { time, cue });
    }

    pub fn triggers(&self) -> Vec<TriggerEntry> {
        self.shared.config.lock().triggers.clone()
    }

    /// Number of live instances spawned by this track
    pub fn player_count(&self) -> usize {
        self.shared.player_count.load(Ordering::Acquire)
    }
}

impl Track for InstancerTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn create_player(&self) -> Box<dyn Player> {
        Box::new(InstancerPlayer {
            shared: Arc::clone(&self.shared),
            track_name: self.name.clone(),
            live: None,
        })
    }
}

struct LiveInstance {
    child: Controller,
    scope: Arc<VariableScope>,
    subscription: SubscriptionId,
    triggers: Vec<TriggerEntry>,
    /// Entries refused while the child was blocked, oldest first
    deferred: VecDeque<TriggerEntry>,
    /// Track position the instance was spawned at; child time zero
    started_at: Time,
    last_pos: Time,
    _count: PlayerCountGuard,
}

impl LiveInstance {
    /// Child time for a track position
    fn child_time(&self, pos: Time) -> Time {
        (pos - self.started_at).max(Time::zero())
    }

    /// Trigger deferred entries until the child refuses one because it is blocked
    fn drain_deferred(&mut self, track_name: &str) {
        while let Some(entry) = self.deferred.front().copied() {
            match self.child.trigger(entry.cue, true) {
                Err(ControllerError::Blocked(blocking)) => {
                    trace!(
                        track = %track_name,
                        cue = %entry.cue,
                        %blocking,
                        "child blocked, trigger deferred"
                    );
                    return;
                }
                Ok(outcome) => {
                    debug!(track = %track_name, cue = %entry.cue, ?outcome, "child cue triggered");
                }
                Err(e) => warn!(track = %track_name, "child trigger failed: {e}"),
            }
            self.deferred.pop_front();
        }
    }
}

pub struct InstancerPlayer {
    shared: Arc<InstancerShared>,
    track_name: String,
    live: Option<LiveInstance>,
}

impl InstancerPlayer {
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn spawn(&self, pos: Time, playback: &Playback) -> Result<LiveInstance, InstancerError> {
        let (timeline_id, parameters, outlets, triggers) = {
            let config = self.shared.config.lock();
            (
                config.timeline,
                config.parameters.clone(),
                config.outlets.clone(),
                config.triggers.clone(),
            )
        };

        let timeline_id = timeline_id.ok_or(InstancerError::NoTimeline)?;
        let timeline = playback
            .context
            .timeline(timeline_id)
            .cloned()
            .ok_or(InstancerError::TimelineNotFound(timeline_id))?;
        if timeline.singleton {
            return Err(InstancerError::SingletonTimeline(timeline.name.clone()));
        }

        // Marshal in: parameters overwrite the initial value of input variables
        let mut variables = timeline.variables.clone();
        for (id, literal) in &parameters {
            let Some(declared) = variables.get(*id) else {
                warn!(track = %self.track_name, variable = %id, "parameter for unknown variable");
                continue;
            };
            if !declared.input {
                warn!(
                    track = %self.track_name,
                    variable = %declared.name,
                    "parameter for non-input variable"
                );
                continue;
            }
            let value = match declared.initial.parse_like(literal) {
                Ok(value) => value,
                Err(e) => {
                    warn!(track = %self.track_name, variable = %declared.name, "{e}");
                    continue;
                }
            };
            if let Err(e) = variables.set_initial(*id, value) {
                warn!(track = %self.track_name, "{e}");
            }
        }
        let scope = VariableScope::new(variables);

        // Marshal out: forward output changes while the instance lives
        let parent = Arc::clone(&playback.locals);
        let globals = Arc::clone(playback.context.globals());
        let track_name = self.track_name.clone();
        let subscription = scope.subscribe(move |variable, value| {
            if !variable.output {
                return;
            }
            let Some(target) = outlets.get(&variable.id) else {
                return;
            };
            let result = if parent.contains(*target) {
                parent.set(*target, value.clone())
            } else {
                globals.set(*target, value.clone())
            };
            if let Err(e) = result {
                warn!(track = %track_name, variable = %variable.name, "outlet update failed: {e}");
            }
        });

        let mut child = Controller::new(
            timeline,
            Arc::clone(&playback.context),
            Arc::clone(&scope),
            playback.run_mode,
        );
        let count = PlayerCountGuard::new(&self.shared);
        if let Err(e) = child.play() {
            warn!(track = %self.track_name, "child failed to start: {e}");
        }

        Ok(LiveInstance {
            child,
            scope,
            subscription,
            triggers,
            deferred: VecDeque::new(),
            started_at: pos,
            last_pos: pos,
            _count: count,
        })
    }
}

impl Player for InstancerPlayer {
    // Deltas handed to the child are already scaled by the parent's speed
    fn start(&mut self, pos: Time, playback: &Playback, _speed: f64) -> anyhow::Result<()> {
        self.stop();

        let live = self.spawn(pos, playback)?;
        info!(
            track = %self.track_name,
            timeline = %live.child.timeline().name,
            position = %pos,
            "instance spawned"
        );
        self.live = Some(live);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut live) = self.live.take() else {
            return;
        };
        live.child.stop();
        live.scope.unsubscribe(live.subscription);
        info!(track = %self.track_name, "instance destroyed");
    }

    fn tick(&mut self, pos: Time) {
        let Some(live) = self.live.as_mut() else {
            return;
        };

        let from = live.triggers.partition_point(|t| t.time < live.last_pos);
        let until = live.triggers.partition_point(|t| t.time < pos);
        let due = live.triggers[from..until].to_vec();
        live.deferred.extend(due);
        live.drain_deferred(&self.track_name);

        live.child.update(pos - live.last_pos);
        live.last_pos = pos;

        // A grant resolved by this update may have unblocked the child
        live.drain_deferred(&self.track_name);
    }

    fn jump(&mut self, pos: Time, _paused: bool) {
        if let Some(live) = self.live.as_mut() {
            // A seek skips the entries in between, including any still deferred
            live.deferred.clear();
            let child_pos = live.child_time(pos);
            live.child.jump(child_pos);
            live.last_pos = pos;
        }
    }

    fn pause(&mut self, paused: bool) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let result = if paused {
            live.child.pause()
        } else {
            live.child.resume()
        };
        if let Err(e) = result {
            debug!(track = %self.track_name, "child ignored pause change: {e}");
        }
    }

    fn next_event(&self, after: Time) -> Option<Time> {
        let live = self.live.as_ref()?;
        let trigger = live
            .triggers
            .iter()
            .map(|t| t.time)
            .find(|t| *t >= after);
        let child_event = live
            .child
            .next_event(live.child_time(after))
            .map(|t| t + live.started_at);
        child_event.into_iter().chain(trigger).min()
    }

    fn set_output(&mut self, enabled: bool) {
        if let Some(live) = self.live.as_mut() {
            live.child.set_output(enabled);
        }
    }

    fn child(&self) -> Option<&Controller> {
        self.live.as_ref().map(|l| &l.child)
    }

    fn child_mut(&mut self) -> Option<&mut Controller> {
        self.live.as_mut().map(|l| &mut l.child)
    }
}

impl Drop for InstancerPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}
