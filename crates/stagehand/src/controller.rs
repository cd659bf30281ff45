//! Playback state machine for one timeline
//!
//! A [`Controller`] owns a time cursor, the active Player of each track, the
//! Acquisitions held on behalf of its cues, and at most one pending wait.
//! It is driven by [`Controller::update`] from a single tick thread.
//!
//! ```text
//!            play                      capacity queued
//!  Stopped ─────────► Playing ◄──────────────────────────► Waiting
//!     ▲                 │  ▲            grant arrives         │
//!     │ stop            │  │ resume                    pause  │
//!     │ (any state)     ▼  │                                  ▼
//!     └───────────── Paused ◄─────────────────────────────────┘
//!                       (remembers to resume into Waiting)
//! ```
//!
//! Cues are scanned by index over a time-sorted list, so each cue in the
//! window `[cursor, cursor + diff)` fires once. While Waiting the cursor and
//! the players keep moving but the scan is held at the blocked cue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::acquisition::Acquisition;
use crate::primitives::{CapacityId, CueId, PlaybackState, RunMode, Time, TrackId};
use crate::show::ShowContext;
use crate::timeline::{CapacityOp, CueAction, Playback, Player, Timeline, Track};
use crate::variables::VariableScope;
use crate::waiting::WaitSignal;

/// Maximum chain of linked cues followed from one trigger
pub const MAX_TRIGGER_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cue not found: {0}")]
    CueNotFound(CueId),

    #[error("cue '{0}' is private and cannot be triggered externally")]
    PrivateCue(String),

    #[error("blocked on cue '{0}' waiting for capacity")]
    Blocked(String),

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: PlaybackState,
        action: &'static str,
    },

    #[error("track not found: {0}")]
    TrackNotFound(TrackId),

    #[error("track '{track}' failed to start: {message}")]
    Player { track: String, message: String },

    #[error("playback speed must be finite and positive, got {0}")]
    InvalidSpeed(f64),
}

/// What happened to a cue when it was executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueOutcome {
    Completed,
    /// Condition was false (or could not be evaluated)
    Skipped,
    /// Blocked on a capacity; the Controller is now Waiting
    Waiting,
}

struct ActivePlayer {
    track: Arc<dyn Track>,
    player: Box<dyn Player>,
}

/// A cue blocked on a capacity request
struct PendingWait {
    cue: usize,
    /// Index of the capacity use that queued
    op: usize,
    depth: usize,
    signal: Arc<WaitSignal>,
    capacity: CapacityId,
}

pub struct Controller {
    timeline: Arc<Timeline>,
    context: Arc<ShowContext>,
    locals: Arc<VariableScope>,
    run_mode: RunMode,

    state: PlaybackState,
    /// Paused out of Waiting
    resume_waiting: bool,
    cursor: Time,
    next_cue: usize,
    speed: f64,
    output_enabled: bool,

    players: Vec<ActivePlayer>,
    acquisitions: HashMap<CapacityId, Acquisition>,
    pending: Option<PendingWait>,

    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl Controller {
    pub fn new(
        timeline: Arc<Timeline>,
        context: Arc<ShowContext>,
        locals: Arc<VariableScope>,
        run_mode: RunMode,
    ) -> Self {
        Self {
            timeline,
            context,
            locals,
            run_mode,
            state: PlaybackState::Stopped,
            resume_waiting: false,
            cursor: Time::zero(),
            next_cue: 0,
            speed: 1.0,
            output_enabled: true,
            players: Vec::new(),
            acquisitions: HashMap::new(),
            pending: None,
            started_at: None,
            stopped_at: None,
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn timeline(&self) -> &Arc<Timeline> {
        &self.timeline
    }

    pub fn locals(&self) -> &Arc<VariableScope> {
        &self.locals
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn position(&self) -> Time {
        self.cursor
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    pub fn active_players(&self) -> usize {
        self.players.len()
    }

    pub fn is_track_active(&self, track: TrackId) -> bool {
        self.players.iter().any(|p| p.track.id() == track)
    }

    /// Cue blocking the scan, if any
    pub fn pending_cue(&self) -> Option<CueId> {
        let pending = self.pending.as_ref()?;
        self.timeline.cues.get(pending.cue).map(|c| c.id)
    }

    /// Amount of `capacity` held on behalf of this Controller's cues
    pub fn held(&self, capacity: CapacityId) -> u32 {
        self.acquisitions.get(&capacity).map_or(0, |a| a.held())
    }

    /// Nested Controllers, keyed by the path segment of the track that owns them
    pub fn children(&self) -> impl Iterator<Item = (String, &Controller)> {
        self.players.iter().filter_map(|p| {
            p.player
                .child()
                .map(|c| (self.path_segment(p.track.as_ref()), c))
        })
    }

    pub fn child_mut(&mut self, segment: &str) -> Option<&mut Controller> {
        let idx = self
            .players
            .iter()
            .position(|p| self.path_segment(p.track.as_ref()) == segment)?;
        self.players.get_mut(idx)?.player.child_mut()
    }

    /// Track name, suffixed `#n` when an earlier track of the timeline shares it
    fn path_segment(&self, track: &dyn Track) -> String {
        let earlier = self
            .timeline
            .tracks
            .iter()
            .take_while(|t| t.id() != track.id())
            .filter(|t| t.name() == track.name())
            .count();
        if earlier == 0 {
            track.name().to_string()
        } else {
            format!("{}#{}", track.name(), earlier + 1)
        }
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    pub fn set_playback_state(&mut self, target: PlaybackState) -> Result<(), ControllerError> {
        match target {
            PlaybackState::Playing => self.play(),
            PlaybackState::Paused => self.pause(),
            PlaybackState::Stopped => {
                self.stop();
                Ok(())
            }
            PlaybackState::Waiting => Err(ControllerError::InvalidTransition {
                state: self.state,
                action: "enter waiting directly",
            }),
        }
    }

    /// Start from Stopped, or resume from Paused
    pub fn play(&mut self) -> Result<(), ControllerError> {
        match self.state {
            PlaybackState::Playing | PlaybackState::Waiting => Ok(()),
            PlaybackState::Paused => self.resume(),
            PlaybackState::Stopped => {
                self.started_at = Some(Utc::now());
                self.next_cue = self.timeline.cues.first_at_or_after(self.cursor);
                // A cue triggered while stopped may already be blocked
                self.state = if self.pending.is_some() {
                    PlaybackState::Waiting
                } else {
                    PlaybackState::Playing
                };

                info!(
                    timeline = %self.timeline.name,
                    position = %self.cursor,
                    mode = ?self.run_mode,
                    "playback started"
                );

                let timeline = Arc::clone(&self.timeline);
                let run_mode = self.run_mode;
                for track in timeline.tracks.iter().filter(|t| t.supports(run_mode)) {
                    if let Err(e) = self.start_player(Arc::clone(track)) {
                        error!("{e}");
                    }
                }
                Ok(())
            }
        }
    }

    pub fn pause(&mut self) -> Result<(), ControllerError> {
        match self.state {
            PlaybackState::Paused => Ok(()),
            PlaybackState::Stopped => Err(ControllerError::InvalidTransition {
                state: self.state,
                action: "pause",
            }),
            PlaybackState::Playing | PlaybackState::Waiting => {
                self.resume_waiting = self.state == PlaybackState::Waiting;
                self.state = PlaybackState::Paused;
                for active in &mut self.players {
                    active.player.pause(true);
                }
                info!(timeline = %self.timeline.name, position = %self.cursor, "playback paused");
                Ok(())
            }
        }
    }

    pub fn resume(&mut self) -> Result<(), ControllerError> {
        if self.state != PlaybackState::Paused {
            return Err(ControllerError::InvalidTransition {
                state: self.state,
                action: "resume",
            });
        }

        self.state = if std::mem::take(&mut self.resume_waiting) {
            PlaybackState::Waiting
        } else {
            PlaybackState::Playing
        };
        for active in &mut self.players {
            active.player.pause(false);
        }
        info!(timeline = %self.timeline.name, state = %self.state, "playback resumed");
        Ok(())
    }

    /// Stop every player, withdraw the pending wait, and return all capacity held
    pub fn stop(&mut self) {
        for mut active in self.players.drain(..) {
            active.player.stop();
        }

        if let Some(pending) = self.pending.take() {
            if let Some(acquisition) = self.acquisitions.get(&pending.capacity) {
                acquisition.cancel();
            }
        }
        self.acquisitions.clear();

        let was = self.state;
        self.state = PlaybackState::Stopped;
        self.resume_waiting = false;
        self.cursor = Time::zero();
        self.next_cue = 0;

        if was != PlaybackState::Stopped {
            self.stopped_at = Some(Utc::now());
            info!(timeline = %self.timeline.name, "playback stopped");
        }
    }

    /// Seek to `pos` without firing the cues in between
    ///
    /// A cue blocked on capacity is abandoned; whatever it already holds stays
    /// held until released or the Controller stops.
    pub fn jump(&mut self, pos: Time) {
        if let Some(pending) = self.pending.take() {
            if let Some(acquisition) = self.acquisitions.get(&pending.capacity) {
                acquisition.cancel();
            }
            match self.state {
                PlaybackState::Waiting => self.state = PlaybackState::Playing,
                PlaybackState::Paused => self.resume_waiting = false,
                _ => {}
            }
        }

        self.cursor = pos;
        self.next_cue = self.timeline.cues.first_at_or_after(pos);

        let paused = self.state == PlaybackState::Paused;
        for active in &mut self.players {
            active.player.jump(pos, paused);
        }
        debug!(timeline = %self.timeline.name, position = %pos, "jumped");
    }

    /// Change the rate at which wall time advances the cursor
    pub fn set_speed(&mut self, speed: f64) -> Result<(), ControllerError> {
        if !(speed.is_finite() && speed > 0.0) {
            warn!(timeline = %self.timeline.name, speed, "invalid playback speed refused");
            return Err(ControllerError::InvalidSpeed(speed));
        }
        self.speed = speed;
        for active in &mut self.players {
            active.player.set_speed(speed);
        }
        Ok(())
    }

    pub fn set_output(&mut self, enabled: bool) {
        self.output_enabled = enabled;
        for active in &mut self.players {
            active.player.set_output(enabled);
        }
    }

    /// Start (or restart) the player for one track
    pub fn start_track(&mut self, track: TrackId) -> Result<(), ControllerError> {
        let track = self
            .timeline
            .track(track)
            .cloned()
            .ok_or(ControllerError::TrackNotFound(track))?;
        self.start_player(track)
    }

    pub fn stop_track(&mut self, track: TrackId) -> bool {
        let Some(idx) = self.players.iter().position(|p| p.track.id() == track) else {
            return false;
        };
        let mut active = self.players.remove(idx);
        active.player.stop();
        true
    }

    fn start_player(&mut self, track: Arc<dyn Track>) -> Result<(), ControllerError> {
        let track_id = track.id();
        if let Some(idx) = self.players.iter().position(|p| p.track.id() == track_id) {
            let mut previous = self.players.remove(idx);
            previous.player.stop();
        }

        let playback = Playback {
            context: Arc::clone(&self.context),
            locals: Arc::clone(&self.locals),
            run_mode: self.run_mode,
        };

        let mut player = track.create_player();
        player
            .start(self.cursor, &playback, self.speed)
            .map_err(|e| ControllerError::Player {
                track: track.name().to_string(),
                message: format!("{e:#}"),
            })?;
        if !self.output_enabled {
            player.set_output(false);
        }
        if self.state == PlaybackState::Paused {
            player.pause(true);
        }

        debug!(track = %track.name(), position = %self.cursor, "player started");
        self.players.push(ActivePlayer { track, player });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Cues
    // -------------------------------------------------------------------------

    /// Trigger the next public cue at or after the scan position
    ///
    /// The cursor moves up to the cue's time and the scan continues after it.
    pub fn fire(&mut self) -> Result<Option<CueId>, ControllerError> {
        if let Some(cue) = self.blocking_cue_name() {
            return Err(ControllerError::Blocked(cue));
        }

        let timeline = Arc::clone(&self.timeline);
        let Some((idx, cue)) = timeline
            .cues
            .iter()
            .enumerate()
            .skip(self.next_cue)
            .find(|(_, c)| !c.private)
        else {
            debug!(timeline = %timeline.name, "no cue left to fire");
            return Ok(None);
        };

        if cue.time > self.cursor {
            self.cursor = cue.time;
            let paused = self.state == PlaybackState::Paused;
            for active in &mut self.players {
                active.player.jump(cue.time, paused);
            }
        }
        self.next_cue = idx + 1;

        info!(cue = %cue.name, "firing");
        self.execute_cue(idx, 0, 0);
        Ok(Some(cue.id))
    }

    /// Execute one cue out of band
    pub fn trigger(
        &mut self,
        cue: CueId,
        deny_if_private: bool,
    ) -> Result<CueOutcome, ControllerError> {
        let idx = self
            .timeline
            .cues
            .index_of(cue)
            .ok_or(ControllerError::CueNotFound(cue))?;

        let timeline = Arc::clone(&self.timeline);
        let Some(target) = timeline.cues.get(idx) else {
            return Err(ControllerError::CueNotFound(cue));
        };
        if deny_if_private && target.private {
            return Err(ControllerError::PrivateCue(target.name.clone()));
        }
        if let Some(blocking) = self.blocking_cue_name() {
            return Err(ControllerError::Blocked(blocking));
        }

        Ok(self.execute_cue(idx, 0, 0))
    }

    fn blocking_cue_name(&self) -> Option<String> {
        let pending = self.pending.as_ref()?;
        self.timeline
            .cues
            .get(pending.cue)
            .map(|c| c.name.clone())
    }

    /// Run a cue's side effects starting at capacity use `first_op`
    ///
    /// `first_op > 0` resumes a cue that was blocked, so its condition and
    /// assignments have already been applied.
    fn execute_cue(&mut self, idx: usize, first_op: usize, depth: usize) -> CueOutcome {
        let timeline = Arc::clone(&self.timeline);
        let Some(cue) = timeline.cues.get(idx) else {
            return CueOutcome::Skipped;
        };

        if first_op == 0 {
            if let Some(condition) = &cue.condition {
                match condition.evaluate(&self.locals, self.context.globals()) {
                    Ok(true) => {}
                    Ok(false) => {
                        trace!(cue = %cue.name, "condition false, skipping");
                        return CueOutcome::Skipped;
                    }
                    Err(e) => {
                        warn!(cue = %cue.name, "condition failed, skipping: {e}");
                        return CueOutcome::Skipped;
                    }
                }
            }

            for assignment in &cue.assignments {
                if let Err(e) = assignment.apply(&self.locals, self.context.globals()) {
                    warn!(cue = %cue.name, "assignment failed: {e}");
                }
            }
        }

        for (op_idx, usage) in cue.capacities.iter().enumerate().skip(first_op) {
            let Some(capacity) = self.context.capacity(usage.capacity).cloned() else {
                warn!(cue = %cue.name, capacity = %usage.capacity, "capacity no longer exists");
                continue;
            };

            match usage.op {
                CapacityOp::Acquire(amount) => {
                    let acquisition = self
                        .acquisitions
                        .entry(usage.capacity)
                        .or_insert_with(|| Acquisition::new(Arc::clone(&capacity)));
                    let signal = WaitSignal::new(format!("{}: {}", timeline.name, cue.name));

                    match acquisition.ensure(amount, signal.clone()) {
                        Ok(true) => {}
                        Ok(false) => {
                            info!(
                                cue = %cue.name,
                                capacity = %capacity.name(),
                                amount,
                                "waiting for capacity"
                            );
                            self.pending = Some(PendingWait {
                                cue: idx,
                                op: op_idx,
                                depth,
                                signal,
                                capacity: usage.capacity,
                            });
                            self.enter_waiting();
                            return CueOutcome::Waiting;
                        }
                        Err(e) => warn!(cue = %cue.name, "capacity request failed: {e}"),
                    }
                }
                CapacityOp::Release(amount) => {
                    if let Some(acquisition) = self.acquisitions.get(&usage.capacity) {
                        if let Err(e) = acquisition.release(amount) {
                            warn!(cue = %cue.name, "capacity release failed: {e}");
                        }
                    }
                }
                CapacityOp::ReleaseAll => {
                    if let Some(acquisition) = self.acquisitions.get(&usage.capacity) {
                        if let Err(e) = acquisition.release_all() {
                            warn!(cue = %cue.name, "capacity release failed: {e}");
                        }
                    }
                }
            }
        }

        debug!(cue = %cue.name, time = %cue.time, "cue fired");
        self.apply_action(cue.action);

        if let Some(link) = cue.link {
            if depth + 1 >= MAX_TRIGGER_DEPTH {
                warn!(cue = %cue.name, "linked cue chain too deep, not following");
            } else if let Some(target) = timeline.cues.index_of(link) {
                return self.execute_cue(target, 0, depth + 1);
            } else {
                warn!(cue = %cue.name, link = %link, "linked cue no longer exists");
            }
        }

        CueOutcome::Completed
    }

    fn enter_waiting(&mut self) {
        match self.state {
            PlaybackState::Playing => self.state = PlaybackState::Waiting,
            PlaybackState::Paused => self.resume_waiting = true,
            PlaybackState::Stopped | PlaybackState::Waiting => {}
        }
    }

    fn apply_action(&mut self, action: CueAction) {
        let result = match action {
            CueAction::None => Ok(()),
            CueAction::Start => self.play(),
            CueAction::Pause => self.pause(),
            CueAction::Stop => {
                self.stop();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(timeline = %self.timeline.name, "cue action ignored: {e}");
        }
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// Advance by `diff` of wall time (scaled by the playback speed)
    pub fn update(&mut self, diff: Time) {
        if !self.state.is_running() {
            return;
        }

        let new_cursor = self.cursor + diff.scaled(self.speed);

        // The tick that reaches the end also fires cues placed exactly at it
        let scan_until = match self.timeline.length {
            Some(length) if new_cursor >= length => new_cursor.max(length + Time(1)),
            _ => new_cursor,
        };

        if self.resolve_pending() {
            self.scan_cues(scan_until);
        }

        // A cue may have stopped or jumped this Controller
        if !self.state.is_running() {
            return;
        }

        self.cursor = new_cursor;
        for active in &mut self.players {
            active.player.tick(new_cursor);
        }

        if let Some(length) = self.timeline.length {
            if self.cursor >= length && self.pending.is_none() {
                info!(timeline = %self.timeline.name, "reached end of timeline");
                self.stop();
            }
        }
    }

    /// Finish the blocked cue if its grant arrived; true if the scan may run
    fn resolve_pending(&mut self) -> bool {
        let Some(pending) = &self.pending else {
            return true;
        };
        if pending.signal.take().is_none() {
            return false;
        }

        let Some(pending) = self.pending.take() else {
            return true;
        };
        self.state = PlaybackState::Playing;
        debug!(timeline = %self.timeline.name, "capacity granted, resuming cue");
        self.execute_cue(pending.cue, pending.op + 1, pending.depth) != CueOutcome::Waiting
            && self.state.is_running()
    }

    fn scan_cues(&mut self, until: Time) {
        while self.state.is_running() && self.pending.is_none() {
            let Some(cue) = self.timeline.cues.get(self.next_cue) else {
                break;
            };
            if cue.time >= until {
                break;
            }

            let idx = self.next_cue;
            self.next_cue += 1;
            self.execute_cue(idx, 0, 0);
        }
    }

    /// Earliest upcoming event of the cue list or any active player
    pub fn next_event(&self, after: Time) -> Option<Time> {
        let next_cue = self
            .timeline
            .cues
            .iter()
            .skip(self.next_cue)
            .map(|c| c.time)
            .find(|t| *t >= after);

        self.players
            .iter()
            .filter_map(|p| p.player.next_event(after))
            .chain(next_cue)
            .min()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("timeline", &self.timeline.name)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("players", &self.players.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}
