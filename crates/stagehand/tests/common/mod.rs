//! Shared fixtures for stagehand integration tests

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use stagehand::{
    Controller, Playback, Player, RunMode, Show, ShowContext, Time, Track, TrackId,
    VariableScope, Waiting,
};
use uuid::Uuid;

/// Everything a recording player was asked to do, in order
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Start(Time),
    Stop,
    Tick(Time),
    Jump(Time, bool),
    Pause(bool),
}

/// Track whose players log every call into a shared list
pub struct RecordingTrack {
    id: TrackId,
    name: String,
    mode: Option<RunMode>,
    events: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl RecordingTrack {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            mode: None,
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn only_in(name: &str, mode: RunMode) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            mode: Some(mode),
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.events.lock().clone()
    }

    pub fn ticks(&self) -> Vec<Time> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Tick(t) => Some(*t),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Track for RecordingTrack {
    fn id(&self) -> TrackId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, mode: RunMode) -> bool {
        self.mode.map_or(true, |m| m == mode)
    }

    fn create_player(&self) -> Box<dyn Player> {
        Box::new(RecordingPlayer {
            events: Arc::clone(&self.events),
        })
    }
}

struct RecordingPlayer {
    events: Arc<Mutex<Vec<PlayerEvent>>>,
}

impl Player for RecordingPlayer {
    fn start(&mut self, pos: Time, _playback: &Playback, _speed: f64) -> anyhow::Result<()> {
        self.events.lock().push(PlayerEvent::Start(pos));
        Ok(())
    }

    fn stop(&mut self) {
        self.events.lock().push(PlayerEvent::Stop);
    }

    fn tick(&mut self, pos: Time) {
        self.events.lock().push(PlayerEvent::Tick(pos));
    }

    fn jump(&mut self, pos: Time, paused: bool) {
        self.events.lock().push(PlayerEvent::Jump(pos, paused));
    }

    fn pause(&mut self, paused: bool) {
        self.events.lock().push(PlayerEvent::Pause(paused));
    }
}

/// Waiter that records every grant it receives
#[derive(Default)]
pub struct RecordingWaiter {
    pub label: String,
    pub grants: Mutex<Vec<u32>>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingWaiter {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            ..Default::default()
        })
    }

    /// Waiter that also appends its label to a log shared with other waiters
    pub fn logging(label: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            grants: Mutex::new(Vec::new()),
            log: Some(Arc::clone(log)),
        })
    }

    pub fn grants(&self) -> Vec<u32> {
        self.grants.lock().clone()
    }
}

impl Waiting for RecordingWaiter {
    fn acquired(&self, amount: u32) {
        self.grants.lock().push(amount);
        if let Some(log) = &self.log {
            log.lock().push(self.label.clone());
        }
    }

    fn name(&self) -> String {
        self.label.clone()
    }
}

/// Root Controller for a show, plus the context it runs in
pub fn root_controller(show: Show) -> (Arc<ShowContext>, Controller) {
    let context = show.open().expect("show should open");
    let timeline = Arc::clone(context.root_timeline());
    let locals = VariableScope::new(timeline.variables.clone());
    let controller = Controller::new(timeline, Arc::clone(&context), locals, RunMode::Master);
    (context, controller)
}

/// Advance `controller` in `steps` equal ticks of `step` each
pub fn run(controller: &mut Controller, step: Time, steps: usize) {
    for _ in 0..steps {
        controller.update(step);
    }
}
