//! Integration tests for Controller playback against shared capacities

mod common;

use std::sync::Arc;

use common::{root_controller, run, PlayerEvent, RecordingTrack};
use pretty_assertions::assert_eq;
use stagehand::{
    Assignment, Capacity, CapacityDefinition, ControllerError, Cue, PlaybackState, RunMode, Show,
    Time, Timeline, Value, Variable, VariableId,
};

/// A show whose root timeline has one recording track, a "fog" capacity,
/// and a flag variable per marker cue
struct Fixture {
    show: Show,
    fog: Arc<Capacity>,
    track: Arc<RecordingTrack>,
}

fn fixture(fog_initial: u32, build: impl FnOnce(&mut Timeline, &Arc<Capacity>)) -> Fixture {
    let mut show = Show::new("playback");
    let fog = show.add_capacity(CapacityDefinition::new("fog", fog_initial));
    let track = RecordingTrack::new("lights");

    let mut timeline = Timeline::new("main");
    timeline.add_track(track.clone());
    build(&mut timeline, &fog);
    show.add_timeline(timeline);

    Fixture { show, fog, track }
}

fn flag(timeline: &mut Timeline, name: &str) -> VariableId {
    timeline
        .variables
        .add(Variable::new(name, Value::Bool(false)))
}

fn marker(name: &str, ms: i64, flag: VariableId) -> Cue {
    Cue::new(name, Time(ms)).assign(Assignment {
        variable: flag,
        value: Value::Bool(true),
    })
}

fn is_set(controller: &stagehand::Controller, name: &str) -> bool {
    controller.locals().get_by_name(name) == Some(Value::Bool(true))
}

#[test]
fn test_blocked_cue_holds_scan_while_time_advances() {
    let Fixture { show, fog, track } = fixture(0, |timeline, fog| {
        let after = flag(timeline, "after");
        timeline.add_cue(Cue::new("grab", Time(1000)).acquire(fog.id(), 1));
        timeline.add_cue(marker("after", 1500, after));
    });
    let (_context, mut controller) = root_controller(show);

    controller.play().unwrap();
    run(&mut controller, Time(100), 20);

    assert_eq!(controller.state(), PlaybackState::Waiting);
    assert_eq!(controller.position(), Time(2000));
    assert!(!is_set(&controller, "after"));
    assert!(controller.pending_cue().is_some());
    assert_eq!(fog.waiting_list().len(), 1);

    let ticks = track.ticks();
    assert_eq!(ticks.len(), 20);
    assert_eq!(ticks.last(), Some(&Time(2000)));
    assert!(ticks.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_grant_resumes_scan_within_same_tick() {
    let Fixture { show, fog, .. } = fixture(0, |timeline, fog| {
        let after = flag(timeline, "after");
        timeline.add_cue(Cue::new("grab", Time(1000)).acquire(fog.id(), 1));
        timeline.add_cue(marker("after", 1500, after));
    });
    let (_context, mut controller) = root_controller(show);

    controller.play().unwrap();
    run(&mut controller, Time(100), 20);
    assert_eq!(controller.state(), PlaybackState::Waiting);

    fog.set_initial_value(1).unwrap();
    assert_eq!(fog.outstanding(), 1);

    controller.update(Time(100));
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert!(is_set(&controller, "after"));
    assert_eq!(controller.held(fog.id()), 1);
    assert_eq!(controller.position(), Time(2100));
}

#[test]
fn test_trigger_while_blocked_is_refused() {
    let mut other = None;
    let Fixture { show, .. } = fixture(0, |timeline, fog| {
        timeline.add_cue(Cue::new("grab", Time(0)).acquire(fog.id(), 1));
        other = Some(timeline.add_cue(Cue::new("other", Time(5000))));
    });
    let (_context, mut controller) = root_controller(show);

    controller.play().unwrap();
    controller.update(Time(10));
    assert_eq!(controller.state(), PlaybackState::Waiting);

    let other = other.unwrap();
    assert!(matches!(
        controller.trigger(other, true),
        Err(ControllerError::Blocked(name)) if name == "grab"
    ));
    assert!(matches!(controller.fire(), Err(ControllerError::Blocked(_))));
}

#[test]
fn test_stop_from_any_state_returns_everything() {
    for target in [
        PlaybackState::Playing,
        PlaybackState::Waiting,
        PlaybackState::Paused,
    ] {
        let Fixture { show, fog, track } = fixture(1, |timeline, fog| {
            timeline.add_cue(Cue::new("first", Time(0)).acquire(fog.id(), 1));
            timeline.add_cue(Cue::new("second", Time(100)).acquire(fog.id(), 2));
        });
        let (_context, mut controller) = root_controller(show);

        controller.play().unwrap();
        controller.update(Time(50));
        assert_eq!(fog.outstanding(), 1);
        match target {
            PlaybackState::Waiting => controller.update(Time(100)),
            PlaybackState::Paused => controller.pause().unwrap(),
            _ => {}
        }
        assert_eq!(controller.state(), target);

        controller.stop();

        assert_eq!(controller.state(), PlaybackState::Stopped);
        assert_eq!(controller.active_players(), 0);
        assert_eq!(controller.pending_cue(), None);
        assert_eq!(controller.position(), Time::zero());
        assert!(controller.stopped_at().is_some());
        assert_eq!(fog.outstanding(), 0);
        assert_eq!(fog.value(), 1);
        assert!(fog.waiting_list().is_empty());
        assert_eq!(track.events().last(), Some(&PlayerEvent::Stop));
    }
}

#[test]
fn test_jump_never_refires_skipped_cues() {
    let Fixture { show, track, .. } = fixture(1, |timeline, _| {
        let early = flag(timeline, "early");
        let skipped = flag(timeline, "skipped");
        let late = flag(timeline, "late");
        timeline.add_cue(marker("early", 100, early));
        timeline.add_cue(marker("skipped", 500, skipped));
        timeline.add_cue(marker("late", 1500, late));
    });
    let (_context, mut controller) = root_controller(show);

    controller.play().unwrap();
    controller.update(Time(200));
    assert!(is_set(&controller, "early"));

    controller.jump(Time(1000));
    assert!(track.events().contains(&PlayerEvent::Jump(Time(1000), false)));
    run(&mut controller, Time(250), 4);

    assert!(!is_set(&controller, "skipped"));
    assert!(is_set(&controller, "late"));
    assert_eq!(controller.position(), Time(2000));
}

#[test]
fn test_jump_abandons_blocked_cue() {
    let Fixture { show, fog, .. } = fixture(0, |timeline, fog| {
        let after = flag(timeline, "after");
        timeline.add_cue(Cue::new("grab", Time(100)).acquire(fog.id(), 1));
        timeline.add_cue(marker("after", 2000, after));
    });
    let (_context, mut controller) = root_controller(show);

    controller.play().unwrap();
    controller.update(Time(200));
    assert_eq!(controller.state(), PlaybackState::Waiting);

    controller.jump(Time(1500));
    assert_eq!(controller.state(), PlaybackState::Playing);
    assert!(fog.waiting_list().is_empty());

    controller.update(Time(600));
    assert!(is_set(&controller, "after"));

    // A later grant no longer reaches the abandoned cue
    fog.set_initial_value(1).unwrap();
    assert_eq!(fog.outstanding(), 0);
}

#[test]
fn test_run_mode_filters_players() {
    let mut show = Show::new("modes");
    let master = RecordingTrack::only_in("master lights", RunMode::Master);
    let client = RecordingTrack::only_in("client audio", RunMode::Client);
    let both = RecordingTrack::new("video");

    let mut timeline = Timeline::new("main");
    timeline.add_track(master.clone());
    timeline.add_track(client.clone());
    timeline.add_track(both.clone());
    show.add_timeline(timeline);

    let context = show.open().unwrap();
    let timeline = Arc::clone(context.root_timeline());
    let locals = stagehand::VariableScope::new(timeline.variables.clone());
    let mut controller =
        stagehand::Controller::new(timeline, Arc::clone(&context), locals, RunMode::Client);

    controller.play().unwrap();
    controller.update(Time(10));

    assert_eq!(controller.active_players(), 2);
    assert!(master.events().is_empty());
    assert_eq!(client.events(), vec![PlayerEvent::Start(Time(0)), PlayerEvent::Tick(Time(10))]);
    assert_eq!(both.ticks(), vec![Time(10)]);
}

#[test]
fn test_two_controllers_share_capacity_in_order() {
    let mut show = Show::new("shared");
    let fog = show.add_capacity(CapacityDefinition::new("fog", 1));

    let mut first = Timeline::new("first");
    first.add_cue(Cue::new("grab", Time(0)).acquire(fog.id(), 1));
    first.add_cue(Cue::new("drop", Time(1000)).release_all(fog.id()));
    let first_id = show.add_timeline(first);

    let mut second = Timeline::new("second");
    let got = flag(&mut second, "got");
    second.add_cue(
        Cue::new("grab", Time(0))
            .acquire(fog.id(), 1)
            .assign(Assignment {
                variable: got,
                value: Value::Bool(true),
            }),
    );
    let second_id = show.add_timeline(second);

    let context = show.open().unwrap();
    let controller_for = |id| {
        let timeline = Arc::clone(context.timeline(id).unwrap());
        let locals = stagehand::VariableScope::new(timeline.variables.clone());
        stagehand::Controller::new(timeline, Arc::clone(&context), locals, RunMode::Master)
    };
    let mut a = controller_for(first_id);
    let mut b = controller_for(second_id);

    a.play().unwrap();
    b.play().unwrap();
    a.update(Time(100));
    b.update(Time(100));
    assert_eq!(a.held(fog.id()), 1);
    assert_eq!(b.state(), PlaybackState::Waiting);

    run(&mut a, Time(500), 2);
    assert_eq!(a.held(fog.id()), 0);

    b.update(Time(100));
    assert_eq!(b.state(), PlaybackState::Playing);
    assert_eq!(b.held(fog.id()), 1);
    assert_eq!(fog.outstanding(), 1);

    drop(b);
    assert_eq!(fog.outstanding(), 0);
}
