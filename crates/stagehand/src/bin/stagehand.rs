//! Stagehand binary
//!
//! Loads configuration, builds a small demonstration show, and plays it on
//! the tick driver until the show ends, `--seconds` elapse, or Ctrl-C.
//!
//! The demo show contends for a single fog machine: a crowd-wave instance
//! grabs it first, so the root timeline's own fog cue waits until the wave
//! hands it back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stageconf::StageConfig;
use stagehand::{
    Assignment, Capacities, Capacity, CapacityDefinition, Comparison, Condition, Cue, CueAction,
    InstancerTrack, Instances, Playback, Player, RunMode, Show, ShowContext, TickDriver, Time,
    Timeline, Track, TrackId, Value, Variable, View,
};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Show-control playback scheduler")]
#[command(version)]
struct Cli {
    /// Config file (takes precedence over ./stagehand.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds even if the show is still running
    #[arg(short, long)]
    seconds: Option<f64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = StageConfig::load_with_sources_from(cli.config.as_deref())
        .context("failed to load configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.telemetry.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();

    info!("stagehand {} starting", env!("CARGO_PKG_VERSION"));
    for path in &sources.files {
        info!(path = %path.display(), "loaded config");
    }
    for key in &sources.env_overrides {
        debug!(key = %key, "config overridden from environment");
    }

    let run_mode: RunMode = config
        .playback
        .run_mode
        .parse()
        .map_err(anyhow::Error::msg)?;

    let context = demo_show()?;
    let mut instances = Instances::new(Arc::clone(&context), run_mode);
    instances.root_mut().set_speed(config.playback.speed)?;
    instances.root_mut().play()?;

    let mut driver = TickDriver::new(instances, config.playback.tick_hz)?.exit_when_stopped(true);
    driver.start()?;

    let limit = cli.seconds.map(Duration::from_secs_f64);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = wait_for_idle(&driver, limit) => {}
    }
    driver.stop();

    let snapshot = driver.with_instances(|instances| instances.list());
    info!("final state:\n{}", serde_json::to_string_pretty(&snapshot)?);
    for capacity in context.capacities().iter() {
        info!(
            capacity = %capacity.name(),
            value = capacity.value(),
            outstanding = capacity.outstanding(),
            "capacity"
        );
    }

    driver.with_instances(|instances| instances.close())?;
    info!(ticks = driver.ticks(), "stagehand shutdown complete");
    Ok(())
}

/// Resolve once the driver has finished or `limit` has passed
async fn wait_for_idle(driver: &TickDriver, limit: Option<Duration>) {
    let started = tokio::time::Instant::now();
    let mut poll = tokio::time::interval(Duration::from_millis(50));
    loop {
        poll.tick().await;
        if !driver.is_running() {
            return;
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            info!("time limit reached");
            return;
        }
    }
}

// =============================================================================
// DEMO SHOW
// =============================================================================

/// Logs every capacity change at debug level
struct LogView;

impl View for LogView {
    fn capacity_changed(&self, capacity: &Capacity) {
        debug!(
            capacity = %capacity.name(),
            value = capacity.value(),
            outstanding = capacity.outstanding(),
            queued = capacity.waiting_list().len(),
            "capacity changed"
        );
    }
}

/// Stand-in output track that only reports what it is asked to do
struct LogTrack {
    id: TrackId,
    name: String,
    mode: Option<RunMode>,
}

impl LogTrack {
    fn new(name: &str, mode: Option<RunMode>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            mode,
        }
    }
}

impl Track for LogTrack {
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
        Box::new(LogPlayer {
            name: self.name.clone(),
            ticks: 0,
        })
    }
}

struct LogPlayer {
    name: String,
    ticks: u64,
}

impl Player for LogPlayer {
    fn start(&mut self, pos: Time, _playback: &Playback, speed: f64) -> anyhow::Result<()> {
        info!(track = %self.name, position = %pos, speed, "output started");
        Ok(())
    }

    fn stop(&mut self) {
        info!(track = %self.name, ticks = self.ticks, "output stopped");
    }

    fn tick(&mut self, _pos: Time) {
        self.ticks += 1;
    }

    fn jump(&mut self, pos: Time, paused: bool) {
        debug!(track = %self.name, position = %pos, paused, "output resynchronized");
    }
}

fn demo_show() -> Result<Arc<ShowContext>> {
    let mut show = Show::new("demo").with_capacities(Capacities::with_view(Arc::new(LogView)));
    let fog = show
        .add_capacity(
            CapacityDefinition::new("fog machines", 1).with_description("stage left hazer"),
        )
        .id();

    // Sub-timeline spawned by the instancer
    let mut wave = Timeline::new("crowd wave").with_length(Time::from_secs_f64(3.0));
    let intensity = wave
        .variables
        .add(Variable::new("intensity", Value::Number(0.0)).input());
    let wave_done = wave
        .variables
        .add(Variable::new("done", Value::Bool(false)).output());
    wave.add_track(Arc::new(LogTrack::new("wave lights", None)));
    wave.add_cue(Cue::new("wave start", Time::zero()).acquire(fog, 1));
    wave.add_cue(
        Cue::new("wave peak", Time::from_secs_f64(1.5))
            .with_condition(Condition::new(intensity, Comparison::Gt, Value::Number(0.5)))
            .assign(Assignment {
                variable: wave_done,
                value: Value::Bool(true),
            })
            .release_all(fog),
    );
    let encore = wave.add_cue(Cue::new("encore", Time::from_secs_f64(30.0)));
    let wave_id = wave.id;

    // Root timeline
    let mut main = Timeline::new("main").with_length(Time::from_secs_f64(6.0));
    let crowd_done = main
        .variables
        .add(Variable::new("crowd_done", Value::Bool(false)));
    main.add_track(Arc::new(LogTrack::new("lights", Some(RunMode::Master))));
    main.add_track(Arc::new(LogTrack::new("house audio", Some(RunMode::Client))));

    let crowd = Arc::new(InstancerTrack::new("crowd"));
    crowd.set_timeline(Some(wave_id))?;
    crowd.set_parameter(intensity, "0.8");
    crowd.set_outlet(wave_done, crowd_done);
    crowd.add_trigger(Time::from_secs_f64(2.0), encore);
    main.add_track(crowd);

    main.add_cue(Cue::new("fog burst", Time::from_secs_f64(1.0)).acquire(fog, 1));
    main.add_cue(Cue::new("fog off", Time::from_secs_f64(2.5)).release_all(fog));
    let house_lights = main.add_cue(Cue::new("house lights", Time::from_secs_f64(4.5)).private());
    main.add_cue(
        Cue::new("finale", Time::from_secs_f64(4.0))
            .with_condition(Condition::new(crowd_done, Comparison::Eq, Value::Bool(true)))
            .link_to(house_lights),
    );
    main.add_cue(Cue::new("curtain", Time::from_secs_f64(5.5)).with_action(CueAction::Stop));

    show.add_timeline(main);
    show.add_timeline(wave);

    Ok(show.open()?)
}
