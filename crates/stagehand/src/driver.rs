//! Worker thread running the cooperative scheduler loop
//!
//! The [`TickDriver`] owns a named thread that reads the [`TickClock`] at a
//! fixed rate and feeds the delta to [`Instances::update`]. Everything below
//! the root Controller is ticked transitively from that one call, so all
//! Controller state is only ever touched under the one `Instances` lock.
//!
//! ```text
//!  caller thread                     stagehand-tick thread
//!       │ with_instances(|i| ..)            │ clock.tick()
//!       ▼                                   ▼
//!   Mutex<Instances> ◄──────────────── instances.update(delta)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::instances::Instances;
use crate::primitives::PlaybackState;
use crate::tick_clock::TickClock;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("tick driver has not been started")]
    NotStarted,

    #[error("tick driver cannot wait for its own thread")]
    SelfWait,

    #[error("tick driver is already running")]
    AlreadyRunning,

    #[error("tick rate must be at least 1 Hz, got {0}")]
    InvalidRate(u32),

    #[error("failed to spawn tick thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Set by the tick thread when it exits
#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    fn signal(&self) {
        *self.done.lock() = true;
        self.condvar.notify_all();
    }
}

pub struct TickDriver {
    instances: Arc<Mutex<Instances>>,
    tick_interval: Duration,
    exit_when_stopped: bool,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    completion: Arc<Completion>,
    thread_handle: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl TickDriver {
    pub fn new(instances: Instances, tick_hz: u32) -> Result<Self, DriverError> {
        Ok(Self {
            instances: Arc::new(Mutex::new(instances)),
            tick_interval: interval_for(tick_hz)?,
            exit_when_stopped: false,
            running: Arc::new(AtomicBool::new(false)),
            ticks: Arc::new(AtomicU64::new(0)),
            completion: Arc::new(Completion::default()),
            thread_handle: None,
            thread_id: None,
        })
    }

    /// End the loop once the root Controller is stopped
    pub fn exit_when_stopped(mut self, exit: bool) -> Self {
        self.exit_when_stopped = exit;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Change the tick rate; only allowed before the thread starts
    pub fn set_tick_rate(&mut self, tick_hz: u32) -> Result<(), DriverError> {
        if self.is_running() {
            error!("tick rate change requested while running");
            return Err(DriverError::AlreadyRunning);
        }
        self.tick_interval = interval_for(tick_hz)?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of ticks processed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run `f` with exclusive access to the Controller tree
    pub fn with_instances<R>(&self, f: impl FnOnce(&mut Instances) -> R) -> R {
        f(&mut self.instances.lock())
    }

    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.is_running() || self.thread_handle.is_some() {
            return Err(DriverError::AlreadyRunning);
        }

        *self.completion.done.lock() = false;
        self.running.store(true, Ordering::Release);

        let instances = Arc::clone(&self.instances);
        let running = Arc::clone(&self.running);
        let ticks = Arc::clone(&self.ticks);
        let completion = Arc::clone(&self.completion);
        let interval = self.tick_interval;
        let exit_when_stopped = self.exit_when_stopped;

        let spawned = thread::Builder::new()
            .name("stagehand-tick".to_string())
            .spawn(move || {
                run_tick_loop(&instances, &running, &ticks, interval, exit_when_stopped);
                running.store(false, Ordering::Release);
                completion.signal();
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        self.thread_id = Some(handle.thread().id());
        self.thread_handle = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "tick driver started");
        Ok(())
    }

    /// Block until the tick thread exits, or until `timeout` passes
    ///
    /// Returns whether the thread has finished.
    pub fn wait_for_completion(&mut self, timeout: Option<Duration>) -> Result<bool, DriverError> {
        let Some(thread_id) = self.thread_id else {
            error!("wait_for_completion called before start");
            return Err(DriverError::NotStarted);
        };
        if thread::current().id() == thread_id {
            error!("wait_for_completion called from the tick thread");
            return Err(DriverError::SelfWait);
        }

        {
            let mut done = self.completion.done.lock();
            match timeout {
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while !*done {
                        if self
                            .completion
                            .condvar
                            .wait_until(&mut done, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                }
                None => {
                    while !*done {
                        self.completion.condvar.wait(&mut done);
                    }
                }
            }
            if !*done {
                return Ok(false);
            }
        }

        self.join();
        Ok(true)
    }

    /// Ask the tick thread to exit and wait for it
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.thread_handle.is_some() {
            debug!("waiting for tick thread to stop...");
            self.join();
            info!(ticks = self.ticks(), "tick driver stopped");
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("tick thread panicked");
            }
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn interval_for(tick_hz: u32) -> Result<Duration, DriverError> {
    if tick_hz == 0 {
        return Err(DriverError::InvalidRate(tick_hz));
    }
    Ok(Duration::from_secs_f64(1.0 / f64::from(tick_hz)))
}

fn run_tick_loop(
    instances: &Mutex<Instances>,
    running: &AtomicBool,
    ticks: &AtomicU64,
    interval: Duration,
    exit_when_stopped: bool,
) {
    let mut clock = TickClock::new();
    clock.start();
    let mut deadline = Instant::now() + interval;

    while running.load(Ordering::Acquire) {
        let delta = clock.tick();
        {
            let mut instances = instances.lock();
            instances.update(delta);
            if exit_when_stopped && instances.root().state() == PlaybackState::Stopped {
                debug!("root stopped, leaving tick loop");
                break;
            }
        }
        ticks.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            trace!(late_us = (now - deadline).as_micros() as u64, "tick overran");
            deadline = now;
        }
        deadline += interval;
    }
}
