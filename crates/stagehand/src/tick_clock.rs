//! Monotonic tick clock for the scheduler loop
//!
//! Turns wall clock time into per-tick deltas for `Controller::update`.
//! Uses `std::time::Instant` for monotonic guarantees. Sub-millisecond
//! remainders are carried into the next tick so the sum of deltas never
//! drifts from elapsed real time.

use std::time::{Duration, Instant};

use crate::primitives::Time;

/// Monotonic clock that hands out elapsed time since the previous tick
///
/// While paused or stopped, `tick()` returns zero and the time spent paused
/// is never reported.
#[derive(Debug, Default)]
pub struct TickClock {
    /// Last time the clock was read (None if paused/stopped)
    last_instant: Option<Instant>,

    /// Elapsed time not yet handed out (always under 1ms after a tick)
    carry: Duration,

    /// Total time handed out since the last stop
    elapsed: Duration,
}

impl TickClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or resume) counting from now
    pub fn start(&mut self) {
        if self.last_instant.is_none() {
            self.last_instant = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.last_instant.is_some()
    }

    /// Stop counting, keeping the time not yet handed out
    pub fn pause(&mut self) {
        if let Some(last) = self.last_instant.take() {
            self.carry += last.elapsed();
        }
    }

    /// Stop and forget everything
    pub fn stop(&mut self) {
        self.last_instant = None;
        self.carry = Duration::ZERO;
        self.elapsed = Duration::ZERO;
    }

    /// Called by the tick loop; returns the whole milliseconds since the last tick
    pub fn tick(&mut self) -> Time {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Time {
        let Some(last) = self.last_instant else {
            return Time::zero();
        };

        self.carry += now.saturating_duration_since(last);
        self.last_instant = Some(now);

        let whole_ms = self.carry.as_millis();
        let handed_out = Duration::from_millis(u64::try_from(whole_ms).unwrap_or(u64::MAX));
        self.carry -= handed_out;
        self.elapsed += handed_out;

        Time::from(handed_out)
    }

    /// Total time handed out since the last stop
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_new_clock_is_idle() {
        let mut clock = TickClock::new();
        assert!(!clock.is_running());
        assert_eq!(clock.tick(), Time::zero());
    }

    #[test]
    fn test_start_sets_running() {
        let mut clock = TickClock::new();
        clock.start();
        assert!(clock.is_running());
    }

    #[test]
    fn test_deltas_carry_sub_millisecond_remainder() {
        let mut clock = TickClock::new();
        let base = Instant::now();
        clock.last_instant = Some(base);

        assert_eq!(clock.tick_at(base + Duration::from_micros(1_600)), Time(1));
        assert_eq!(clock.tick_at(base + Duration::from_micros(3_100)), Time(2));
        assert_eq!(clock.tick_at(base + Duration::from_micros(3_500)), Time(0));
        assert_eq!(clock.elapsed(), Duration::from_millis(3));
    }

    #[test]
    fn test_position_advances_with_time() {
        let mut clock = TickClock::new();
        clock.start();

        thread::sleep(Duration::from_millis(50));
        let delta = clock.tick();

        // Allow some tolerance for sleep inaccuracy
        assert!(delta >= Time(50), "delta {delta} should be >= 50ms");
        assert!(delta < Time(500), "delta {delta} should be well under 500ms");
    }

    #[test]
    fn test_pause_excludes_paused_time() {
        let mut clock = TickClock::new();
        clock.start();
        clock.pause();
        assert!(!clock.is_running());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(clock.tick(), Time::zero());

        clock.start();
        let delta = clock.tick();
        assert!(delta < Time(30), "paused time leaked into delta {delta}");
    }

    #[test]
    fn test_stop_resets_elapsed() {
        let mut clock = TickClock::new();
        let base = Instant::now();
        clock.last_instant = Some(base);
        clock.tick_at(base + Duration::from_millis(12));
        assert_eq!(clock.elapsed(), Duration::from_millis(12));

        clock.stop();
        assert!(!clock.is_running());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
