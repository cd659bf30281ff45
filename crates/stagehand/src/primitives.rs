//! Core primitives for stagehand
//!
//! Time, run mode, and playback state types shared by every scheduler component.

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a timeline in a show
pub type TimelineId = Uuid;

/// Identifier of a track inside a timeline
pub type TrackId = Uuid;

/// Identifier of a cue inside a timeline's cue list
pub type CueId = Uuid;

/// Identifier of a capacity
pub type CapacityId = Uuid;

/// Identifier of a variable declaration
pub type VariableId = Uuid;

// =============================================================================
// TIME
// =============================================================================

/// Position on a timeline, in milliseconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Time(pub i64);

impl Time {
    pub fn zero() -> Self {
        Self(0)
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self((seconds * 1000.0).round() as i64)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Scale a delta by a playback speed, rounding to the nearest millisecond
    pub fn scaled(self, speed: f64) -> Self {
        Self((self.0 as f64 * speed).round() as i64)
    }
}

impl Add for Time {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Time(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Time {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for Time {
    fn from(d: Duration) -> Self {
        Time(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// =============================================================================
// RUN MODE
// =============================================================================

/// Which side of a master/client deployment this process plays
///
/// Tracks declare which modes they can run in; a Controller only starts
/// players for tracks that support its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Master,
    Client,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(RunMode::Master),
            "client" => Ok(RunMode::Client),
            other => Err(format!("unknown run mode: {other}")),
        }
    }
}

// =============================================================================
// PLAYBACK STATE
// =============================================================================

/// Playback state of one Controller
///
/// `Waiting` is a sub-state of playing: time advances and players tick,
/// but the cue scan is held until a capacity request is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    Waiting,
}

impl PlaybackState {
    /// Whether time advances in this state
    pub fn is_running(&self) -> bool {
        matches!(self, PlaybackState::Playing | PlaybackState::Waiting)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Waiting => "waiting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_arithmetic_saturates() {
        assert_eq!(Time(5) + Time(7), Time(12));
        assert_eq!(Time(i64::MAX) + Time(1), Time(i64::MAX));
        assert_eq!(Time(3) - Time(10), Time(-7));
    }

    #[test]
    fn test_time_conversions() {
        assert_eq!(Time::from_secs_f64(1.25), Time(1250));
        assert_eq!(Time::from(Duration::from_millis(40)), Time(40));
        assert_eq!(Time(100).scaled(0.5), Time(50));
        assert_eq!(Time(1500).to_string(), "1500ms");
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("master".parse::<RunMode>(), Ok(RunMode::Master));
        assert_eq!("Client".parse::<RunMode>(), Ok(RunMode::Client));
        assert!("observer".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_running_states() {
        assert!(PlaybackState::Playing.is_running());
        assert!(PlaybackState::Waiting.is_running());
        assert!(!PlaybackState::Paused.is_running());
        assert!(!PlaybackState::Stopped.is_running());
    }
}
