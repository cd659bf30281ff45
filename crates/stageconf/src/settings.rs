//! Runtime settings sections - playback driver and telemetry.

use serde::{Deserialize, Serialize};

/// How the tick driver advances the show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Scheduler ticks per second.
    /// Default: 50
    #[serde(default = "PlaybackConfig::default_tick_hz")]
    pub tick_hz: u32,

    /// Which track players this process runs ("master" or "client").
    /// Default: master
    #[serde(default = "PlaybackConfig::default_run_mode")]
    pub run_mode: String,

    /// Playback speed applied to the root timeline.
    /// Default: 1.0
    #[serde(default = "PlaybackConfig::default_speed")]
    pub speed: f64,
}

impl PlaybackConfig {
    pub(crate) fn default_tick_hz() -> u32 {
        50
    }

    pub(crate) fn default_run_mode() -> String {
        "master".to_string()
    }

    pub(crate) fn default_speed() -> f64 {
        1.0
    }

    /// Interval between two ticks, in milliseconds.
    pub fn tick_interval_ms(&self) -> u64 {
        (1000 / u64::from(self.tick_hz.max(1))).max(1)
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_hz: Self::default_tick_hz(),
            run_mode: Self::default_run_mode(),
            speed: Self::default_speed(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    pub(crate) fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
