//! Minimal configuration loading for Stagehand.
//!
//! This crate provides configuration loading with minimal dependencies,
//! so the scheduler core and the binary can share one definition.
//!
//! # Usage
//!
//! ```rust,no_run
//! use stageconf::StageConfig;
//!
//! let config = StageConfig::load().expect("Failed to load config");
//! println!("ticking at {} Hz", config.playback.tick_hz);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/stagehand/config.toml` (system)
//! 2. `~/.config/stagehand/config.toml` (user)
//! 3. `./stagehand.toml` (local override, or the path given on the command line)
//! 4. Environment variables (`STAGEHAND_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [playback]
//! tick_hz = 50
//! run_mode = "master"
//! speed = 1.0
//!
//! [telemetry]
//! log_level = "info"
//! ```

pub mod loader;
pub mod settings;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use settings::{PlaybackConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete Stagehand configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageConfig {
    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl StageConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./stagehand.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = StageConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.playback.tick_hz == 0 {
            return Err(ConfigError::Invalid {
                key: "playback.tick_hz".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(self.playback.speed.is_finite() && self.playback.speed > 0.0) {
            return Err(ConfigError::Invalid {
                key: "playback.speed".to_string(),
                message: format!("{} is not a positive speed", self.playback.speed),
            });
        }
        if !matches!(self.playback.run_mode.as_str(), "master" | "client") {
            return Err(ConfigError::Invalid {
                key: "playback.run_mode".to_string(),
                message: format!(
                    "expected \"master\" or \"client\", got {:?}",
                    self.playback.run_mode
                ),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# Stagehand Configuration\n\n");

        output.push_str("[playback]\n");
        output.push_str(&format!("tick_hz = {}\n", self.playback.tick_hz));
        output.push_str(&format!("run_mode = \"{}\"\n", self.playback.run_mode));
        output.push_str(&format!("speed = {:?}\n", self.playback.speed));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StageConfig::default();
        assert_eq!(config.playback.tick_hz, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_round_trips_through_loader() {
        let mut config = StageConfig::default();
        config.playback.run_mode = "client".to_string();
        config.playback.speed = 1.5;

        let toml = config.to_toml();
        assert!(toml.contains("[playback]"));
        assert!(toml.contains("[telemetry]"));

        let parsed = loader::parse_toml(&toml, std::path::Path::new("rendered.toml")).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_unknown_run_mode() {
        let mut config = StageConfig::default();
        config.playback.run_mode = "observer".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_speed() {
        let mut config = StageConfig::default();
        config.playback.speed = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");
        std::fs::write(&path, "[playback]\ntick_hz = 40\n").unwrap();

        let (config, sources) = StageConfig::load_with_sources_from(Some(&path)).unwrap();
        assert!(sources.files.contains(&path));
        // An env override could change tick_hz on a developer machine
        if !sources.env_overrides.iter().any(|k| k == "STAGEHAND_TICK_HZ") {
            assert_eq!(config.playback.tick_hz, 40);
        }
    }
}
