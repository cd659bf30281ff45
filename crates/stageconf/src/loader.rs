//! Config file discovery, loading, and environment variable overlay.

use crate::settings::{PlaybackConfig, TelemetryConfig};
use crate::{ConfigError, StageConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/stagehand/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("stagehand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("stagehand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<StageConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<StageConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = StageConfig::default();

    if let Some(playback) = table.get("playback").and_then(|v| v.as_table()) {
        if let Some(v) = playback.get("tick_hz").and_then(|v| v.as_integer()) {
            config.playback.tick_hz = u32::try_from(v).map_err(|_| ConfigError::Invalid {
                key: "playback.tick_hz".to_string(),
                message: format!("{v} is out of range"),
            })?;
        }
        if let Some(v) = playback.get("run_mode").and_then(|v| v.as_str()) {
            config.playback.run_mode = v.to_string();
        }
        // Accept both `speed = 1` and `speed = 1.0`
        if let Some(v) = playback.get("speed") {
            if let Some(f) = v.as_float() {
                config.playback.speed = f;
            } else if let Some(i) = v.as_integer() {
                config.playback.speed = i as f64;
            }
        }
    }

    if let Some(telemetry) = table.get("telemetry").and_then(|v| v.as_table()) {
        if let Some(v) = telemetry.get("log_level").and_then(|v| v.as_str()) {
            config.telemetry.log_level = v.to_string();
        }
    }

    Ok(config)
}

/// Merge two configs, with `overlay` taking precedence where it differs from defaults.
pub fn merge_configs(base: StageConfig, overlay: StageConfig) -> StageConfig {
    let playback_defaults = PlaybackConfig::default();
    let telemetry_defaults = TelemetryConfig::default();

    StageConfig {
        playback: PlaybackConfig {
            tick_hz: if overlay.playback.tick_hz != playback_defaults.tick_hz {
                overlay.playback.tick_hz
            } else {
                base.playback.tick_hz
            },
            run_mode: if overlay.playback.run_mode != playback_defaults.run_mode {
                overlay.playback.run_mode
            } else {
                base.playback.run_mode
            },
            speed: if overlay.playback.speed != playback_defaults.speed {
                overlay.playback.speed
            } else {
                base.playback.speed
            },
        },
        telemetry: TelemetryConfig {
            log_level: if overlay.telemetry.log_level != telemetry_defaults.log_level {
                overlay.telemetry.log_level
            } else {
                base.telemetry.log_level
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut StageConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup (the environment in production).
pub(crate) fn apply_overrides_from(
    config: &mut StageConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    if let Some(v) = lookup("STAGEHAND_TICK_HZ") {
        if let Ok(hz) = v.parse() {
            config.playback.tick_hz = hz;
            sources.env_overrides.push("STAGEHAND_TICK_HZ".to_string());
        }
    }
    if let Some(v) = lookup("STAGEHAND_RUN_MODE") {
        config.playback.run_mode = v;
        sources.env_overrides.push("STAGEHAND_RUN_MODE".to_string());
    }
    if let Some(v) = lookup("STAGEHAND_SPEED") {
        if let Ok(speed) = v.parse() {
            config.playback.speed = speed;
            sources.env_overrides.push("STAGEHAND_SPEED".to_string());
        }
    }

    if let Some(v) = lookup("STAGEHAND_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("STAGEHAND_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
