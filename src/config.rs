//! Runtime configuration: CLI flags layered over the persistent user config.
//!
//! The user config lives at `<config dir>/nightshield/config.toml` (or under
//! `NIGHTSHIELD_CONFIG_DIR`). Flags given on the command line or through their
//! env vars always win over file values.

use anyhow::{bail, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_WINDOW_MS: f64 = 1000.0;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_METER_SECS: u64 = 10;
pub const MAX_METER_SECS: u64 = 24 * 60 * 60;

const CONFIG_FILE: &str = "config.toml";
const CONFIG_DIR_ENV: &str = "NIGHTSHIELD_CONFIG_DIR";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "nightshield",
    about = "NightShield noise monitor: microphone level sampling with a JSON command bridge",
    version
)]
pub struct AppConfig {
    /// Averaging window for --meter mode (ms)
    #[arg(long = "window-ms", default_value_t = DEFAULT_WINDOW_MS, allow_negative_numbers = true)]
    pub window_ms: f64,

    /// Input device name (defaults to the system default microphone)
    #[arg(long = "input-device", env = "NIGHTSHIELD_INPUT_DEVICE")]
    pub input_device: Option<String>,

    /// Sample a synthetic constant-amplitude signal instead of a microphone
    #[arg(long = "synthetic-level", allow_negative_numbers = true)]
    pub synthetic_level: Option<i16>,

    /// Print noise levels to stdout instead of serving the JSON bridge
    #[arg(long = "meter", default_value_t = false)]
    pub meter: bool,

    /// How long --meter mode runs (seconds)
    #[arg(long = "meter-secs", default_value_t = DEFAULT_METER_SECS)]
    pub meter_secs: u64,

    /// Max wait for the sampler to release the input on shutdown (ms)
    #[arg(long = "stop-timeout-ms", default_value_t = DEFAULT_STOP_TIMEOUT_MS)]
    pub stop_timeout_ms: u64,

    /// List audio input devices and exit
    #[arg(long = "list-input-devices", default_value_t = false)]
    pub list_input_devices: bool,

    /// Write JSON trace logs
    #[arg(long = "logs", default_value_t = false)]
    pub logs: bool,

    /// Disable all logging (overrides --logs)
    #[arg(long = "no-logs", default_value_t = false)]
    pub no_logs: bool,

    /// Trace log path (defaults to NIGHTSHIELD_TRACE_LOG or the temp dir)
    #[arg(long = "log-path")]
    pub log_path: Option<PathBuf>,
}

/// Persisted preferences. Unknown keys are ignored for forward compatibility.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub window_ms: Option<f64>,
    pub input_device: Option<String>,
    pub stop_timeout_ms: Option<u64>,
}

impl AppConfig {
    /// Parse process args and merge the persistent user config underneath.
    pub fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches, &load_user_config())
    }

    pub fn from_matches(matches: &ArgMatches, user: &UserConfig) -> Result<Self> {
        let mut config = Self::from_arg_matches(matches)?;
        config.apply_user_config(user, matches);
        Ok(config)
    }

    fn apply_user_config(&mut self, user: &UserConfig, matches: &ArgMatches) {
        if !set_explicitly(matches, "window_ms") {
            if let Some(window_ms) = user.window_ms {
                self.window_ms = window_ms;
            }
        }
        if !set_explicitly(matches, "input_device") && user.input_device.is_some() {
            self.input_device = user.input_device.clone();
        }
        if !set_explicitly(matches, "stop_timeout_ms") {
            if let Some(timeout) = user.stop_timeout_ms {
                self.stop_timeout_ms = timeout;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.window_ms.is_finite() || self.window_ms <= 0.0 {
            bail!(
                "--window-ms must be a positive number of milliseconds (got {})",
                self.window_ms
            );
        }
        if self.stop_timeout_ms == 0 {
            bail!("--stop-timeout-ms must be greater than zero");
        }
        if self.meter && self.meter_secs == 0 {
            bail!("--meter-secs must be greater than zero");
        }
        if self.meter_secs > MAX_METER_SECS {
            bail!(
                "--meter-secs must be at most {MAX_METER_SECS} (got {})",
                self.meter_secs
            );
        }
        if let Some(name) = self.input_device.as_deref() {
            if name.trim().is_empty() {
                bail!("--input-device must not be empty");
            }
        }
        Ok(())
    }

    pub fn tracing_enabled(&self) -> bool {
        self.logs && !self.no_logs
    }
}

fn set_explicitly(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        Some(ValueSource::CommandLine | ValueSource::EnvVariable)
    )
}

fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var(CONFIG_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::config_dir().map(|dir| dir.join("nightshield"))
}

pub fn config_file_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// Load the user config, falling back to defaults when the file is missing
/// or malformed.
pub fn load_user_config() -> UserConfig {
    let Some(path) = config_file_path() else {
        return UserConfig::default();
    };
    match fs::read_to_string(&path) {
        Ok(contents) => parse_user_config(&contents),
        Err(_) => UserConfig::default(),
    }
}

fn parse_user_config(contents: &str) -> UserConfig {
    match toml::from_str(contents) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "ignoring malformed user config");
            UserConfig::default()
        }
    }
}
