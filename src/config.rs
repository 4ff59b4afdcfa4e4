use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use thiserror::Error;

use crate::models::{
    device::InterfaceHint,
    level::{LevelBounds, LevelError},
};

/// Tuning for the supervisor and the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How many devices make a complete group.
    pub group_size: usize,
    /// Wait after an empty, partial, or failed scan and after a failed connect.
    pub scan_interval: Duration,
    /// Shorter wait after the discovery transport reports congestion.
    pub retry_interval: Duration,
    /// Period of the health check on a connected group.
    pub monitor_interval: Duration,
    /// Give up if no group is connected this long after scanning starts.
    pub overall_timeout: Duration,
    pub value_bounds: LevelBounds,
    pub adjust_step: f64,
    /// How long one probe listens for answers.
    pub probe_window: Duration,
    /// Bound on each connect and each request/response exchange.
    pub io_timeout: Duration,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Group size must be at least 1.")]
    ZeroGroupSize,
    #[error("Interval `{0}` must be greater than zero.")]
    ZeroInterval(&'static str),
    #[error("Adjust step must be a positive number, got {0}.")]
    InvalidStep(f64),
    #[error("Invalid level bounds. Error: {0}")]
    InvalidBounds(#[from] LevelError),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group_size: 2,
            scan_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            monitor_interval: Duration::from_secs(2),
            overall_timeout: Duration::from_secs(60),
            value_bounds: LevelBounds::default(),
            adjust_step: 1f64,
            probe_window: Duration::from_secs(3),
            io_timeout: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_size == 0 {
            return Err(ConfigError::ZeroGroupSize);
        }
        let intervals = [
            ("scan_interval", self.scan_interval),
            ("retry_interval", self.retry_interval),
            ("monitor_interval", self.monitor_interval),
            ("overall_timeout", self.overall_timeout),
            ("probe_window", self.probe_window),
            ("io_timeout", self.io_timeout),
        ];
        if let Some(&(name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::ZeroInterval(name));
        }
        if !self.adjust_step.is_finite() || self.adjust_step <= 0f64 {
            return Err(ConfigError::InvalidStep(self.adjust_step));
        }
        Ok(())
    }
}

/// Find a stereo pair of SSC speakers on the local network and control their
/// output level.
#[derive(Parser, Debug)]
#[command(name = "speaker_group_control", version)]
pub struct Args {
    /// Network interface the speakers are reachable through, e.g. en0
    #[arg(short, long, default_value = "en0", env = "SPEAKER_INTERFACE")]
    pub interface: String,

    /// Number of speakers that make up the group
    #[arg(long, default_value_t = 2, env = "SPEAKER_GROUP_SIZE")]
    pub group_size: usize,

    /// Seconds to wait between scans
    #[arg(long, default_value = "10", value_parser = parse_seconds, env = "SPEAKER_SCAN_INTERVAL")]
    pub scan_interval: Duration,

    /// Seconds to wait before retrying a congested scan
    #[arg(long, default_value = "2", value_parser = parse_seconds, env = "SPEAKER_RETRY_INTERVAL")]
    pub retry_interval: Duration,

    /// Seconds between health checks while connected
    #[arg(long, default_value = "2", value_parser = parse_seconds, env = "SPEAKER_MONITOR_INTERVAL")]
    pub monitor_interval: Duration,

    /// Seconds to keep searching before giving up
    #[arg(long, default_value = "60", value_parser = parse_seconds, env = "SPEAKER_TIMEOUT")]
    pub timeout: Duration,

    /// Lowest level that may be set, in dB
    #[arg(long, default_value_t = 0f64, allow_negative_numbers = true, env = "SPEAKER_MIN_LEVEL")]
    pub min_level: f64,

    /// Highest level that may be set, in dB
    #[arg(long, default_value_t = 90f64, allow_negative_numbers = true, env = "SPEAKER_MAX_LEVEL")]
    pub max_level: f64,

    /// Level change per adjust, in dB
    #[arg(long, default_value_t = 1f64, env = "SPEAKER_STEP")]
    pub step: f64,

    /// Seconds one discovery probe listens for answers
    #[arg(long, default_value = "3", value_parser = parse_seconds, env = "SPEAKER_PROBE_WINDOW")]
    pub probe_window: Duration,

    /// Seconds allowed for each connect and each request to a speaker
    #[arg(long, default_value = "2", value_parser = parse_seconds, env = "SPEAKER_IO_TIMEOUT")]
    pub io_timeout: Duration,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info", env = "SPEAKER_LOG_LEVEL")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long, env = "SPEAKER_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn interface(&self) -> InterfaceHint {
        InterfaceHint::new(&self.interface)
    }

    /// Directory and file name for the log file, if one was asked for. A bare
    /// file name lands in the working directory.
    pub fn log_file_location(&self) -> Option<(PathBuf, OsString)> {
        let path = self.log_file.as_ref()?;
        let name = path.file_name()?.to_os_string();
        let directory = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Some((directory, name))
    }

    /// Build and validate the runtime configuration.
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let config = Config {
            group_size: self.group_size,
            scan_interval: self.scan_interval,
            retry_interval: self.retry_interval,
            monitor_interval: self.monitor_interval,
            overall_timeout: self.timeout,
            value_bounds: LevelBounds::new(self.min_level, self.max_level)?,
            adjust_step: self.step,
            probe_window: self.probe_window,
            io_timeout: self.io_timeout,
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let seconds = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("`{}` is not a number of seconds: {}", raw, e))?;
    Duration::try_from_secs_f64(seconds).map_err(|e| format!("`{}` is out of range: {}", raw, e))
}
