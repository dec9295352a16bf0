//! Agent configuration
//!
//! The injection collaborator (or the demo binary) builds an [`AgentConfig`]
//! programmatically. The only ambient input is one environment variable
//! selecting the sampling interval.

use std::path::PathBuf;

use log::warn;
use serde::Serialize;

/// Descriptor the controller hands the agent for its trace stream
pub const CONTROLLER_FD: i32 = 3;

/// Sampling interval used when no valid override is present (µs)
pub const DEFAULT_SAMPLE_INTERVAL_US: u32 = 500_000;

/// Environment variable overriding the sampling interval, in microseconds
pub const SAMPLE_INTERVAL_ENV: &str = "RTPROBE_SAMPLE_INTERVAL";

/// Summary file written at shutdown, relative to the working directory
pub const DEFAULT_STATS_FILE: &str = "stats.out";

/// Iterations of the calibration busy loop
pub const DEFAULT_CALIBRATION_LOOPS: u64 = 50_000;

/// How sampling ticks are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmMode {
    /// Periodic `SIGALRM` from `setitimer(ITIMER_REAL)`
    #[default]
    Signal,
    /// No signal; the embedding calls `Agent::on_alarm` itself
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentConfig {
    /// Pre-opened descriptor the trace stream is written to
    pub controller_fd: i32,
    pub sample_interval_us: u32,
    /// Only every Nth tick performs a sample (0 behaves as 1)
    pub sample_multiple: u32,
    pub stats_path: PathBuf,
    pub alarm: AlarmMode,
    pub calibration_loops: u64,
}

impl AgentConfig {
    /// Defaults for an agent writing to `controller_fd`
    #[must_use]
    pub fn new(controller_fd: i32) -> Self {
        Self {
            controller_fd,
            sample_interval_us: DEFAULT_SAMPLE_INTERVAL_US,
            sample_multiple: 1,
            stats_path: PathBuf::from(DEFAULT_STATS_FILE),
            alarm: AlarmMode::Signal,
            calibration_loops: DEFAULT_CALIBRATION_LOOPS,
        }
    }

    /// Defaults plus the sampling interval from [`SAMPLE_INTERVAL_ENV`]
    #[must_use]
    pub fn from_env(controller_fd: i32) -> Self {
        let raw = std::env::var(SAMPLE_INTERVAL_ENV).ok();
        Self { sample_interval_us: parse_interval(raw.as_deref()), ..Self::new(controller_fd) }
    }

    #[must_use]
    pub fn with_sample_interval(mut self, us: u32) -> Self {
        self.sample_interval_us = if us == 0 { DEFAULT_SAMPLE_INTERVAL_US } else { us };
        self
    }

    #[must_use]
    pub fn with_sample_multiple(mut self, multiple: u32) -> Self {
        self.sample_multiple = multiple.max(1);
        self
    }

    #[must_use]
    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.stats_path = path.into();
        self
    }

    #[must_use]
    pub fn with_alarm(mut self, alarm: AlarmMode) -> Self {
        self.alarm = alarm;
        self
    }

    #[must_use]
    pub fn with_calibration_loops(mut self, loops: u64) -> Self {
        self.calibration_loops = loops.max(1);
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(CONTROLLER_FD)
    }
}

/// Interpret an interval override
///
/// Absent or empty means the default. Values that do not parse, or parse to
/// zero, also fall back to the default but are reported.
#[must_use]
pub fn parse_interval(raw: Option<&str>) -> u32 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_SAMPLE_INTERVAL_US;
    };
    match raw.parse::<u32>() {
        Ok(0) => {
            warn!(
                "{SAMPLE_INTERVAL_ENV}=0 is not a valid interval, \
                 using {DEFAULT_SAMPLE_INTERVAL_US}us"
            );
            DEFAULT_SAMPLE_INTERVAL_US
        }
        Ok(us) => us,
        Err(e) => {
            warn!(
                "Ignoring {SAMPLE_INTERVAL_ENV}={raw:?} ({e}), \
                 using {DEFAULT_SAMPLE_INTERVAL_US}us"
            );
            DEFAULT_SAMPLE_INTERVAL_US
        }
    }
}
