use picam_core::ExposureConfig;
use picam_hw::sensor::{load_sensor_file, lookup_sensor};
use picam_hw::{SensorError, SensorProfile};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Driver configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedded sensor profile name (default: imx219).
    pub sensor: String,
    /// Profile file used instead of the embedded database.
    pub sensor_file: Option<PathBuf>,
    /// Replaces the profile's producer command.
    pub capture_command: Option<String>,
    /// Replaces the profile's init command. An empty value disables it.
    pub init_command: Option<String>,
    /// Exposure tick interval in milliseconds.
    pub poll_ms: u64,
    /// Shortest exposure in seconds; shorter requests are clamped.
    pub min_exposure_secs: f64,
    /// Seconds to wait past the deadline for missing frames.
    pub overrun_secs: u64,
    /// Where images are written when no explicit path is given.
    pub output_dir: PathBuf,
}

impl Config {
    /// Load configuration from `PICAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            sensor: var("PICAM_SENSOR").unwrap_or_else(|| "imx219".to_string()),
            sensor_file: var("PICAM_SENSOR_FILE").map(PathBuf::from),
            capture_command: var("PICAM_CAPTURE_COMMAND").filter(|c| !c.trim().is_empty()),
            init_command: var("PICAM_INIT_COMMAND"),
            poll_ms: parse_var(&var, "PICAM_POLL_MS").unwrap_or(1000),
            min_exposure_secs: parse_var(&var, "PICAM_MIN_EXPOSURE_SECS")
                .filter(|v: &f64| v.is_finite() && *v > 0.0)
                .unwrap_or(1.0),
            overrun_secs: parse_var(&var, "PICAM_OVERRUN_SECS").unwrap_or(10),
            output_dir: var("PICAM_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Resolve the sensor profile and apply command overrides.
    pub fn load_profile(&self) -> Result<SensorProfile, SensorError> {
        let mut profile = match &self.sensor_file {
            Some(path) => load_sensor_file(path)?,
            None => lookup_sensor(&self.sensor)?.clone(),
        };
        if let Some(command) = &self.capture_command {
            profile.capture.command = command.clone();
        }
        if let Some(init) = &self.init_command {
            profile.capture.init_command = Some(init.clone()).filter(|c| !c.trim().is_empty());
        }
        Ok(profile)
    }

    pub fn exposure_config(&self) -> ExposureConfig {
        ExposureConfig {
            min_duration: self.min_exposure_secs,
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            overrun_limit: Duration::from_secs(self.overrun_secs),
        }
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}
