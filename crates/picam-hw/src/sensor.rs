//! Sensor profile database.
//!
//! Maps a sensor name to its raw10 geometry, optics and the producer
//! command line that streams it. Profile files are embedded at compile
//! time from `contrib/sensors/*.toml`.

use crate::raw::{SensorGeometry, SENSOR_BIT_DEPTH};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const SENSOR_IMX219: &str = include_str!("../../../contrib/sensors/imx219.toml");
const SENSOR_OV5647: &str = include_str!("../../../contrib/sensors/ov5647.toml");

static SENSOR_DB: OnceLock<Vec<SensorProfile>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("unknown sensor: {0}")]
    Unknown(String),
    #[error("failed to read sensor profile {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("bad sensor profile: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("bad sensor profile: {0}")]
    Invalid(String),
}

/// Top-level profile file structure (one per `contrib/sensors/*.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorProfile {
    pub sensor: SensorInfo,
    pub capture: CaptureInfo,
}

/// `[sensor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorInfo {
    pub name: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub row_padding: u32,
    pub bit_depth: u32,
    pub pixel_size_um: f32,
    /// Colour filter layout, reported to clients only.
    pub bayer: Option<String>,
}

/// `[capture]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureInfo {
    /// Shell command that writes raw blocks to stdout.
    pub command: String,
    /// One-shot sensor setup run before the first capture.
    pub init_command: Option<String>,
}

impl SensorProfile {
    pub fn geometry(&self) -> SensorGeometry {
        SensorGeometry::new(
            self.sensor.width,
            self.sensor.height,
            self.sensor.row_padding,
        )
    }

    pub fn name(&self) -> &str {
        &self.sensor.name
    }

    fn validate(&self) -> Result<(), SensorError> {
        self.geometry()
            .validate()
            .map_err(|e| SensorError::Invalid(format!("{}: {e}", self.sensor.name)))?;
        if self.sensor.bit_depth != SENSOR_BIT_DEPTH {
            return Err(SensorError::Invalid(format!(
                "{}: {}-bit sensors are not supported (raw10 only)",
                self.sensor.name, self.sensor.bit_depth
            )));
        }
        Ok(())
    }
}

/// Parse and validate a profile from TOML source.
pub fn parse_sensor(src: &str) -> Result<SensorProfile, SensorError> {
    let profile: SensorProfile = toml::from_str(src)?;
    profile.validate()?;
    Ok(profile)
}

/// Load a profile from a TOML file outside the embedded set.
pub fn load_sensor_file(path: &Path) -> Result<SensorProfile, SensorError> {
    let src = std::fs::read_to_string(path).map_err(|source| SensorError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_sensor(&src)
}

fn sensor_db() -> &'static Vec<SensorProfile> {
    SENSOR_DB.get_or_init(|| {
        let mut db = Vec::new();
        for src in [SENSOR_IMX219, SENSOR_OV5647] {
            match parse_sensor(src) {
                Ok(p) => db.push(p),
                Err(e) => tracing::error!(error = %e, "bad embedded sensor profile"),
            }
        }
        db
    })
}

/// Look up an embedded profile by name (case-insensitive).
pub fn lookup_sensor(name: &str) -> Result<&'static SensorProfile, SensorError> {
    sensor_db()
        .iter()
        .find(|p| p.sensor.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| SensorError::Unknown(name.to_string()))
}

/// List all embedded profiles.
pub fn list_sensors() -> &'static [SensorProfile] {
    sensor_db()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::{IMX219, OV5647};

    #[test]
    fn test_embedded_profiles_match_geometry_constants() {
        assert_eq!(lookup_sensor("imx219").unwrap().geometry(), IMX219);
        assert_eq!(lookup_sensor("OV5647").unwrap().geometry(), OV5647);
        assert_eq!(list_sensors().len(), 2);
    }

    #[test]
    fn test_unknown_sensor() {
        assert!(matches!(
            lookup_sensor("imx477"),
            Err(SensorError::Unknown(_))
        ));
    }

    #[test]
    fn test_rejects_unaligned_width() {
        let src = r#"
            [sensor]
            name = "odd"
            model = "Odd"
            width = 10
            height = 2
            row_padding = 0
            bit_depth = 10
            pixel_size_um = 2.0

            [capture]
            command = "true"
        "#;
        assert!(matches!(parse_sensor(src), Err(SensorError::Invalid(_))));
    }

    #[test]
    fn test_rejects_non_raw10() {
        let src = r#"
            [sensor]
            name = "twelve"
            model = "Twelve"
            width = 8
            height = 2
            row_padding = 0
            bit_depth = 12
            pixel_size_um = 2.0

            [capture]
            command = "true"
        "#;
        assert!(matches!(parse_sensor(src), Err(SensorError::Invalid(_))));
    }

    #[test]
    fn test_init_command_optional() {
        let imx = lookup_sensor("imx219").unwrap();
        assert_eq!(imx.capture.init_command.as_deref(), Some("camera_i2c"));
        let ov = lookup_sensor("ov5647").unwrap();
        assert!(ov.capture.init_command.is_none());
    }
}
