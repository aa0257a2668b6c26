//! picam-hw — Hardware layer for raw10 Raspberry Pi camera sensors.
//!
//! Provides the subprocess capture pipe, the raw10 block codec and the
//! embedded sensor profile database.

pub mod capture;
pub mod raw;
pub mod sensor;

pub use capture::{CaptureError, CaptureStream, PipeCapture, ReadStatus};
pub use raw::{decode, decode_into, pack, DecodeError, DecodedFrame, RawBlock, SensorGeometry};
pub use sensor::{lookup_sensor, SensorError, SensorProfile};
