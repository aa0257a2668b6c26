//! picam-core — Exposure engine for raw10 camera streams.
//!
//! Sums decoded sensor frames into timed exposures driven by periodic
//! ticks, crops and bins the result, and runs an independent live
//! streaming loop on its own thread.

pub mod accumulator;
pub mod chip;
pub mod exposure;
pub mod roi;
pub mod streaming;

#[cfg(test)]
mod testing;

pub use accumulator::Accumulator;
pub use chip::{CcdChip, FrameType};
pub use exposure::{
    AbortHandle, AbortReason, ExposureConfig, ExposureController, ExposureError, ExposureSink,
    ExposureState, ExposureStatus, FinishedExposure,
};
pub use roi::Roi;
pub use streaming::{StreamingError, StreamingSink, StreamingWorker};
