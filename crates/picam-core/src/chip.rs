//! Chip model: the device-side frame buffer an exposure is delivered into.
//!
//! Holds what a client configures between exposures (frame type, ROI,
//! binning) and turns a cropped accumulation sum into the 16-bit image
//! handed to the completion sink.

use crate::roi::{Roi, RoiError};
use picam_hw::{SensorGeometry, SensorProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest supported bin factor per axis.
pub const MAX_BIN: u32 = 16;

/// Bits per pixel of delivered images.
pub const OUTPUT_BIT_DEPTH: u32 = 16;

/// Extra room reserved at the end of the frame buffer.
const FRAME_BUFFER_SLACK: usize = 512;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChipError {
    #[error(transparent)]
    InvalidRoi(#[from] RoiError),
    #[error("invalid binning {x}x{y}: each axis must be 1..=16")]
    InvalidBinning { x: u32, y: u32 },
    #[error("unknown frame type {0:?}: expected light, bias, dark or flat")]
    UnknownFrameType(String),
}

/// Exposure category. Bias frames always use the minimum duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    #[default]
    Light,
    Bias,
    Dark,
    Flat,
}

impl FrameType {
    /// Bias and dark frames are taken with no light reaching the sensor.
    pub fn is_shuttered(&self) -> bool {
        matches!(self, Self::Bias | Self::Dark)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Light => "light",
            Self::Bias => "bias",
            Self::Dark => "dark",
            Self::Flat => "flat",
        };
        f.write_str(name)
    }
}

impl FromStr for FrameType {
    type Err = ChipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "bias" => Ok(Self::Bias),
            "dark" => Ok(Self::Dark),
            "flat" => Ok(Self::Flat),
            _ => Err(ChipError::UnknownFrameType(s.to_string())),
        }
    }
}

/// Binned 16-bit image ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinnedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

/// Primary imaging chip of one camera.
#[derive(Debug, Clone)]
pub struct CcdChip {
    width: u32,
    height: u32,
    pixel_size_um: f32,
    bayer: Option<String>,
    frame_type: FrameType,
    roi: Roi,
    bin_x: u32,
    bin_y: u32,
    exposure_duration: f64,
    exposure_left: f64,
}

impl CcdChip {
    pub fn new(profile: &SensorProfile) -> Self {
        let chip = Self::with_geometry(profile.geometry(), profile.sensor.pixel_size_um);
        match &profile.sensor.bayer {
            Some(pattern) => chip.with_bayer(pattern.as_str()),
            None => chip,
        }
    }

    pub fn with_geometry(geometry: SensorGeometry, pixel_size_um: f32) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            pixel_size_um,
            bayer: None,
            frame_type: FrameType::default(),
            roi: Roi::full(geometry.width, geometry.height),
            bin_x: 1,
            bin_y: 1,
            exposure_duration: 0.0,
            exposure_left: 0.0,
        }
    }

    pub fn with_bayer(mut self, pattern: impl Into<String>) -> Self {
        self.bayer = Some(pattern.into());
        self
    }

    /// Full sensor resolution in unbinned pixels.
    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bit_depth(&self) -> u32 {
        OUTPUT_BIT_DEPTH
    }

    pub fn pixel_size_um(&self) -> f32 {
        self.pixel_size_um
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn set_frame_type(&mut self, frame_type: FrameType) {
        if frame_type != self.frame_type {
            tracing::debug!(%frame_type, "frame type changed");
        }
        self.frame_type = frame_type;
    }

    pub fn roi(&self) -> Roi {
        self.roi
    }

    /// Set the sub-frame. Rejected rectangles leave the chip unchanged.
    pub fn set_roi(&mut self, roi: Roi) -> Result<(), ChipError> {
        roi.validate(self.width, self.height)?;
        self.roi = roi;
        tracing::debug!(
            %roi,
            bytes = self.frame_buffer_size(),
            "frame buffer resized"
        );
        Ok(())
    }

    pub fn binning(&self) -> (u32, u32) {
        (self.bin_x, self.bin_y)
    }

    pub fn set_binning(&mut self, bin_x: u32, bin_y: u32) -> Result<(), ChipError> {
        if !(1..=MAX_BIN).contains(&bin_x) || !(1..=MAX_BIN).contains(&bin_y) {
            return Err(ChipError::InvalidBinning { x: bin_x, y: bin_y });
        }
        self.bin_x = bin_x;
        self.bin_y = bin_y;
        tracing::debug!(
            bin_x,
            bin_y,
            bytes = self.frame_buffer_size(),
            "binning changed"
        );
        Ok(())
    }

    /// Output image size after binning.
    pub fn output_size(&self) -> (u32, u32) {
        (self.roi.w / self.bin_x, self.roi.h / self.bin_y)
    }

    /// Bytes a client needs to receive one image.
    pub fn frame_buffer_size(&self) -> usize {
        let (w, h) = self.output_size();
        w as usize * h as usize * (OUTPUT_BIT_DEPTH as usize / 8) + FRAME_BUFFER_SLACK
    }

    pub fn is_full_frame(&self) -> bool {
        self.roi.is_full_frame(self.width, self.height)
    }

    /// Colour filter pattern, only meaningful on full unbinned frames.
    pub fn bayer_pattern(&self) -> Option<&str> {
        if self.is_full_frame() && self.binning() == (1, 1) {
            self.bayer.as_deref()
        } else {
            None
        }
    }

    pub fn exposure_duration(&self) -> f64 {
        self.exposure_duration
    }

    pub fn set_exposure_duration(&mut self, seconds: f64) {
        self.exposure_duration = seconds;
    }

    pub fn exposure_left(&self) -> f64 {
        self.exposure_left
    }

    pub fn set_exposure_left(&mut self, seconds: f64) {
        self.exposure_left = seconds.max(0.0);
    }

    /// Sum-bin a cropped ROI buffer and saturate into 16 bits.
    ///
    /// Partial bins at the right and bottom edges are dropped.
    pub fn bin_frame(&self, cropped: &[u32]) -> Result<BinnedImage, ChipError> {
        let roi_w = self.roi.w as usize;
        if cropped.len() != self.roi.pixel_count() {
            return Err(ChipError::InvalidRoi(RoiError::BufferSize {
                width: self.roi.w,
                height: self.roi.h,
                expected: self.roi.pixel_count(),
                actual: cropped.len(),
            }));
        }

        let (out_w, out_h) = self.output_size();
        let (bx, by) = (self.bin_x as usize, self.bin_y as usize);
        let mut pixels = Vec::with_capacity(out_w as usize * out_h as usize);

        for oy in 0..out_h as usize {
            for ox in 0..out_w as usize {
                let mut total = 0u64;
                for row in cropped[oy * by * roi_w..].chunks(roi_w).take(by) {
                    total += row[ox * bx..ox * bx + bx]
                        .iter()
                        .map(|&v| u64::from(v))
                        .sum::<u64>();
                }
                pixels.push(total.min(u64::from(u16::MAX)) as u16);
            }
        }

        Ok(BinnedImage {
            width: out_w,
            height: out_h,
            pixels,
        })
    }
}
