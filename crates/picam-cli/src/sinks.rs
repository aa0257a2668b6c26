//! Image output for finished exposures and live frames.

use image::{ImageBuffer, Luma};
use picam_core::StreamingSink;
use picam_hw::DecodedFrame;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{width}x{height} image needs {expected} pixels, got {actual}")]
    Size {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: image::ImageError,
    },
}

/// Write 16-bit samples as a grayscale PNG.
pub fn save_png(path: &Path, width: u32, height: u32, pixels: &[u16]) -> Result<(), SinkError> {
    let expected = width as usize * height as usize;
    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(width, height, pixels.to_vec()).ok_or(SinkError::Size {
            width,
            height,
            expected,
            actual: pixels.len(),
        })?;
    buffer.save(path).map_err(|source| SinkError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Summary statistics of one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameStats {
    pub min: u16,
    pub max: u16,
    pub mean: f64,
}

impl FrameStats {
    pub fn of(pixels: &[u16]) -> Option<Self> {
        let min = *pixels.iter().min()?;
        let max = *pixels.iter().max()?;
        let total: u64 = pixels.iter().map(|&p| u64::from(p)).sum();
        Some(Self {
            min,
            max,
            mean: total as f64 / pixels.len() as f64,
        })
    }
}

/// Streaming sink that keeps the most recent frame on disk as `latest.png`.
pub struct LatestFrameSink {
    fps: f64,
    path: Option<PathBuf>,
}

impl LatestFrameSink {
    /// With `dir` unset, frames are only logged.
    pub fn new(fps: f64, dir: Option<&Path>) -> Self {
        Self {
            fps,
            path: dir.map(|d| d.join("latest.png")),
        }
    }
}

impl StreamingSink for LatestFrameSink {
    fn publish_frame(&mut self, frame: &DecodedFrame) {
        if let Some(stats) = FrameStats::of(&frame.pixels) {
            tracing::debug!(min = stats.min, max = stats.max, mean = stats.mean, "frame");
        }
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = save_png(path, frame.width, frame.height, &frame.pixels) {
            tracing::warn!(error = %e, "failed to save live frame");
        }
    }

    fn target_frame_rate(&self) -> f64 {
        self.fps
    }
}
