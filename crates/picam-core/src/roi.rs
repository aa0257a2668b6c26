//! Region of interest and sub-frame extraction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RoiError {
    #[error("invalid ROI {roi}: exceeds {width}x{height} frame")]
    OutOfBounds { roi: Roi, width: u32, height: u32 },
    #[error("invalid ROI {0}: empty rectangle")]
    Empty(Roi),
    #[error("buffer holds {actual} samples, {width}x{height} frame needs {expected}")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("cannot parse ROI {0:?}: expected x,y,w,h")]
    Parse(String),
}

/// Rectangle in unbinned sensor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_full_frame(&self, width: u32, height: u32) -> bool {
        *self == Self::full(width, height)
    }

    pub fn pixel_count(&self) -> usize {
        self.w as usize * self.h as usize
    }

    /// Check that the rectangle is non-empty and inside a `width`x`height` frame.
    pub fn validate(&self, width: u32, height: u32) -> Result<(), RoiError> {
        if self.w == 0 || self.h == 0 {
            return Err(RoiError::Empty(*self));
        }
        let right = u64::from(self.x) + u64::from(self.w);
        let bottom = u64::from(self.y) + u64::from(self.h);
        if right > u64::from(width) || bottom > u64::from(height) {
            return Err(RoiError::OutOfBounds {
                roi: *self,
                width,
                height,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.w, self.h)
    }
}

impl FromStr for Roi {
    type Err = RoiError;

    /// Parses `x,y,w,h`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse())
            .collect::<Result<_, _>>()
            .map_err(|_| RoiError::Parse(s.to_string()))?;
        match parts[..] {
            [x, y, w, h] => Ok(Self::new(x, y, w, h)),
            _ => Err(RoiError::Parse(s.to_string())),
        }
    }
}

/// Copy `roi` out of a row-major `width`x`height` buffer.
///
/// Pure: the input is never modified, and nothing is produced on error.
pub fn extract<T: Copy>(
    buffer: &[T],
    width: u32,
    height: u32,
    roi: Roi,
) -> Result<Vec<T>, RoiError> {
    let expected = width as usize * height as usize;
    if buffer.len() != expected {
        return Err(RoiError::BufferSize {
            width,
            height,
            expected,
            actual: buffer.len(),
        });
    }
    roi.validate(width, height)?;

    let stride = width as usize;
    let (x, w) = (roi.x as usize, roi.w as usize);
    let mut out = Vec::with_capacity(roi.pixel_count());
    for row in buffer
        .chunks_exact(stride)
        .skip(roi.y as usize)
        .take(roi.h as usize)
    {
        out.extend_from_slice(&row[x..x + w]);
    }
    Ok(out)
}
