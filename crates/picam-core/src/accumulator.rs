//! Running sum of decoded frames for one exposure.

use picam_hw::raw::SAMPLE_SHIFT;
use picam_hw::{DecodedFrame, SensorGeometry};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("frame is {actual:?}, accumulator is {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Sum of de-justified samples across frames.
///
/// Samples are shifted back down to their 10 significant bits before
/// summation, and summed into `u32` so thousands of frames fit.
pub struct Accumulator {
    width: u32,
    height: u32,
    sum: Vec<u32>,
    frames_summed: u32,
}

impl Accumulator {
    pub fn new(geometry: SensorGeometry) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            sum: vec![0; geometry.pixel_count()],
            frames_summed: 0,
        }
    }

    /// Zero the buffer and the frame count. Dimensions are kept.
    pub fn reset(&mut self) {
        self.sum.fill(0);
        self.frames_summed = 0;
    }

    pub fn add_frame(&mut self, frame: &DecodedFrame) -> Result<(), AccumulatorError> {
        if frame.width != self.width
            || frame.height != self.height
            || frame.pixels.len() != self.sum.len()
        {
            return Err(AccumulatorError::DimensionMismatch {
                expected: (self.width, self.height),
                actual: (frame.width, frame.height),
            });
        }

        for (acc, &sample) in self.sum.iter_mut().zip(&frame.pixels) {
            *acc = acc.saturating_add(u32::from(sample >> SAMPLE_SHIFT));
        }
        self.frames_summed += 1;
        Ok(())
    }

    pub fn sum(&self) -> &[u32] {
        &self.sum
    }

    pub fn frames_summed(&self) -> u32 {
        self.frames_summed
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: SensorGeometry = SensorGeometry::new(8, 4, 0);

    #[test]
    fn test_constant_frames_sum_uniformly() {
        let mut acc = Accumulator::new(TINY);
        let value = 0x8AC0u16;
        let frame = DecodedFrame::filled(TINY, value);
        for _ in 0..7 {
            acc.add_frame(&frame).unwrap();
        }
        assert_eq!(acc.frames_summed(), 7);
        let expected = 7 * u32::from(value >> 6);
        assert!(acc.sum().iter().all(|&s| s == expected));
    }

    #[test]
    fn test_full_scale_headroom() {
        let mut acc = Accumulator::new(TINY);
        let frame = DecodedFrame::filled(TINY, 0xFFC0);
        for _ in 0..100 {
            acc.add_frame(&frame).unwrap();
        }
        assert!(acc.sum().iter().all(|&s| s == 100 * 1023));
    }

    #[test]
    fn test_reset_clears_sum_and_count() {
        let mut acc = Accumulator::new(TINY);
        acc.add_frame(&DecodedFrame::filled(TINY, 0x4000)).unwrap();
        acc.reset();
        assert_eq!(acc.frames_summed(), 0);
        assert!(acc.sum().iter().all(|&s| s == 0));
        assert_eq!((acc.width(), acc.height()), (8, 4));
    }

    #[test]
    fn test_rejects_mismatched_frame() {
        let mut acc = Accumulator::new(TINY);
        let other = DecodedFrame::filled(SensorGeometry::new(4, 4, 0), 0x4000);
        assert!(matches!(
            acc.add_frame(&other),
            Err(AccumulatorError::DimensionMismatch { .. })
        ));
        assert_eq!(acc.frames_summed(), 0);
    }
}
