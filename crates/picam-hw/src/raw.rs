//! Raw10 block layout and codec.
//!
//! The capture producer writes one fixed-size block per sensor frame. Every
//! row packs 4 pixels into 5 bytes: the high 8 bits of each pixel, then one
//! "split" byte carrying the four 2-bit low-order remainders from the most to
//! the least significant pair. A fixed run of padding bytes ends each row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Significant bits per sample on the supported raw10 sensors.
pub const SENSOR_BIT_DEPTH: u32 = 10;

/// Left-justification applied by the decoder. Accumulation shifts it back out.
///
/// Assumes a 10-bit sensor; a different sensor class needs a new constant.
pub const SAMPLE_SHIFT: u32 = 16 - SENSOR_BIT_DEPTH;

pub const PIXELS_PER_GROUP: usize = 4;
pub const BYTES_PER_GROUP: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short raw block: expected {expected} bytes, got {actual}")]
    ShortBlock { expected: usize, actual: usize },
    #[error("frame is {actual:?}, sensor geometry needs {expected:?}")]
    FrameMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("invalid sensor geometry: {0}")]
    InvalidGeometry(String),
}

/// Pixel layout of a raw10 sensor readout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorGeometry {
    pub width: u32,
    pub height: u32,
    /// Trailing bytes after the packed pixels of every row.
    pub row_padding: u32,
}

impl SensorGeometry {
    pub const fn new(width: u32, height: u32, row_padding: u32) -> Self {
        Self {
            width,
            height,
            row_padding,
        }
    }

    /// Packed bytes per row, padding included.
    pub const fn row_stride(&self) -> usize {
        (self.width as usize / PIXELS_PER_GROUP) * BYTES_PER_GROUP + self.row_padding as usize
    }

    /// Size of one complete raw block as emitted by the producer.
    pub const fn raw_block_size(&self) -> usize {
        self.row_stride() * self.height as usize
    }

    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(DecodeError::InvalidGeometry(format!(
                "empty sensor {}x{}",
                self.width, self.height
            )));
        }
        if self.width as usize % PIXELS_PER_GROUP != 0 {
            return Err(DecodeError::InvalidGeometry(format!(
                "width {} is not a multiple of {PIXELS_PER_GROUP}",
                self.width
            )));
        }
        Ok(())
    }
}

/// Sony IMX219 (Pi Camera v2), full-frame sensor mode.
pub const IMX219: SensorGeometry = SensorGeometry::new(3280, 2464, 28);

/// OmniVision OV5647 (Pi Camera v1), full-frame sensor mode.
pub const OV5647: SensorGeometry = SensorGeometry::new(2592, 1944, 24);

const _IMX219_BLOCK_ASSERT: () = assert!(
    IMX219.raw_block_size() == 10_171_392,
    "IMX219 raw block must match the raspiraw mode 2 output size"
);

/// One sensor frame worth of packed bytes, filled incrementally from the pipe.
pub struct RawBlock {
    data: Vec<u8>,
    filled: usize,
}

impl RawBlock {
    pub fn new(geometry: SensorGeometry) -> Self {
        Self {
            data: vec![0; geometry.raw_block_size()],
            filled: 0,
        }
    }

    /// Build a block from already-captured bytes (e.g. a raw dump file).
    /// Bytes beyond one block are ignored.
    pub fn from_bytes(geometry: SensorGeometry, bytes: &[u8]) -> Self {
        let mut block = Self::new(geometry);
        let n = bytes.len().min(block.data.len());
        block.data[..n].copy_from_slice(&bytes[..n]);
        block.filled = n;
        block
    }

    /// Full size of the block in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.data.len()
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Bytes received so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// The not-yet-received tail, for reads straight into the block.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    pub fn advance(&mut self, n: usize) {
        self.filled = (self.filled + n).min(self.data.len());
    }
}

/// Decoded frame of left-justified 16-bit samples (low 6 bits zero).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl DecodedFrame {
    pub fn new(geometry: SensorGeometry) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            pixels: vec![0; geometry.pixel_count()],
        }
    }

    /// Frame with every sample set to `value`.
    pub fn filled(geometry: SensorGeometry, value: u16) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            pixels: vec![value; geometry.pixel_count()],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

/// Decode one raw block into a new frame.
pub fn decode(raw: &[u8], geometry: SensorGeometry) -> Result<DecodedFrame, DecodeError> {
    let mut frame = DecodedFrame::new(geometry);
    decode_into(raw, geometry, &mut frame)?;
    Ok(frame)
}

/// Decode one raw block into an existing frame, reusing its allocation.
///
/// A block shorter than `geometry.raw_block_size()` fails with
/// [`DecodeError::ShortBlock`] and leaves `frame` untouched.
pub fn decode_into(
    raw: &[u8],
    geometry: SensorGeometry,
    frame: &mut DecodedFrame,
) -> Result<(), DecodeError> {
    geometry.validate()?;
    let expected = geometry.raw_block_size();
    if raw.len() < expected {
        return Err(DecodeError::ShortBlock {
            expected,
            actual: raw.len(),
        });
    }
    if frame.width != geometry.width
        || frame.height != geometry.height
        || frame.pixels.len() != geometry.pixel_count()
    {
        return Err(DecodeError::FrameMismatch {
            expected: (geometry.width, geometry.height),
            actual: (frame.width, frame.height),
        });
    }

    let width = geometry.width as usize;
    let packed_row = width / PIXELS_PER_GROUP * BYTES_PER_GROUP;

    for (row, out_row) in raw[..expected]
        .chunks_exact(geometry.row_stride())
        .zip(frame.pixels.chunks_exact_mut(width))
    {
        // Padding past `packed_row` is skipped.
        for (group, out) in row[..packed_row]
            .chunks_exact(BYTES_PER_GROUP)
            .zip(out_row.chunks_exact_mut(PIXELS_PER_GROUP))
        {
            let split = group[4] as u16;
            out[0] = ((group[0] as u16) << 8) + (split & 0xC0);
            out[1] = ((group[1] as u16) << 8) + ((split & 0x30) << 2);
            out[2] = ((group[2] as u16) << 8) + ((split & 0x0C) << 4);
            out[3] = ((group[3] as u16) << 8) + ((split & 0x03) << 6);
        }
    }

    Ok(())
}

/// Pack a frame back into the raw10 block layout (padding bytes zeroed).
///
/// Only the top 10 bits of each sample survive.
pub fn pack(frame: &DecodedFrame, geometry: SensorGeometry) -> Result<Vec<u8>, DecodeError> {
    geometry.validate()?;
    if frame.width != geometry.width
        || frame.height != geometry.height
        || frame.pixels.len() != geometry.pixel_count()
    {
        return Err(DecodeError::FrameMismatch {
            expected: (geometry.width, geometry.height),
            actual: (frame.width, frame.height),
        });
    }

    let width = geometry.width as usize;
    let packed_row = width / PIXELS_PER_GROUP * BYTES_PER_GROUP;
    let mut raw = vec![0u8; geometry.raw_block_size()];

    for (row, in_row) in raw
        .chunks_exact_mut(geometry.row_stride())
        .zip(frame.pixels.chunks_exact(width))
    {
        for (group, px) in row[..packed_row]
            .chunks_exact_mut(BYTES_PER_GROUP)
            .zip(in_row.chunks_exact(PIXELS_PER_GROUP))
        {
            let mut split = 0u8;
            for (i, &sample) in px.iter().enumerate() {
                group[i] = (sample >> 8) as u8;
                let low = ((sample >> SAMPLE_SHIFT) & 0x03) as u8;
                split |= low << (6 - 2 * i);
            }
            group[4] = split;
        }
    }

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: SensorGeometry = SensorGeometry::new(8, 3, 2);

    /// Deterministic byte pattern covering every split combination.
    fn pattern_block(geometry: SensorGeometry) -> Vec<u8> {
        let stride = geometry.row_stride();
        let packed = geometry.width as usize / 4 * 5;
        (0..geometry.raw_block_size())
            .map(|i| {
                if i % stride >= packed {
                    0
                } else {
                    (i.wrapping_mul(151) ^ (i >> 3)) as u8
                }
            })
            .collect()
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(IMX219.row_stride(), 4128);
        assert_eq!(IMX219.raw_block_size(), 10_171_392);
        assert_eq!(OV5647.row_stride(), 3264);
        assert_eq!(TINY.row_stride(), 12);
        assert_eq!(TINY.raw_block_size(), 36);
    }

    #[test]
    fn test_decode_single_group() {
        let geometry = SensorGeometry::new(4, 1, 2);
        let raw = [0x12, 0x34, 0x56, 0x78, 0b11_10_01_00, 0xAA, 0xBB];
        let frame = decode(&raw, geometry).unwrap();
        assert_eq!(frame.pixels, vec![0x12C0, 0x3480, 0x5640, 0x7800]);
    }

    #[test]
    fn test_decode_skips_row_padding() {
        let geometry = SensorGeometry::new(4, 2, 3);
        let raw = [
            0x01, 0x02, 0x03, 0x04, 0x00, 0xFF, 0xFF, 0xFF, // row 0 + padding
            0x05, 0x06, 0x07, 0x08, 0xFF, 0xEE, 0xEE, 0xEE, // row 1 + padding
        ];
        let frame = decode(&raw, geometry).unwrap();
        assert_eq!(frame.pixels[..4], [0x0100, 0x0200, 0x0300, 0x0400]);
        assert_eq!(frame.pixels[4..], [0x05C0, 0x06C0, 0x07C0, 0x08C0]);
    }

    #[test]
    fn test_decoded_samples_are_left_justified() {
        let raw = pattern_block(TINY);
        let frame = decode(&raw, TINY).unwrap();
        assert!(frame.pixels.iter().all(|&p| p & 0x3F == 0));
    }

    #[test]
    fn test_high_bytes_and_split_recoverable() {
        let raw = pattern_block(TINY);
        let frame = decode(&raw, TINY).unwrap();
        let stride = TINY.row_stride();

        for row in 0..TINY.height as usize {
            for group in 0..TINY.width as usize / 4 {
                let base = row * stride + group * 5;
                let px = &frame.pixels[row * 8 + group * 4..][..4];
                let mut split = 0u8;
                for i in 0..4 {
                    assert_eq!((px[i] >> 8) as u8, raw[base + i]);
                    split |= (((px[i] >> 6) & 0x03) as u8) << (6 - 2 * i);
                }
                assert_eq!(split, raw[base + 4]);
            }
        }

        // With zeroed padding the packer reproduces the block byte for byte.
        assert_eq!(pack(&frame, TINY).unwrap(), raw);
    }

    #[test]
    fn test_short_block_rejected() {
        let raw = vec![0u8; TINY.raw_block_size() - 1];
        let err = decode(&raw, TINY).unwrap_err();
        assert_eq!(
            err,
            DecodeError::ShortBlock {
                expected: 36,
                actual: 35
            }
        );
    }

    #[test]
    fn test_decode_into_leaves_frame_on_short_block() {
        let mut frame = DecodedFrame::filled(TINY, 0x4000);
        assert!(decode_into(&[0u8; 10], TINY, &mut frame).is_err());
        assert!(frame.pixels.iter().all(|&p| p == 0x4000));
    }

    #[test]
    fn test_decode_into_rejects_wrong_frame() {
        let raw = pattern_block(TINY);
        let mut frame = DecodedFrame::new(SensorGeometry::new(4, 3, 2));
        assert!(matches!(
            decode_into(&raw, TINY, &mut frame),
            Err(DecodeError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_geometry() {
        let geometry = SensorGeometry::new(6, 2, 0);
        assert!(matches!(
            decode(&[0u8; 64], geometry),
            Err(DecodeError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_raw_block_fill() {
        let mut block = RawBlock::new(TINY);
        assert_eq!(block.capacity(), 36);
        block.unfilled_mut()[..10].fill(7);
        block.advance(10);
        assert_eq!(block.filled(), 10);
        assert!(!block.is_complete());
        block.advance(100);
        assert!(block.is_complete());
        block.clear();
        assert_eq!(block.as_bytes().len(), 0);
    }

    #[test]
    fn test_raw_block_from_bytes_truncates() {
        let block = RawBlock::from_bytes(TINY, &[1u8; 50]);
        assert!(block.is_complete());
        assert_eq!(block.as_bytes().len(), 36);
    }

    #[test]
    fn test_frame_get() {
        let frame = DecodedFrame {
            width: 2,
            height: 1,
            pixels: vec![0x1240, 0xFFC0],
        };
        assert_eq!(frame.get(1, 0), Some(0xFFC0));
        assert_eq!(frame.get(2, 0), None);
    }
}
