//! Frame payloads as delivered by the hardware and as stored in the buffer.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// One image as delivered by a hardware adapter.
///
/// Pixel data is reference counted, so cloning a frame or moving it from the
/// producer to the saving task never copies the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bits per pixel (8 or 16)
    pub bit_depth: u8,
    /// Frame counter reported by the detector
    pub hw_frame_number: u64,
    /// Pixel data, row major, little-endian for 16-bit pixels
    pub data: Bytes,
}

impl RawFrame {
    /// Wrap an existing payload.
    pub fn new(width: u32, height: u32, bit_depth: u8, hw_frame_number: u64, data: Bytes) -> Self {
        Self {
            width,
            height,
            bit_depth,
            hw_frame_number,
            data,
        }
    }

    /// Build a 16-bit frame from pixel values.
    pub fn from_u16(width: u32, height: u32, hw_frame_number: u64, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self::new(width, height, 16, hw_frame_number, Bytes::from(data))
    }

    /// Bytes used by one pixel.
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bit_depth).div_ceil(8)
    }

    /// Payload length implied by the geometry.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }

    /// Decode 16-bit pixels, `None` for other bit depths.
    pub fn pixels_u16(&self) -> Option<Vec<u16>> {
        if self.bit_depth != 16 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }
}

/// A frame after it entered the buffer: stamped with the buffer sequence
/// number and the capture time.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Buffer sequence number, strictly increasing within a session
    pub sequence: u64,
    /// Capture time (write reservation)
    pub timestamp: DateTime<Utc>,
    /// The frame itself
    pub frame: RawFrame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_little_endian() {
        let frame = RawFrame::from_u16(2, 1, 7, &[0x0102, 0xA0B0]);
        assert_eq!(frame.data.as_ref(), &[0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(frame.expected_len(), 4);
        assert_eq!(frame.pixels_u16(), Some(vec![0x0102, 0xA0B0]));
    }

    #[test]
    fn test_pixels_u16_rejects_8bit() {
        let frame = RawFrame::new(4, 1, 8, 0, Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(frame.bytes_per_pixel(), 1);
        assert!(frame.pixels_u16().is_none());
    }
}
