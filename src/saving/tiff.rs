//! TIFF encoding (`storage_tiff` feature).
//!
//! One 8- or 16-bit grayscale page per file, encoded in memory so the sink
//! can write it with async file I/O.

use image::codecs::tiff::TiffEncoder;
use image::{ExtendedColorType, ImageEncoder};
use std::io::Cursor;

use crate::data::frame::FrameRecord;
use crate::error::{AppResult, DaqError};

/// Encode one frame as a complete TIFF file.
pub fn encode(record: &FrameRecord) -> AppResult<Vec<u8>> {
    let frame = &record.frame;
    if frame.data.len() != frame.expected_len() {
        return Err(DaqError::InvalidParams(format!(
            "frame {} carries {} bytes, expected {}",
            record.sequence,
            frame.data.len(),
            frame.expected_len()
        )));
    }

    let (color, pixels): (ExtendedColorType, Vec<u8>) = match frame.bit_depth {
        8 => (ExtendedColorType::L8, frame.data.to_vec()),
        16 => {
            // Encoder expects native-endian samples
            let samples = frame.pixels_u16().unwrap_or_default();
            (
                ExtendedColorType::L16,
                samples.iter().flat_map(|v| v.to_ne_bytes()).collect(),
            )
        }
        other => {
            return Err(DaqError::InvalidParams(format!(
                "tiff supports 8 or 16-bit pixels, got {other}"
            )))
        }
    };

    let mut out = Cursor::new(Vec::new());
    TiffEncoder::new(&mut out)
        .write_image(&pixels, frame.width, frame.height, color)
        .map_err(|e| DaqError::InvalidParams(format!("tiff encoding failed: {e}")))?;

    tracing::debug!(
        sequence = record.sequence,
        dimensions = format!("{}x{}", frame.width, frame.height),
        bit_depth = frame.bit_depth,
        "Encoded TIFF"
    );
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::RawFrame;
    use chrono::Utc;

    #[test]
    fn test_encode_16bit_has_tiff_magic() {
        let record = FrameRecord {
            sequence: 0,
            timestamp: Utc::now(),
            frame: RawFrame::from_u16(4, 2, 0, &[0, 1000, 2000, 3000, 4000, 5000, 6000, 65535]),
        };
        let bytes = encode(&record).unwrap();
        assert!(bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*"));
    }

    #[test]
    fn test_encode_rejects_12bit_pixels() {
        let record = FrameRecord {
            sequence: 1,
            timestamp: Utc::now(),
            frame: RawFrame::new(2, 1, 12, 1, bytes::Bytes::from_static(&[0, 0, 0, 0])),
        };
        assert!(encode(&record).is_err());
    }
}
