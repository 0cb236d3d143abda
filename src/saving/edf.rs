//! EDF (ESRF Data Format) encoding.
//!
//! Each image is an ASCII header block followed by the pixel data:
//!
//! ```text
//! {
//! HeaderID = EH:000001:000000:000000 ;
//! Image = 1 ;
//! ByteOrder = LowByteFirst ;
//! DataType = UnsignedShort ;
//! Dim_1 = 512 ;
//! Dim_2 = 1 ;
//! Size = 1024 ;
//! acq_frame_nb = 0 ;
//! time = 2026-10-16T09:30:00.000000Z ;
//!                     <spaces up to a multiple of 512 bytes>
//! }
//! <Size bytes of little-endian pixels>
//! ```
//!
//! Multi-image files concatenate blocks; the image number is 1-based within
//! the file.

use std::fmt::Write as _;

use crate::data::frame::FrameRecord;
use crate::error::{AppResult, DaqError};

/// Header blocks are padded to a multiple of this size.
pub const BLOCK_SIZE: usize = 512;

fn data_type(bit_depth: u8) -> AppResult<&'static str> {
    match bit_depth {
        1..=8 => Ok("UnsignedByte"),
        9..=16 => Ok("UnsignedShort"),
        17..=32 => Ok("UnsignedInteger"),
        other => Err(DaqError::InvalidParams(format!(
            "no EDF data type for {other}-bit pixels"
        ))),
    }
}

/// Header block of image `image_number` (1-based).
pub fn header(record: &FrameRecord, image_number: usize) -> AppResult<String> {
    let frame = &record.frame;
    let mut body = String::with_capacity(BLOCK_SIZE);
    // Writing into a String cannot fail
    let _ = write!(
        body,
        "{{\n\
         HeaderID = EH:{image_number:06}:000000:000000 ;\n\
         Image = {image_number} ;\n\
         ByteOrder = LowByteFirst ;\n\
         DataType = {} ;\n\
         Dim_1 = {} ;\n\
         Dim_2 = {} ;\n\
         Size = {} ;\n\
         acq_frame_nb = {} ;\n\
         time = {} ;\n",
        data_type(frame.bit_depth)?,
        frame.width,
        frame.height,
        frame.data.len(),
        record.sequence,
        record.timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ"),
    );

    let closing = "}\n";
    let unpadded = body.len() + closing.len();
    let padded = unpadded.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    body.extend(std::iter::repeat(' ').take(padded - unpadded));
    body.push_str(closing);
    Ok(body)
}

/// Header block followed by the pixel data.
pub fn encode(record: &FrameRecord, image_number: usize) -> AppResult<Vec<u8>> {
    let frame = &record.frame;
    if frame.data.len() != frame.expected_len() {
        return Err(DaqError::InvalidParams(format!(
            "frame {} carries {} bytes, expected {}",
            record.sequence,
            frame.data.len(),
            frame.expected_len()
        )));
    }
    let header = header(record, image_number)?;
    let mut block = Vec::with_capacity(header.len() + frame.data.len());
    block.extend_from_slice(header.as_bytes());
    block.extend_from_slice(&frame.data);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::RawFrame;
    use chrono::Utc;

    fn record(sequence: u64, width: u32) -> FrameRecord {
        let pixels: Vec<u16> = (0..width as u16).collect();
        FrameRecord {
            sequence,
            timestamp: Utc::now(),
            frame: RawFrame::from_u16(width, 1, sequence, &pixels),
        }
    }

    #[test]
    fn test_header_is_block_aligned() {
        let header = header(&record(3, 512), 1).unwrap();
        assert_eq!(header.len() % BLOCK_SIZE, 0);
        assert!(header.starts_with("{\nHeaderID = EH:000001:000000:000000 ;\n"));
        assert!(header.ends_with("}\n"));
        assert!(header.contains("DataType = UnsignedShort ;\n"));
        assert!(header.contains("Dim_1 = 512 ;\n"));
        assert!(header.contains("Size = 1024 ;\n"));
        assert!(header.contains("acq_frame_nb = 3 ;\n"));
    }

    #[test]
    fn test_encode_appends_pixels() {
        let rec = record(0, 4);
        let block = encode(&rec, 2).unwrap();
        assert_eq!(block.len(), BLOCK_SIZE + 8);
        assert_eq!(&block[BLOCK_SIZE..], rec.frame.data.as_ref());
        let text = String::from_utf8_lossy(&block[..BLOCK_SIZE]);
        assert!(text.contains("Image = 2 ;"));
    }

    #[test]
    fn test_encode_rejects_truncated_payload() {
        let mut rec = record(5, 4);
        rec.frame.data = rec.frame.data.slice(..6);
        assert!(matches!(encode(&rec, 1), Err(DaqError::InvalidParams(_))));
    }
}
