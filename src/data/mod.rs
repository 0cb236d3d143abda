//! Frame types and the bounded frame buffer shared by acquisition and saving.
pub mod frame;
pub mod frame_buffer;

pub use frame::{FrameRecord, RawFrame};
pub use frame_buffer::{
    BufferError, BufferStats, FrameBuffer, OverflowPolicy, ReadReservation, SlotStatus,
    WriteReservation,
};
