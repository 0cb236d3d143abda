//! # Ultra DAQ Core Library
//!
//! Acquisition and saving pipeline for Ultra linear-array detector heads. The
//! library carries the whole engine so the `ultra-daq` CLI and integration
//! tests share one implementation.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: `AcquisitionController`, the acquisition state machine
//!   and the producer task moving frames from the hardware into the buffer.
//! - **`config`**: figment-based `DaqConfig` loaded from TOML and `ULTRA_DAQ_*`
//!   environment variables.
//! - **`data`**: `RawFrame` and the bounded `FrameBuffer` shared by producer
//!   and consumer.
//! - **`error`**: the `DaqError` enum and the `ErrorKind` used for counting.
//! - **`hardware`**: the `HardwareAdapter` contract, a simulated detector and
//!   the Ultra head adapter.
//! - **`logging`**: tracing-subscriber initialization.
//! - **`pipeline`**: `Pipeline`, the composition root and caller-facing API.
//! - **`saving`**: `SavingController`, file naming, overwrite policies and the
//!   EDF, raw and TIFF encoders.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod pipeline;
pub mod saving;

pub use acquisition::{AcqState, AcquisitionController, AcquisitionStatus};
pub use error::{AppResult, DaqError, ErrorKind};
pub use pipeline::{Pipeline, PipelineConfig, PipelineState, PipelineStatus};
