//! Hardware Adapter Contract
//!
//! The acquisition core talks to a detector only through [`HardwareAdapter`].
//! Adapters are swappable: the simulated [`MockDetector`](super::mock::MockDetector)
//! and the network-attached [`UltraDetector`](super::ultra::UltraDetector)
//! implement the same trait.
//!
//! # Control versus diagnostics
//!
//! Only three groups of methods drive control decisions inside the core:
//! - frame delivery ([`next_frame`](HardwareAdapter::next_frame)),
//! - the frame error counter ([`frame_error_count`](HardwareAdapter::frame_error_count)),
//! - timing setters and arm/disarm.
//!
//! Everything else (telemetry, calibration, subsystem flags) is best-effort
//! diagnostics. The one exception is the explicit live telemetry read at
//! `prepare`, which gates on an active fault or over-temperature.
//!
//! # Design Philosophy
//!
//! - One telemetry snapshot instead of a getter per sensor
//! - Subsystem toggles keyed by [`Subsystem`], validated against the
//!   adapter-declared capability set
//! - Calibration as a bounds-checked [`CalibrationTable`]
//! - Frame delivery as a pollable queue, whatever the hardware uses underneath

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::data::frame::RawFrame;
use crate::error::{AppResult, DaqError};

// =============================================================================
// Subsystems
// =============================================================================

/// Switchable detector subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Sensor head supply
    HeadPower,
    /// Thermo-electric cooler supply
    TecPower,
    /// Sensor bias voltage
    Bias,
    /// External synchronisation input
    Sync,
    /// Calibration pulse injection
    Calibration,
    /// Eight-phase readout clock
    EightPhaseClock,
}

impl Subsystem {
    /// Every subsystem, in declaration order.
    pub const ALL: [Subsystem; 6] = [
        Subsystem::HeadPower,
        Subsystem::TecPower,
        Subsystem::Bias,
        Subsystem::Sync,
        Subsystem::Calibration,
        Subsystem::EightPhaseClock,
    ];
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::HeadPower => "head_power",
            Subsystem::TecPower => "tec_power",
            Subsystem::Bias => "bias",
            Subsystem::Sync => "sync",
            Subsystem::Calibration => "calibration",
            Subsystem::EightPhaseClock => "eight_phase_clock",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Snapshots and parameters
// =============================================================================

/// Static description of a detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorInfo {
    /// Detector family, e.g. "Ultra"
    pub detector_type: String,
    /// Model or head variant
    pub model: String,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Bits per pixel
    pub bit_depth: u8,
    /// Pixel pitch (x, y) in micrometers
    pub pixel_size_um: (f64, f64),
}

/// Read-only diagnostics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    /// Temperatures in degrees Celsius, by sensor name
    pub temperatures: BTreeMap<String, f64>,
    /// Supply and reference voltages in volts, by rail name
    pub voltages: BTreeMap<String, f64>,
    /// Raw control registers, by register name
    pub registers: BTreeMap<String, u32>,
    /// Subsystem flags as last read from the hardware
    pub subsystems: BTreeMap<Subsystem, bool>,
    /// Cooler or head over-temperature condition
    pub over_temperature: bool,
    /// Active fault reported by the hardware
    pub fault: Option<String>,
    /// Frames produced by the hardware since power-up or re-arm
    pub frame_count: u64,
    /// Frame errors counted by the hardware
    pub frame_error_count: u64,
}

impl Telemetry {
    /// Whether the detector may start an acquisition.
    pub fn check_ready(&self) -> AppResult<()> {
        if let Some(fault) = &self.fault {
            return Err(DaqError::HardwareFault(fault.clone()));
        }
        if self.over_temperature {
            return Err(DaqError::HardwareFault(
                "detector reports over-temperature".into(),
            ));
        }
        Ok(())
    }
}

/// ADC calibration for one readout channel, in volts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    /// ADC offset
    pub offset: f64,
    /// ADC gain reference
    pub gain: f64,
}

/// Per-channel calibration with bounds-checked access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    entries: Vec<ChannelCalibration>,
}

impl CalibrationTable {
    /// Table of `channels` zeroed entries.
    pub fn new(channels: usize) -> Self {
        Self {
            entries: vec![ChannelCalibration::default(); channels],
        }
    }

    /// Table built from existing entries.
    pub fn from_entries(entries: Vec<ChannelCalibration>) -> Self {
        Self { entries }
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no channels.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Calibration of `channel`, `InvalidChannel` when out of range.
    pub fn get(&self, channel: usize) -> AppResult<ChannelCalibration> {
        self.entries
            .get(channel)
            .copied()
            .ok_or(DaqError::InvalidChannel {
                channel,
                count: self.entries.len(),
            })
    }

    /// Replace the calibration of `channel`.
    pub fn set(&mut self, channel: usize, calibration: ChannelCalibration) -> AppResult<()> {
        let count = self.entries.len();
        let entry = self
            .entries
            .get_mut(channel)
            .ok_or(DaqError::InvalidChannel { channel, count })?;
        *entry = calibration;
        Ok(())
    }

    /// Entries in channel order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelCalibration> {
        self.entries.iter()
    }
}

/// Trigger source and multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free running on the internal clock
    #[default]
    Internal,
    /// One internal trigger per frame
    InternalMulti,
    /// One external trigger starts the sequence
    ExternalSingle,
    /// One external trigger per frame
    ExternalMulti,
}

/// Control-relevant timing configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingParams {
    /// Integration time per frame
    pub exposure: Duration,
    /// Dead time between frames
    pub latency: Duration,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Sensor specific timing registers, by name
    pub registers: BTreeMap<String, u32>,
}

/// One item of the hardware frame queue.
#[derive(Debug, Clone)]
pub enum FrameEvent {
    /// A complete frame
    Frame(RawFrame),
    /// A frame the hardware reported as bad or lost
    Error(String),
}

// =============================================================================
// HardwareAdapter
// =============================================================================

/// Capability contract consumed by the acquisition core.
///
/// # Thread Safety
/// - All methods take `&self`; adapters use interior mutability
/// - `next_frame` is only ever polled by the acquisition task
#[async_trait]
pub trait HardwareAdapter: Send + Sync {
    /// Static detector description.
    fn describe(&self) -> DetectorInfo;

    /// Read a fresh telemetry snapshot from the hardware.
    async fn telemetry(&self) -> AppResult<Telemetry>;

    /// Number of calibration channels.
    fn channel_count(&self) -> usize;

    /// Calibration of one channel.
    ///
    /// # Returns
    /// - `Err(InvalidChannel)` when `channel >= channel_count()`
    async fn calibration(&self, channel: usize) -> AppResult<ChannelCalibration>;

    /// Write the calibration of one channel.
    async fn set_calibration(
        &self,
        channel: usize,
        calibration: ChannelCalibration,
    ) -> AppResult<()>;

    /// Read the whole calibration table.
    async fn calibration_table(&self) -> AppResult<CalibrationTable> {
        let mut entries = Vec::with_capacity(self.channel_count());
        for channel in 0..self.channel_count() {
            entries.push(self.calibration(channel).await?);
        }
        Ok(CalibrationTable::from_entries(entries))
    }

    /// Current timing parameters.
    async fn timing(&self) -> AppResult<TimingParams>;

    /// Program timing parameters.
    ///
    /// # Returns
    /// - `Err(InvalidParams)` when the hardware cannot honour them
    async fn set_timing(&self, params: &TimingParams) -> AppResult<()>;

    /// Subsystems this detector can switch.
    fn subsystems(&self) -> &[Subsystem];

    /// Whether a subsystem is enabled.
    async fn subsystem_enabled(&self, subsystem: Subsystem) -> AppResult<bool>;

    /// Enable or disable a subsystem.
    async fn set_subsystem_enabled(&self, subsystem: Subsystem, enabled: bool) -> AppResult<()>;

    /// Prepare the hardware to deliver `requested_frames` frames (0 = until disarmed).
    async fn arm(&self, requested_frames: u64) -> AppResult<()>;

    /// Stop frame delivery and wait for the hardware to go quiet.
    async fn disarm(&self) -> AppResult<()>;

    /// Next item of the frame queue.
    ///
    /// # Returns
    /// - `None` once the queue is closed (not armed, disarmed, or all
    ///   requested frames delivered)
    async fn next_frame(&self) -> Option<FrameEvent>;

    /// Frame errors counted by the hardware.
    async fn frame_error_count(&self) -> AppResult<u64>;

    /// Persist the current head settings in non-volatile memory.
    ///
    /// # Default Implementation
    /// Returns `InvalidParams`.
    async fn save_configuration(&self) -> AppResult<()> {
        Err(DaqError::InvalidParams(
            "configuration storage is not supported by this detector".into(),
        ))
    }

    /// Restore head settings from non-volatile memory.
    ///
    /// # Default Implementation
    /// Returns `InvalidParams`.
    async fn restore_configuration(&self) -> AppResult<()> {
        Err(DaqError::InvalidParams(
            "configuration storage is not supported by this detector".into(),
        ))
    }
}

/// `UnsupportedSubsystem` unless the adapter declares `subsystem`.
pub fn ensure_subsystem(adapter: &dyn HardwareAdapter, subsystem: Subsystem) -> AppResult<()> {
    if adapter.subsystems().contains(&subsystem) {
        Ok(())
    } else {
        Err(DaqError::UnsupportedSubsystem(subsystem.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_table_bounds() {
        let mut table = CalibrationTable::new(16);
        assert_eq!(table.len(), 16);

        let cal = ChannelCalibration {
            offset: 0.125,
            gain: 1.5,
        };
        table.set(15, cal).unwrap();
        assert_eq!(table.get(15).unwrap(), cal);

        assert!(matches!(
            table.get(16),
            Err(DaqError::InvalidChannel {
                channel: 16,
                count: 16
            })
        ));
        assert!(table.set(99, cal).is_err());
    }

    #[test]
    fn test_telemetry_readiness() {
        let mut telemetry = Telemetry::default();
        assert!(telemetry.check_ready().is_ok());

        telemetry.over_temperature = true;
        assert!(matches!(
            telemetry.check_ready(),
            Err(DaqError::HardwareFault(_))
        ));

        telemetry.over_temperature = false;
        telemetry.fault = Some("head trip".into());
        assert!(matches!(
            telemetry.check_ready(),
            Err(DaqError::HardwareFault(msg)) if msg == "head trip"
        ));
    }

    #[test]
    fn test_subsystem_names() {
        assert_eq!(Subsystem::EightPhaseClock.to_string(), "eight_phase_clock");
        assert_eq!(Subsystem::ALL.len(), 6);
    }
}
