//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the frame
//! buffer, both controllers, the saving backends and the hardware adapters.
//!
//! ## Error Hierarchy
//!
//! - **Configuration** (`InvalidConfig`, `InvalidPath`, `InvalidParams`,
//!   `InvalidChannel`, `UnsupportedSubsystem`): rejected requests. State is left
//!   unchanged.
//! - **Hardware** (`HardwareFault`, `HardwareError`, `Protocol`): a fault blocks
//!   `prepare`; a per-frame error is counted and the session continues.
//! - **Flow control** (`Overflow`, `SlotBusy`, `Timeout`, `Cancelled`): raised by
//!   the frame buffer and by bounded waits on hardware.
//! - **Saving** (`FileExists`, `SavingTimeout`, `Io`): attached to the sequence
//!   number of the frame that failed.
//!
//! Counters and saving failure records store an [`ErrorKind`] rather than the
//! error itself so status snapshots stay `Clone` and serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Frame buffer overflow: {0}")]
    Overflow(String),

    #[error("Frame slot busy: {0}")]
    SlotBusy(String),

    #[error("File already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("Invalid path '{}': {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Saving timed out with {remaining} frame(s) not persisted")]
    SavingTimeout { remaining: usize },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Invalid channel {channel}: detector has {count} channels")]
    InvalidChannel { channel: usize, count: usize },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Subsystem '{0}' is not supported by this detector")]
    UnsupportedSubsystem(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),
}

impl DaqError {
    /// Build a `Timeout` error from the operation name and the bound that expired.
    pub fn timeout(operation: impl Into<String>, bound: std::time::Duration) -> Self {
        DaqError::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Shorthand for the illegal state transition flavour of `InvalidConfig`.
    pub fn illegal_transition(operation: &str, state: impl fmt::Display) -> Self {
        DaqError::InvalidConfig(format!("cannot {operation} while {state}"))
    }

    /// The kind used for counting and failure attribution.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::InvalidConfig(_) | DaqError::Config(_) => ErrorKind::InvalidConfig,
            DaqError::HardwareFault(_) => ErrorKind::HardwareFault,
            DaqError::HardwareError(_) | DaqError::Protocol(_) => ErrorKind::HardwareError,
            DaqError::Overflow(_) => ErrorKind::Overflow,
            DaqError::SlotBusy(_) => ErrorKind::SlotBusy,
            DaqError::FileExists(_) => ErrorKind::FileExists,
            DaqError::InvalidPath { .. } => ErrorKind::InvalidPath,
            DaqError::SavingTimeout { .. } => ErrorKind::SavingTimeout,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::InvalidChannel { .. } => ErrorKind::InvalidChannel,
            DaqError::InvalidParams(_) | DaqError::UnsupportedSubsystem(_) => {
                ErrorKind::InvalidParams
            }
            DaqError::Cancelled => ErrorKind::Cancelled,
            DaqError::Io(_) => ErrorKind::Io,
        }
    }

    /// Errors that end a session regardless of the saving policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::HardwareFault(_)
                | DaqError::FileExists(_)
                | DaqError::InvalidPath { .. }
                | DaqError::Timeout { .. }
        )
    }
}

/// Error classification carried by counters and status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected configuration or illegal state transition.
    InvalidConfig,
    /// Detector reports a fault or over-temperature condition.
    HardwareFault,
    /// Recoverable per-frame hardware or transport error.
    HardwareError,
    /// Frame discarded because the buffer was full.
    Overflow,
    /// Reservation conflict inside the frame buffer.
    SlotBusy,
    /// Target file exists under the `Abort` overwrite policy.
    FileExists,
    /// Saving directory missing or not writable.
    InvalidPath,
    /// Frame still unsaved when the drain bound expired.
    SavingTimeout,
    /// Start or stop exceeded its bound.
    Timeout,
    /// Calibration channel out of range.
    InvalidChannel,
    /// Parameter rejected by the hardware adapter.
    InvalidParams,
    /// Work abandoned because the session was cancelled or faulted.
    Cancelled,
    /// Underlying I/O failure.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidConfig => "InvalidConfig",
            ErrorKind::HardwareFault => "HardwareFault",
            ErrorKind::HardwareError => "HardwareError",
            ErrorKind::Overflow => "Overflow",
            ErrorKind::SlotBusy => "SlotBusy",
            ErrorKind::FileExists => "FileExists",
            ErrorKind::InvalidPath => "InvalidPath",
            ErrorKind::SavingTimeout => "SavingTimeout",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::InvalidChannel => "InvalidChannel",
            ErrorKind::InvalidParams => "InvalidParams",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "Io",
        };
        f.write_str(name)
    }
}
