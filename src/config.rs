//! Configuration System using Figment
//!
//! Strongly-typed configuration for the acquisition pipeline. Configuration is
//! loaded from:
//! 1. `config/ultra_daq.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `ULTRA_DAQ_`, nested with `__`
//!
//! Every field has a default so an empty file yields a usable mock setup.
//!
//! # Example
//! ```no_run
//! use ultra_daq::config::DaqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // ULTRA_DAQ_SAVING__DIRECTORY=/data/run42 overrides [saving].directory
//! let config = DaqConfig::load()?;
//! config.validate()?;
//! println!("Saving to {}", config.saving.directory.display());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::acquisition::AcquisitionConfig;
use crate::data::frame_buffer::OverflowPolicy;
use crate::error::{AppResult, DaqError};
use crate::hardware::mock::MockDetectorConfig;
use crate::hardware::ultra::UltraConfig;
use crate::pipeline::PipelineConfig;
use crate::saving::SavingConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ultra_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ULTRA_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Detector selection and connection settings
    pub detector: DetectorConfig,
    /// Acquisition controller and buffer settings
    pub acquisition: AcquisitionSettings,
    /// Saving policy
    pub saving: SavingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Ultra DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Which hardware adapter to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Simulated detector.
    #[default]
    Mock,
    /// Ultra head over TCP/UDP.
    Ultra,
}

/// Detector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Adapter selection
    pub kind: DetectorKind,
    /// Simulated detector parameters
    pub mock: MockDetectorConfig,
    /// Ultra head network parameters
    pub ultra: UltraConfig,
}

/// Acquisition controller and buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    /// Number of frame slots in the ring buffer
    pub buffer_capacity: usize,
    /// Frames per acquisition (0 = continuous)
    pub requested_frames: u64,
    /// Producer behaviour when the buffer is full
    pub overflow_policy: OverflowPolicy,
    /// Bound on a blocked write reservation, in milliseconds
    pub reserve_timeout_ms: u64,
    /// Bound on arming the hardware, in milliseconds
    pub start_timeout_ms: u64,
    /// Bound on hardware quiescence after stop, in milliseconds
    pub stop_timeout_ms: u64,
    /// Bound on draining the buffer to storage, in milliseconds
    pub drain_timeout_ms: u64,
    /// Number of recent frame events considered for the error rate
    pub error_window: usize,
    /// Errors tolerated inside the window before faulting
    pub max_errors_in_window: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            requested_frames: 1,
            overflow_policy: OverflowPolicy::default(),
            reserve_timeout_ms: 1000,
            start_timeout_ms: 2000,
            stop_timeout_ms: 2000,
            drain_timeout_ms: 10_000,
            error_window: 100,
            max_errors_in_window: 10,
        }
    }
}

fn default_buffer_capacity() -> usize {
    64
}

impl AcquisitionSettings {
    /// Controller configuration derived from these settings.
    pub fn to_acquisition_config(&self) -> AcquisitionConfig {
        AcquisitionConfig {
            overflow_policy: self.overflow_policy,
            reserve_timeout: Duration::from_millis(self.reserve_timeout_ms),
            start_timeout: Duration::from_millis(self.start_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            error_window: self.error_window,
            max_errors_in_window: self.max_errors_in_window,
        }
    }
}

impl DaqConfig {
    /// Load configuration from `config/ultra_daq.toml` and environment variables
    ///
    /// Example override: `ULTRA_DAQ_ACQUISITION__REQUESTED_FRAMES=5`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::InvalidConfig(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::InvalidConfig(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.acquisition.buffer_capacity == 0 {
            return Err(DaqError::InvalidConfig(
                "buffer_capacity must be at least 1".into(),
            ));
        }

        if self.acquisition.drain_timeout_ms == 0 {
            return Err(DaqError::InvalidConfig(
                "drain_timeout_ms must be greater than 0".into(),
            ));
        }

        self.acquisition.to_acquisition_config().validate()?;
        self.saving.validate()?;

        if self.detector.kind == DetectorKind::Ultra && self.detector.ultra.npixels == 0 {
            return Err(DaqError::InvalidConfig("ultra.npixels must be > 0".into()));
        }

        Ok(())
    }

    /// Pipeline configuration derived from the acquisition and saving sections.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_capacity: self.acquisition.buffer_capacity,
            requested_frames: self.acquisition.requested_frames,
            acquisition: self.acquisition.to_acquisition_config(),
            saving: self.saving.clone(),
            drain_timeout: Duration::from_millis(self.acquisition.drain_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saving::{OverwritePolicy, SavingFormat, SavingMode};
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = DaqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detector.kind, DetectorKind::Mock);
        assert_eq!(config.saving.prefix, "ultra_");
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[detector]
kind = "ultra"

[detector.ultra]
head_ip = "10.0.0.5"
npixels = 1024

[acquisition]
buffer_capacity = 8
requested_frames = 5
overflow_policy = "drop_oldest"

[saving]
directory = "/tmp"
format = "edf"
mode = "multi_frame_batch"
overwrite_policy = "overwrite"
frames_per_file = 10
"#
        )
        .unwrap();

        let config = DaqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.detector.kind, DetectorKind::Ultra);
        assert_eq!(config.detector.ultra.head_ip, "10.0.0.5");
        assert_eq!(config.detector.ultra.npixels, 1024);
        assert_eq!(config.detector.ultra.tcp_port, 7);
        assert_eq!(config.acquisition.buffer_capacity, 8);
        assert_eq!(config.acquisition.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.saving.format, SavingFormat::Edf);
        assert_eq!(config.saving.mode, SavingMode::MultiFrameBatch);
        assert_eq!(config.saving.overwrite_policy, OverwritePolicy::Overwrite);
        assert!(config.validate().is_ok());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.buffer_capacity, 8);
        assert_eq!(pipeline.requested_frames, 5);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaqConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.acquisition.buffer_capacity, 64);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = DaqConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(
            config.validate(),
            Err(DaqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = DaqConfig::default();
        config.acquisition.buffer_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_error_window_smaller_than_threshold_rejected() {
        let mut config = DaqConfig::default();
        config.acquisition.error_window = 4;
        config.acquisition.max_errors_in_window = 5;
        assert!(config.validate().is_err());
    }
}
