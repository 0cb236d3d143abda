//! Hardware adapters.
//!
//! - [`capabilities`]: the adapter contract consumed by the acquisition core
//! - [`mock`]: simulated detector for tests and dry runs
//! - [`ultra`]: Ultra linear-array head over TCP commands and UDP frames

pub mod capabilities;
pub mod mock;
pub mod ultra;

use std::sync::Arc;
use tracing::info;

use crate::config::{DetectorConfig, DetectorKind};
use crate::error::AppResult;

pub use capabilities::{
    ensure_subsystem, CalibrationTable, ChannelCalibration, DetectorInfo, FrameEvent,
    HardwareAdapter, Subsystem, Telemetry, TimingParams, TriggerMode,
};
pub use mock::{MockDetector, MockDetectorBuilder, MockDetectorConfig};
pub use ultra::{UltraConfig, UltraDetector};

/// Build the adapter selected by `config.kind`.
///
/// The Ultra adapter connects to the head and reads its type before
/// returning.
pub async fn connect(config: &DetectorConfig) -> AppResult<Arc<dyn HardwareAdapter>> {
    let adapter: Arc<dyn HardwareAdapter> = match config.kind {
        DetectorKind::Mock => Arc::new(MockDetector::with_config(config.mock.clone())),
        DetectorKind::Ultra => Arc::new(UltraDetector::connect(config.ultra.clone()).await?),
    };
    let info = adapter.describe();
    info!(
        detector = %info.detector_type,
        model = %info.model,
        width = info.width,
        height = info.height,
        "Detector ready"
    );
    Ok(adapter)
}
