//! Acquisition pipeline.
//!
//! Composition root owning the hardware adapter, the frame buffer and both
//! controllers. Callers drive the whole chain through [`Pipeline`]:
//!
//! ```text
//! HardwareAdapter ──> AcquisitionController ──> FrameBuffer ──> SavingController ──> files
//! ```
//!
//! `start_acq` spawns a supervisor task that ties the two controllers
//! together:
//! - once acquisition leaves Running, saving is drained and stopped
//! - when saving faults, acquisition is faulted with the same error
//!
//! # Example
//!
//! ```rust,ignore
//! let detector: Arc<dyn HardwareAdapter> = Arc::new(MockDetector::new(512, 1));
//! let pipeline = Pipeline::new(detector, PipelineConfig::default())?;
//! pipeline.set_directory("/data/run42").await?;
//! pipeline.set_acq_nb_frames(5)?;
//! pipeline.prepare_acq().await?;
//! pipeline.start_acq().await?;
//! let status = pipeline.wait_for_completion(Duration::from_secs(10)).await?;
//! ```

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acquisition::{AcqState, AcquisitionConfig, AcquisitionController, AcquisitionSession};
use crate::config::DaqConfig;
use crate::data::frame_buffer::FrameBuffer;
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::hardware::capabilities::{
    CalibrationTable, ChannelCalibration, DetectorInfo, HardwareAdapter, Subsystem, Telemetry,
    TimingParams,
};
use crate::saving::{
    OverwritePolicy, SavingConfig, SavingController, SavingFormat, SavingMode, SavingState,
};

// =============================================================================
// Configuration
// =============================================================================

/// Pipeline parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Frame slots, fixed for the lifetime of the pipeline
    pub buffer_capacity: usize,
    /// Frames per acquisition, 0 = until stopped
    pub requested_frames: u64,
    /// Acquisition controller parameters
    pub acquisition: AcquisitionConfig,
    /// Saving policy
    pub saving: SavingConfig,
    /// Bound on persisting the frames left when acquisition ends
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            requested_frames: 1,
            acquisition: AcquisitionConfig::default(),
            saving: SavingConfig::default(),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineConfig {
    /// Validate everything except the saving directory, which is checked at
    /// prepare time.
    pub fn validate(&self) -> AppResult<()> {
        if self.buffer_capacity == 0 {
            return Err(DaqError::InvalidConfig(
                "buffer_capacity must be > 0".into(),
            ));
        }
        if self.drain_timeout.is_zero() {
            return Err(DaqError::InvalidConfig("drain_timeout must be > 0".into()));
        }
        self.acquisition.validate()?;
        self.saving.validate()
    }
}

// =============================================================================
// Status
// =============================================================================

/// Combined pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    /// Nothing running
    Idle,
    /// Both controllers ready for `start_acq`
    Prepared,
    /// Acquisition running
    Running,
    /// Acquisition winding down or saving still draining
    Stopping,
    /// Either controller faulted
    Fault,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Prepared => write!(f, "Prepared"),
            PipelineState::Running => write!(f, "Running"),
            PipelineState::Stopping => write!(f, "Stopping"),
            PipelineState::Fault => write!(f, "Fault"),
        }
    }
}

/// Combined status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    /// Combined state
    pub state: PipelineState,
    /// Frames delivered by the hardware
    pub captured_count: u64,
    /// Acquisition errors of all kinds
    pub error_count: u64,
    /// Frames discarded for lack of buffer space
    pub overflow_count: u64,
    /// Frames the hardware reported as bad or lost
    pub hardware_error_count: u64,
    /// Frames persisted
    pub saved_count: u64,
    /// Frames that could not be persisted
    pub saving_error_count: u64,
    /// Saving controller state
    pub saving_state: SavingState,
    /// Most recent error of either controller, acquisition first
    pub last_error: Option<String>,
}

fn combine(acq: AcqState, saving: SavingState, draining: bool) -> PipelineState {
    if acq == AcqState::Fault || saving == SavingState::Fault {
        return PipelineState::Fault;
    }
    match acq {
        AcqState::Running => PipelineState::Running,
        AcqState::Stopping => PipelineState::Stopping,
        AcqState::Idle if draining => PipelineState::Stopping,
        AcqState::Idle => PipelineState::Idle,
        AcqState::Prepared => PipelineState::Prepared,
        AcqState::Fault => PipelineState::Fault,
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Caller-facing acquisition pipeline.
pub struct Pipeline {
    hardware: Arc<dyn HardwareAdapter>,
    buffer: Arc<FrameBuffer>,
    acquisition: Arc<AcquisitionController>,
    saving: Arc<SavingController>,
    config: parking_lot::Mutex<PipelineConfig>,
    command_lock: tokio::sync::Mutex<()>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<AppResult<()>>>>,
    draining_tx: watch::Sender<bool>,
}

impl Pipeline {
    /// Pipeline over `hardware` with a frame buffer of
    /// `config.buffer_capacity` slots.
    pub fn new(hardware: Arc<dyn HardwareAdapter>, config: PipelineConfig) -> AppResult<Self> {
        Self::with_saving(hardware, config, SavingController::new())
    }

    /// Same as [`new`](Self::new) with a caller-built saving controller.
    pub fn with_saving(
        hardware: Arc<dyn HardwareAdapter>,
        config: PipelineConfig,
        saving: SavingController,
    ) -> AppResult<Self> {
        config.validate()?;
        let buffer = Arc::new(FrameBuffer::new(
            config.buffer_capacity,
            config.acquisition.overflow_policy,
        ));
        let acquisition = Arc::new(AcquisitionController::new(
            Arc::clone(&hardware),
            Arc::clone(&buffer),
        ));
        acquisition.set_requested_frames(config.requested_frames)?;
        let (draining_tx, _) = watch::channel(false);

        let info = hardware.describe();
        info!(
            detector = %info.detector_type,
            model = %info.model,
            capacity = config.buffer_capacity,
            "Pipeline created"
        );
        Ok(Self {
            hardware,
            buffer,
            acquisition,
            saving: Arc::new(saving),
            config: parking_lot::Mutex::new(config),
            command_lock: tokio::sync::Mutex::new(()),
            supervisor: parking_lot::Mutex::new(None),
            draining_tx,
        })
    }

    /// Pipeline configured from the `[acquisition]` and `[saving]` sections.
    pub fn from_config(config: &DaqConfig, hardware: Arc<dyn HardwareAdapter>) -> AppResult<Self> {
        config.validate()?;
        Self::new(hardware, config.pipeline_config())
    }

    /// Acquisition controller.
    pub fn acquisition(&self) -> &Arc<AcquisitionController> {
        &self.acquisition
    }

    /// Saving controller.
    pub fn saving(&self) -> &Arc<SavingController> {
        &self.saving
    }

    /// Shared frame buffer.
    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }

    /// Hardware adapter.
    pub fn hardware(&self) -> &Arc<dyn HardwareAdapter> {
        &self.hardware
    }

    /// Current configuration.
    pub fn config(&self) -> PipelineConfig {
        self.config.lock().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Configure and arm saving, then prepare acquisition.
    ///
    /// Both controllers must be Idle; otherwise `InvalidConfig` and nothing
    /// changes. A failed acquisition prepare disarms saving again.
    pub async fn prepare_acq(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.state();
        if state != PipelineState::Idle || self.saving.state() != SavingState::Idle {
            return Err(DaqError::illegal_transition("prepare", state));
        }

        let config = self.config();
        config.validate()?;
        self.saving.configure(config.saving.clone()).await?;
        self.saving.arm().await?;

        let session = AcquisitionSession::new(config.requested_frames);
        if let Err(e) = self
            .acquisition
            .prepare(session, config.acquisition.clone())
            .await
        {
            if let Err(disarm) = self.saving.disarm().await {
                warn!(error = %disarm, "Saving disarm after failed prepare");
            }
            return Err(e);
        }
        info!(
            requested_frames = config.requested_frames,
            directory = %config.saving.directory.display(),
            "Pipeline prepared"
        );
        Ok(())
    }

    /// Start saving, then acquisition. Returns once the hardware is armed.
    pub async fn start_acq(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.acquisition.state();
        if state != AcqState::Prepared {
            return Err(DaqError::illegal_transition("start", state));
        }
        // A session that completed without stop_acq leaves its supervisor behind
        if let Err(e) = self.join_supervisor().await {
            warn!(error = %e, "Previous session ended with an error");
        }

        self.saving.start(Arc::clone(&self.buffer)).await?;
        self.draining_tx.send_replace(true);
        let drain_timeout = self.config.lock().drain_timeout;
        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.acquisition),
            Arc::clone(&self.saving),
            drain_timeout,
            self.draining_tx.clone(),
        ));
        *self.supervisor.lock() = Some(supervisor);

        // A failed start leaves acquisition in Fault; the supervisor drains
        // saving on its own.
        self.acquisition.start().await?;
        info!("Pipeline started");
        Ok(())
    }

    /// Stop acquisition and wait until saving has drained. Idempotent.
    pub async fn stop_acq(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let stopped = self.acquisition.stop().await;
        let drained = self.join_supervisor().await;
        if self.saving.state() == SavingState::Armed {
            self.saving.disarm().await?;
        }
        debug!(state = %self.state(), "Pipeline stopped");
        stopped.and(drained)
    }

    /// Recover both controllers from Fault.
    pub async fn reset(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.acquisition.state();
        if !matches!(state, AcqState::Idle | AcqState::Fault) {
            return Err(DaqError::illegal_transition("reset", state));
        }
        if let Err(e) = self.join_supervisor().await {
            debug!(error = %e, "Supervisor result discarded by reset");
        }
        if self.saving.state() == SavingState::Armed {
            self.saving.disarm().await?;
        }
        self.acquisition.reset().await?;
        self.saving.reset().await?;
        info!("Pipeline reset");
        Ok(())
    }

    async fn join_supervisor(&self) -> AppResult<()> {
        let handle = self.supervisor.lock().take();
        match handle {
            Some(handle) => handle.await.unwrap_or_else(|join_error| {
                self.draining_tx.send_replace(false);
                Err(DaqError::HardwareError(format!(
                    "supervisor task failed: {join_error}"
                )))
            }),
            None => Ok(()),
        }
    }

    fn state(&self) -> PipelineState {
        combine(
            self.acquisition.state(),
            self.saving.state(),
            *self.draining_tx.borrow(),
        )
    }

    /// Combined status snapshot.
    pub fn get_status(&self) -> PipelineStatus {
        let acq = self.acquisition.status();
        let saving = self.saving.status();
        PipelineStatus {
            state: combine(acq.state, saving.state, *self.draining_tx.borrow()),
            captured_count: acq.captured_count,
            error_count: acq.error_count,
            overflow_count: acq.overflow_count,
            hardware_error_count: acq.hardware_error_count,
            saved_count: saving.saved_count,
            saving_error_count: saving.error_count,
            saving_state: saving.state,
            last_error: acq.last_error.or(saving.last_error),
        }
    }

    /// Resolve once the pipeline is Idle or Fault, with saving drained.
    pub async fn wait_for_completion(&self, timeout: Duration) -> AppResult<PipelineStatus> {
        let mut acq_rx = self.acquisition.subscribe();
        let mut saving_rx = self.saving.subscribe();
        let mut draining_rx = self.draining_tx.subscribe();

        let wait = async {
            loop {
                let status = self.get_status();
                if matches!(status.state, PipelineState::Idle | PipelineState::Fault)
                    && !*draining_rx.borrow_and_update()
                {
                    return status;
                }
                tokio::select! {
                    _ = acq_rx.changed() => {}
                    _ = saving_rx.changed() => {}
                    _ = draining_rx.changed() => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DaqError::timeout("acquisition completion", timeout))
    }

    // =========================================================================
    // Configuration setters (Idle or Prepared)
    // =========================================================================

    fn ensure_configurable(&self, operation: &str) -> AppResult<AcqState> {
        let state = self.acquisition.state();
        if !state.is_configurable() || self.saving.state().is_active() {
            return Err(DaqError::illegal_transition(operation, self.state()));
        }
        Ok(state)
    }

    /// Frames per acquisition, 0 = until stopped.
    pub fn set_acq_nb_frames(&self, frames: u64) -> AppResult<()> {
        self.ensure_configurable("change the frame count")?;
        self.acquisition.set_requested_frames(frames)?;
        self.config.lock().requested_frames = frames;
        Ok(())
    }

    async fn update_saving(
        &self,
        operation: &str,
        change: impl FnOnce(&mut SavingConfig),
    ) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.ensure_configurable(operation)?;
        let mut saving = self.config.lock().saving.clone();
        change(&mut saving);
        saving.validate()?;
        if state == AcqState::Prepared {
            self.saving.configure(saving.clone()).await?;
        }
        self.config.lock().saving = saving;
        Ok(())
    }

    /// Replace the whole saving configuration.
    pub async fn set_saving_config(&self, config: SavingConfig) -> AppResult<()> {
        self.update_saving("change the saving configuration", |saving| *saving = config)
            .await
    }

    /// Output directory.
    pub async fn set_directory(&self, directory: impl Into<PathBuf>) -> AppResult<()> {
        let directory = directory.into();
        self.update_saving("change the directory", |saving| saving.directory = directory)
            .await
    }

    /// File format.
    pub async fn set_format(&self, format: SavingFormat) -> AppResult<()> {
        self.update_saving("change the format", |saving| saving.format = format)
            .await
    }

    /// File name prefix.
    pub async fn set_prefix(&self, prefix: impl Into<String>) -> AppResult<()> {
        let prefix = prefix.into();
        self.update_saving("change the prefix", |saving| saving.prefix = prefix)
            .await
    }

    /// File name suffix.
    pub async fn set_suffix(&self, suffix: impl Into<String>) -> AppResult<()> {
        let suffix = suffix.into();
        self.update_saving("change the suffix", |saving| saving.suffix = suffix)
            .await
    }

    /// Frame to file mapping.
    pub async fn set_saving_mode(&self, mode: SavingMode) -> AppResult<()> {
        self.update_saving("change the saving mode", |saving| saving.mode = mode)
            .await
    }

    /// Existing file handling.
    pub async fn set_overwrite_policy(&self, policy: OverwritePolicy) -> AppResult<()> {
        self.update_saving("change the overwrite policy", |saving| {
            saving.overwrite_policy = policy
        })
        .await
    }

    /// Frames per file in batch mode.
    pub async fn set_frames_per_file(&self, frames: usize) -> AppResult<()> {
        self.update_saving("change frames per file", |saving| {
            saving.frames_per_file = frames
        })
        .await
    }

    /// Index of the first file.
    pub async fn set_next_number(&self, number: u64) -> AppResult<()> {
        self.update_saving("change the file number", |saving| saving.next_number = number)
            .await
    }

    // =========================================================================
    // Hardware pass-through
    // =========================================================================

    /// Static detector description.
    pub fn describe(&self) -> DetectorInfo {
        self.hardware.describe()
    }

    /// Live telemetry snapshot.
    pub async fn telemetry(&self) -> AppResult<Telemetry> {
        self.hardware.telemetry().await
    }

    /// Calibration of one channel.
    pub async fn calibration(&self, channel: usize) -> AppResult<ChannelCalibration> {
        self.hardware.calibration(channel).await
    }

    /// Write the calibration of one channel.
    pub async fn set_calibration(
        &self,
        channel: usize,
        calibration: ChannelCalibration,
    ) -> AppResult<()> {
        self.hardware.set_calibration(channel, calibration).await
    }

    /// Calibration of every channel.
    pub async fn calibration_table(&self) -> AppResult<CalibrationTable> {
        self.hardware.calibration_table().await
    }

    /// Timing parameters.
    pub async fn timing(&self) -> AppResult<TimingParams> {
        self.hardware.timing().await
    }

    /// Apply timing parameters. Only in Idle or Prepared.
    pub async fn set_timing(&self, params: &TimingParams) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        self.ensure_configurable("change timing")?;
        self.hardware.set_timing(params).await
    }

    /// Switch a subsystem on or off.
    pub async fn set_subsystem(&self, subsystem: Subsystem, enabled: bool) -> AppResult<()> {
        self.hardware.set_subsystem_enabled(subsystem, enabled).await
    }

    /// Whether a subsystem is on.
    pub async fn subsystem_enabled(&self, subsystem: Subsystem) -> AppResult<bool> {
        self.hardware.subsystem_enabled(subsystem).await
    }

    /// Persist the head settings in the detector.
    pub async fn save_configuration(&self) -> AppResult<()> {
        self.hardware.save_configuration().await
    }

    /// Reload the persisted head settings.
    pub async fn restore_configuration(&self) -> AppResult<()> {
        self.hardware.restore_configuration().await
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// Fault acquisition when saving faults; drain saving once acquisition is
/// no longer running.
async fn supervise(
    acquisition: Arc<AcquisitionController>,
    saving: Arc<SavingController>,
    drain_timeout: Duration,
    draining_tx: watch::Sender<bool>,
) -> AppResult<()> {
    let mut acq_rx = acquisition.subscribe();
    let mut saving_rx = saving.subscribe();

    loop {
        let acq_state = acq_rx.borrow_and_update().state;
        if matches!(acq_state, AcqState::Idle | AcqState::Fault) {
            break;
        }
        let saving_status = saving_rx.borrow_and_update().clone();
        if saving_status.state == SavingState::Fault {
            let kind = saving_status.last_error_kind.unwrap_or(ErrorKind::Io);
            let message = saving_status
                .last_error
                .unwrap_or_else(|| "saving faulted".to_string());
            acquisition.fault_with(kind, message);
            continue;
        }
        tokio::select! {
            changed = acq_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = saving_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Acquisition ended, draining saving");
    let result = saving.drain_and_stop(drain_timeout).await;
    draining_tx.send_replace(false);
    result
}
