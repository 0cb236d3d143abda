//! Saving controller.
//!
//! Drains the [`FrameBuffer`] strictly in sequence order and persists every
//! frame through a [`SavingBackend`].
//!
//! # State Machine
//!
//! ```text
//! Idle ──arm──> Armed ──start──> Saving ──drain_and_stop──> Draining ──> Idle
//!  ▲              │                 │                           │
//!  └───disarm─────┘                 └──── fatal saving error ───┴──> Fault ──reset──> Idle
//! ```
//!
//! File identity is resolved per frame:
//!
//! - `OneFilePerFrame`: index = `next_number + sequence`
//! - `MultiFrameBatch`: index = `next_number + batch`, `frames_per_file` saved
//!   frames per file
//! - `Manual`: frames are released without being written
//!
//! Under `OverwritePolicy::Abort` every saving error is fatal. Under the other
//! policies a failed frame is recorded as a [`SavingFailure`], its slot is
//! released with `fail_read` and saving continues.

pub mod backend;
pub mod config;
pub mod edf;
#[cfg(feature = "storage_tiff")]
pub mod tiff;

pub use backend::{FileBackend, FrameSink, OpenMode, SavingBackend};
pub use config::{OverwritePolicy, SavingConfig, SavingFormat, SavingMode};

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::data::frame::FrameRecord;
use crate::data::frame_buffer::{BufferError, FrameBuffer};
use crate::error::{AppResult, DaqError, ErrorKind};

/// Failures kept in the status snapshot.
pub const MAX_FAILURES: usize = 64;

/// How long the worker waits for a frame before re-checking cancellation.
const READ_POLL: Duration = Duration::from_millis(200);

/// Grace period for a cancelled worker to close its open file.
const CANCEL_GRACE: Duration = Duration::from_millis(500);

// =============================================================================
// State and status
// =============================================================================

/// Saving lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SavingState {
    /// No session
    Idle,
    /// Configured for the next session, worker not running
    Armed,
    /// Worker persisting frames
    Saving,
    /// Persisting the remaining frames before stopping
    Draining,
    /// Fatal saving error; only `reset()` leaves this state
    Fault,
}

impl fmt::Display for SavingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SavingState::Idle => write!(f, "Idle"),
            SavingState::Armed => write!(f, "Armed"),
            SavingState::Saving => write!(f, "Saving"),
            SavingState::Draining => write!(f, "Draining"),
            SavingState::Fault => write!(f, "Fault"),
        }
    }
}

impl SavingState {
    /// Whether a worker may be active.
    pub fn is_active(&self) -> bool {
        matches!(self, SavingState::Saving | SavingState::Draining)
    }
}

/// A frame that could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavingFailure {
    /// Buffer sequence number of the frame
    pub sequence: u64,
    /// Error classification
    pub kind: ErrorKind,
    /// Error message
    pub message: String,
}

/// Status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SavingStatus {
    /// Lifecycle state
    pub state: SavingState,
    /// Frames persisted (or released, in `Manual` mode)
    pub saved_count: u64,
    /// Frames that failed
    pub error_count: u64,
    /// Most recent failures, oldest first
    pub failures: Vec<SavingFailure>,
    /// Kind of the most recent error
    pub last_error_kind: Option<ErrorKind>,
    /// Message of the most recent error
    pub last_error: Option<String>,
}

struct Inner {
    state: SavingState,
    config: Option<SavingConfig>,
    saved_count: u64,
    error_count: u64,
    failures: VecDeque<SavingFailure>,
    last_error: Option<(ErrorKind, String)>,
}

impl Inner {
    fn snapshot(&self) -> SavingStatus {
        SavingStatus {
            state: self.state,
            saved_count: self.saved_count,
            error_count: self.error_count,
            failures: self.failures.iter().cloned().collect(),
            last_error_kind: self.last_error.as_ref().map(|(kind, _)| *kind),
            last_error: self.last_error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }

    fn record_failure(&mut self, sequence: u64, kind: ErrorKind, message: String) {
        self.error_count += 1;
        if self.failures.len() == MAX_FAILURES {
            self.failures.pop_front();
        }
        self.failures.push_back(SavingFailure {
            sequence,
            kind,
            message: message.clone(),
        });
        self.last_error = Some((kind, message));
    }
}

struct Shared {
    inner: parking_lot::Mutex<Inner>,
    status_tx: watch::Sender<SavingStatus>,
}

impl Shared {
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        self.status_tx.send_replace(inner.snapshot());
        result
    }

    fn state(&self) -> SavingState {
        self.inner.lock().state
    }
}

struct Worker {
    cancel_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    buffer: Arc<FrameBuffer>,
}

// =============================================================================
// SavingController
// =============================================================================

/// Persists the frames of one buffer.
pub struct SavingController {
    shared: Arc<Shared>,
    backend: Option<Arc<dyn SavingBackend>>,
    command_lock: tokio::sync::Mutex<()>,
    worker: parking_lot::Mutex<Option<Worker>>,
}

impl Default for SavingController {
    fn default() -> Self {
        Self::new()
    }
}

impl SavingController {
    /// Controller in Idle writing through a [`FileBackend`] for the configured
    /// format.
    pub fn new() -> Self {
        let inner = Inner {
            state: SavingState::Idle,
            config: None,
            saved_count: 0,
            error_count: 0,
            failures: VecDeque::new(),
            last_error: None,
        };
        let (status_tx, _) = watch::channel(inner.snapshot());
        Self {
            shared: Arc::new(Shared {
                inner: parking_lot::Mutex::new(inner),
                status_tx,
            }),
            backend: None,
            command_lock: tokio::sync::Mutex::new(()),
            worker: parking_lot::Mutex::new(None),
        }
    }

    /// Controller writing through `backend` regardless of the format.
    pub fn with_backend(backend: Arc<dyn SavingBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::new()
        }
    }

    /// Current state.
    pub fn state(&self) -> SavingState {
        self.shared.state()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> SavingStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver of status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SavingStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Active configuration.
    pub fn config(&self) -> Option<SavingConfig> {
        self.shared.inner.lock().config.clone()
    }

    /// Apply a configuration. Legal in Idle or Armed.
    ///
    /// # Errors
    /// - `InvalidConfig` for an unsupported format, mode or policy combination
    /// - `InvalidPath` if the directory is missing, not a directory or not
    ///   writable (skipped in `Manual` mode)
    pub async fn configure(&self, config: SavingConfig) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.state();
        if !matches!(state, SavingState::Idle | SavingState::Armed) {
            return Err(DaqError::illegal_transition("configure saving", state));
        }
        config.validate()?;
        if config.mode != SavingMode::Manual {
            check_directory_writable(&config.directory).await?;
        }

        debug!(
            directory = %config.directory.display(),
            format = %config.format,
            mode = ?config.mode,
            policy = ?config.overwrite_policy,
            "Saving configured"
        );
        self.shared.update(|inner| inner.config = Some(config));
        Ok(())
    }

    /// Idle → Armed. Clears the counters of the previous session.
    pub async fn arm(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        self.shared.update(|inner| {
            if inner.state != SavingState::Idle {
                return Err(DaqError::illegal_transition("arm saving", inner.state));
            }
            if inner.config.is_none() {
                return Err(DaqError::InvalidConfig("saving is not configured".into()));
            }
            inner.saved_count = 0;
            inner.error_count = 0;
            inner.failures.clear();
            inner.last_error = None;
            inner.state = SavingState::Armed;
            Ok(())
        })
    }

    /// Armed → Idle without starting. No-op in Idle.
    pub async fn disarm(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        self.shared.update(|inner| match inner.state {
            SavingState::Armed => {
                inner.state = SavingState::Idle;
                Ok(())
            }
            SavingState::Idle => Ok(()),
            state => Err(DaqError::illegal_transition("disarm saving", state)),
        })
    }

    /// Armed → Saving; spawns the worker reading from `buffer`.
    pub async fn start(&self, buffer: Arc<FrameBuffer>) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let config = self.shared.update(|inner| {
            if inner.state != SavingState::Armed {
                return Err(DaqError::illegal_transition("start saving", inner.state));
            }
            let config = inner
                .config
                .clone()
                .ok_or_else(|| DaqError::InvalidConfig("saving is not configured".into()))?;
            inner.state = SavingState::Saving;
            Ok(config)
        })?;

        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| Arc::new(FileBackend::new(config.format)));
        info!(
            directory = %config.directory.display(),
            mode = ?config.mode,
            "Saving started"
        );

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            Arc::clone(&buffer),
            FileWriter::new(config, backend),
            cancel_rx,
        ));
        *self.worker.lock() = Some(Worker {
            cancel_tx: Some(cancel_tx),
            task,
            buffer,
        });
        Ok(())
    }

    /// Persist every frame still in the buffer, then stop.
    ///
    /// Marks the buffer's writes finished. When `timeout` expires the worker
    /// is cancelled and each frame left in the buffer is recorded as a
    /// `SavingTimeout` failure. Idempotent: no-op without a worker.
    pub async fn drain_and_stop(&self, timeout: Duration) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let Some(mut worker) = self.worker.lock().take() else {
            return Ok(());
        };
        self.shared.update(|inner| {
            if inner.state == SavingState::Saving {
                inner.state = SavingState::Draining;
            }
        });
        debug!(?timeout, "Draining frame buffer");
        worker.buffer.finish_writes();

        let timed_out = match tokio::time::timeout(timeout, &mut worker.task).await {
            Ok(Ok(())) => false,
            Ok(Err(join_error)) => {
                let message = format!("saving worker failed: {join_error}");
                error!(%message, "Saving worker failed");
                self.shared.update(|inner| {
                    inner.state = SavingState::Fault;
                    inner.last_error = Some((ErrorKind::Io, message));
                });
                false
            }
            Err(_) => {
                warn!(?timeout, "Drain timed out, cancelling saving worker");
                if let Some(tx) = worker.cancel_tx.take() {
                    let _ = tx.send(());
                }
                if tokio::time::timeout(CANCEL_GRACE, &mut worker.task)
                    .await
                    .is_err()
                {
                    worker.task.abort();
                }
                true
            }
        };

        let abandoned = worker.buffer.drain_unread();
        let (kind, reason) = if timed_out {
            (ErrorKind::SavingTimeout, "not saved before the drain timeout")
        } else {
            (ErrorKind::Cancelled, "abandoned after a saving fault")
        };
        let status = self.shared.update(|inner| {
            for sequence in &abandoned {
                inner.record_failure(*sequence, kind, format!("frame {sequence} {reason}"));
            }
            if inner.state != SavingState::Fault {
                inner.state = SavingState::Idle;
            }
            inner.snapshot()
        });
        info!(
            state = %status.state,
            saved = status.saved_count,
            errors = status.error_count,
            abandoned = abandoned.len(),
            "Saving finished"
        );

        if timed_out {
            Err(DaqError::SavingTimeout {
                remaining: abandoned.len(),
            })
        } else {
            Ok(())
        }
    }

    /// Leave Fault. Legal in Fault or Idle; a leftover worker is cancelled.
    pub async fn reset(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.state();
        if !matches!(state, SavingState::Fault | SavingState::Idle) {
            return Err(DaqError::illegal_transition("reset saving", state));
        }
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            if let Some(tx) = worker.cancel_tx.take() {
                let _ = tx.send(());
            }
            if tokio::time::timeout(CANCEL_GRACE, &mut worker.task)
                .await
                .is_err()
            {
                worker.task.abort();
            }
        }
        self.shared.update(|inner| inner.state = SavingState::Idle);
        info!(from = %state, "Saving reset");
        Ok(())
    }
}

/// Check that `directory` exists, is a directory and accepts new files.
async fn check_directory_writable(directory: &Path) -> AppResult<()> {
    let invalid = |reason: String| DaqError::InvalidPath {
        path: directory.to_path_buf(),
        reason,
    };
    let metadata = tokio::fs::metadata(directory)
        .await
        .map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".into()));
    }

    let marker = directory.join(format!(".ultra_daq_write_check_{}", std::process::id()));
    tokio::fs::File::create(&marker)
        .await
        .map_err(|e| invalid(format!("not writable: {e}")))?;
    if let Err(e) = tokio::fs::remove_file(&marker).await {
        warn!(path = %marker.display(), error = %e, "Could not remove write check file");
    }
    Ok(())
}

// =============================================================================
// Worker
// =============================================================================

/// Maps frames to target files and keeps the open batch file.
struct FileWriter {
    config: SavingConfig,
    backend: Arc<dyn SavingBackend>,
    batch: Option<Box<dyn FrameSink>>,
    batch_counter: u64,
    /// Frames of the current batch index that were not written
    batch_failures: usize,
    last_sequence: u64,
}

impl FileWriter {
    fn new(config: SavingConfig, backend: Arc<dyn SavingBackend>) -> Self {
        Self {
            config,
            backend,
            batch: None,
            batch_counter: 0,
            batch_failures: 0,
            last_sequence: 0,
        }
    }

    fn open_mode(&self) -> OpenMode {
        OpenMode::from(self.config.overwrite_policy)
    }

    async fn write(&mut self, record: &FrameRecord) -> AppResult<()> {
        self.last_sequence = record.sequence;
        match self.config.mode {
            SavingMode::Manual => Ok(()),
            SavingMode::OneFilePerFrame => {
                let path = self
                    .config
                    .file_path(self.config.next_number + record.sequence);
                let mut sink = self.backend.open(&path, self.open_mode()).await?;
                let written = sink.write(record).await;
                let closed = sink.close().await;
                written.and(closed)
            }
            SavingMode::MultiFrameBatch => {
                let mut sink = match self.batch.take() {
                    Some(sink) => sink,
                    None => {
                        let path = self
                            .config
                            .file_path(self.config.next_number + self.batch_counter);
                        match self.backend.open(&path, self.open_mode()).await {
                            Ok(sink) => sink,
                            Err(e) => {
                                self.batch_failures += 1;
                                if self.batch_failures >= self.config.frames_per_file {
                                    warn!(path = %path.display(), "Batch file skipped");
                                    self.roll_batch();
                                }
                                return Err(e);
                            }
                        }
                    }
                };
                let written = sink.write(record).await;
                if written.is_err() {
                    self.batch_failures += 1;
                }
                // Failed frames still take their place in the batch
                if sink.frames_written() + self.batch_failures >= self.config.frames_per_file {
                    self.roll_batch();
                    debug!(path = %sink.path().display(), "Batch file complete");
                    let closed = sink.close().await;
                    written.and(closed)
                } else {
                    self.batch = Some(sink);
                    written
                }
            }
        }
    }

    fn roll_batch(&mut self) {
        self.batch_counter += 1;
        self.batch_failures = 0;
    }

    /// Close a partial batch.
    async fn finish(&mut self) -> AppResult<()> {
        match self.batch.take() {
            Some(sink) => {
                debug!(
                    path = %sink.path().display(),
                    frames = sink.frames_written(),
                    "Closing partial batch"
                );
                self.roll_batch();
                sink.close().await
            }
            None => {
                if self.batch_failures > 0 {
                    self.roll_batch();
                }
                Ok(())
            }
        }
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    buffer: Arc<FrameBuffer>,
    mut writer: FileWriter,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let abort_on_error = writer.config.overwrite_policy == OverwritePolicy::Abort;

    loop {
        let reservation = tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                debug!("Saving worker cancelled");
                break;
            }
            reservation = buffer.reserve_for_read(READ_POLL) => reservation,
        };
        let reservation = match reservation {
            Ok(reservation) => reservation,
            Err(BufferError::Timeout(_) | BufferError::Empty) => continue,
            Err(BufferError::Finished) => break,
            Err(e) => {
                let e = DaqError::from(e);
                error!(error = %e, "Read reservation failed");
                shared.update(|inner| {
                    inner.state = SavingState::Fault;
                    inner.last_error = Some((e.kind(), e.to_string()));
                });
                break;
            }
        };

        let sequence = reservation.sequence();
        match writer.write(reservation.record()).await {
            Ok(()) => {
                if let Err(e) = buffer.commit_read(reservation) {
                    warn!(sequence, error = %e, "Read commit failed");
                }
                shared.update(|inner| inner.saved_count += 1);
            }
            Err(e) => {
                if let Err(release) = buffer.fail_read(reservation) {
                    warn!(sequence, error = %release, "Read release failed");
                }
                let fatal = abort_on_error || e.is_fatal();
                shared.update(|inner| {
                    inner.record_failure(sequence, e.kind(), e.to_string());
                    if fatal {
                        inner.state = SavingState::Fault;
                    }
                });
                if fatal {
                    error!(sequence, error = %e, "Saving faulted");
                    break;
                }
                warn!(sequence, error = %e, "Frame not saved");
            }
        }
    }

    if let Err(e) = writer.finish().await {
        let sequence = writer.last_sequence;
        error!(error = %e, "Closing batch file failed");
        shared.update(|inner| inner.record_failure(sequence, e.kind(), e.to_string()));
    }
    debug!("Saving worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::frame::RawFrame;
    use crate::data::frame_buffer::OverflowPolicy;
    use tracing_test::traced_test;
    use async_trait::async_trait;
    use std::path::PathBuf;

    fn fill(buffer: &FrameBuffer, count: u64) {
        for i in 0..count {
            let reservation = buffer.try_reserve_for_write().unwrap();
            buffer
                .commit_write(reservation, RawFrame::from_u16(4, 1, i, &[1, 2, 3, 4]))
                .unwrap();
        }
    }

    fn config_in(dir: &Path) -> SavingConfig {
        SavingConfig {
            directory: dir.to_path_buf(),
            ..Default::default()
        }
    }

    async fn started(config: SavingConfig, buffer: &Arc<FrameBuffer>) -> SavingController {
        let saving = SavingController::new();
        saving.configure(config).await.unwrap();
        saving.arm().await.unwrap();
        saving.start(Arc::clone(buffer)).await.unwrap();
        saving
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_one_file_per_frame() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(8, OverflowPolicy::Block));
        fill(&buffer, 3);
        let saving = started(config_in(dir.path()), &buffer).await;

        saving.drain_and_stop(Duration::from_secs(5)).await.unwrap();
        let status = saving.status();
        assert_eq!(status.state, SavingState::Idle);
        assert_eq!(status.saved_count, 3);
        assert_eq!(status.error_count, 0);
        assert_eq!(
            file_names(dir.path()),
            ["ultra_0000.edf", "ultra_0001.edf", "ultra_0002.edf"]
        );
    }

    #[tokio::test]
    async fn test_batches_close_on_drain() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(8, OverflowPolicy::Block));
        fill(&buffer, 5);
        let config = SavingConfig {
            mode: SavingMode::MultiFrameBatch,
            frames_per_file: 2,
            format: SavingFormat::Raw,
            suffix: ".raw".into(),
            next_number: 10,
            ..config_in(dir.path())
        };
        let saving = started(config, &buffer).await;
        saving.drain_and_stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(saving.status().saved_count, 5);
        assert_eq!(
            file_names(dir.path()),
            ["ultra_0010.raw", "ultra_0011.raw", "ultra_0012.raw"]
        );
        // Partial batch holds the last frame
        let last = std::fs::read(dir.path().join("ultra_0012.raw")).unwrap();
        assert_eq!(last.len(), 8);
    }

    #[tokio::test]
    async fn test_abort_on_existing_file_faults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ultra_0001.edf"), b"").unwrap();
        let buffer = Arc::new(FrameBuffer::new(8, OverflowPolicy::Block));
        fill(&buffer, 3);
        let saving = started(config_in(dir.path()), &buffer).await;

        let mut rx = saving.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.state == SavingState::Fault),
        )
        .await
        .unwrap()
        .unwrap();
        saving.drain_and_stop(Duration::from_secs(1)).await.unwrap();

        let status = saving.status();
        assert_eq!(status.state, SavingState::Fault);
        assert_eq!(status.saved_count, 1);
        assert_eq!(status.failures[0].sequence, 1);
        assert_eq!(status.failures[0].kind, ErrorKind::FileExists);
        // Frame 2 was abandoned
        assert_eq!(status.failures[1].kind, ErrorKind::Cancelled);
        assert_eq!(
            std::fs::metadata(dir.path().join("ultra_0001.edf")).unwrap().len(),
            0
        );

        assert!(saving.arm().await.is_err());
        saving.reset().await.unwrap();
        assert_eq!(saving.state(), SavingState::Idle);
    }

    #[tokio::test]
    async fn test_overwrite_policy_continues_after_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should go cannot be opened for writing
        std::fs::create_dir(dir.path().join("ultra_0001.edf")).unwrap();
        let buffer = Arc::new(FrameBuffer::new(8, OverflowPolicy::Block));
        fill(&buffer, 3);
        let config = SavingConfig {
            overwrite_policy: OverwritePolicy::Overwrite,
            ..config_in(dir.path())
        };
        let saving = started(config, &buffer).await;
        saving.drain_and_stop(Duration::from_secs(5)).await.unwrap();

        let status = saving.status();
        assert_eq!(status.state, SavingState::Idle);
        assert_eq!(status.saved_count, 2);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.failures[0].sequence, 1);
        assert_eq!(status.failures[0].kind, ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_manual_mode_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(4, OverflowPolicy::Block));
        fill(&buffer, 4);
        let config = SavingConfig {
            mode: SavingMode::Manual,
            directory: PathBuf::from("/nonexistent/ultra"),
            ..Default::default()
        };
        let saving = started(config, &buffer).await;
        saving.drain_and_stop(Duration::from_secs(5)).await.unwrap();

        assert_eq!(saving.status().saved_count, 4);
        assert_eq!(buffer.stats().saved, 4);
        assert!(file_names(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_configure_rejects_missing_directory() {
        let saving = SavingController::new();
        let err = saving
            .configure(SavingConfig {
                directory: PathBuf::from("/nonexistent/ultra"),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);

        let file = tempfile::NamedTempFile::new().unwrap();
        let err = saving
            .configure(config_in(file.path()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert!(saving.config().is_none());
    }

    #[tokio::test]
    async fn test_arm_requires_configuration() {
        let saving = SavingController::new();
        let err = saving.arm().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);

        let dir = tempfile::tempdir().unwrap();
        saving.configure(config_in(dir.path())).await.unwrap();
        saving.arm().await.unwrap();
        assert_eq!(saving.state(), SavingState::Armed);
        saving.disarm().await.unwrap();
        assert_eq!(saving.state(), SavingState::Idle);
        saving.disarm().await.unwrap();
    }

    struct StallingBackend;

    struct StallingSink {
        path: PathBuf,
    }

    #[async_trait]
    impl FrameSink for StallingSink {
        async fn write(&mut self, _record: &FrameRecord) -> AppResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn close(self: Box<Self>) -> AppResult<()> {
            Ok(())
        }

        fn frames_written(&self) -> usize {
            0
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    #[async_trait]
    impl SavingBackend for StallingBackend {
        async fn open(&self, path: &Path, _mode: OpenMode) -> AppResult<Box<dyn FrameSink>> {
            Ok(Box::new(StallingSink {
                path: path.to_path_buf(),
            }))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drain_timeout_reports_remaining_frames() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(FrameBuffer::new(8, OverflowPolicy::Block));
        fill(&buffer, 3);
        let saving = SavingController::with_backend(Arc::new(StallingBackend));
        saving.configure(config_in(dir.path())).await.unwrap();
        saving.arm().await.unwrap();
        saving.start(Arc::clone(&buffer)).await.unwrap();

        let err = saving
            .drain_and_stop(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::SavingTimeout { remaining: 3 }));
        let status = saving.status();
        assert_eq!(status.state, SavingState::Idle);
        assert_eq!(status.error_count, 3);
        assert!(status
            .failures
            .iter()
            .all(|f| f.kind == ErrorKind::SavingTimeout));

        assert!(logs_contain("Drain timed out"));

        // Second drain has nothing left to do
        saving.drain_and_stop(Duration::from_millis(100)).await.unwrap();
        assert_eq!(saving.status().error_count, 3);
    }

    #[test]
    fn test_failure_history_is_bounded() {
        let mut inner = Inner {
            state: SavingState::Saving,
            config: None,
            saved_count: 0,
            error_count: 0,
            failures: VecDeque::new(),
            last_error: None,
        };
        for sequence in 0..(MAX_FAILURES as u64 + 10) {
            inner.record_failure(sequence, ErrorKind::Io, "disk full".into());
        }
        assert_eq!(inner.failures.len(), MAX_FAILURES);
        assert_eq!(inner.failures[0].sequence, 10);
        assert_eq!(inner.error_count, MAX_FAILURES as u64 + 10);
    }
}
