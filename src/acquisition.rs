//! Acquisition controller.
//!
//! Owns the acquisition lifecycle and the producer task that moves frames from
//! the [`HardwareAdapter`] queue into the [`FrameBuffer`].
//!
//! # State Machine
//!
//! ```text
//! Idle ──prepare──> Prepared ──start──> Running ──(count reached | stop)──> Stopping ──> Idle
//!  ▲                   │                   │                                   │
//!  └──────stop─────────┘                   └──────────── fatal error ──────────┴──> Fault
//!                                                                                    │
//! Idle <──────────────────────────────── reset ──────────────────────────────────────┘
//! ```
//!
//! Every wind-down (requested count reached, `stop()`, external fault) goes
//! through the same path in the producer task: disarm (bounded), reconcile the
//! hardware frame-error counter, finish buffer writes, then Idle or Fault.
//!
//! Counters are published through a `tokio::sync::watch` channel; reading them
//! never waits on the producer.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::data::frame::RawFrame;
use crate::data::frame_buffer::{BufferError, FrameBuffer, OverflowPolicy};
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::hardware::capabilities::{FrameEvent, HardwareAdapter};

// =============================================================================
// State and session
// =============================================================================

/// Acquisition lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcqState {
    /// No session
    Idle,
    /// Session configured, hardware not armed
    Prepared,
    /// Producer running
    Running,
    /// Winding down
    Stopping,
    /// Unrecoverable error; only `reset()` leaves this state
    Fault,
}

impl fmt::Display for AcqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcqState::Idle => write!(f, "Idle"),
            AcqState::Prepared => write!(f, "Prepared"),
            AcqState::Running => write!(f, "Running"),
            AcqState::Stopping => write!(f, "Stopping"),
            AcqState::Fault => write!(f, "Fault"),
        }
    }
}

impl AcqState {
    /// Whether configuration may change.
    pub fn is_configurable(&self) -> bool {
        matches!(self, AcqState::Idle | AcqState::Prepared)
    }

    /// Whether a producer may be active.
    pub fn is_active(&self) -> bool {
        matches!(self, AcqState::Running | AcqState::Stopping)
    }
}

/// Counters of one acquisition session.
///
/// `error_count` is the total; `overflow_count` and `hardware_error_count`
/// break it down by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionSession {
    /// Frames to acquire, 0 = until stopped
    pub requested_frames: u64,
    /// Frames delivered by the hardware
    pub captured_count: u64,
    /// All errors
    pub error_count: u64,
    /// Frames discarded for lack of buffer space
    pub overflow_count: u64,
    /// Frames the hardware reported as bad or lost
    pub hardware_error_count: u64,
}

impl AcquisitionSession {
    /// Fresh session for `requested_frames` frames.
    pub fn new(requested_frames: u64) -> Self {
        Self {
            requested_frames,
            ..Default::default()
        }
    }

    fn is_complete(&self) -> bool {
        self.requested_frames > 0 && self.captured_count >= self.requested_frames
    }
}

/// Status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionStatus {
    /// Lifecycle state
    pub state: AcqState,
    /// Frames to acquire, 0 = continuous
    pub requested_frames: u64,
    /// Frames delivered by the hardware
    pub captured_count: u64,
    /// All errors
    pub error_count: u64,
    /// Overflow errors
    pub overflow_count: u64,
    /// Hardware errors
    pub hardware_error_count: u64,
    /// Kind of the most recent error
    pub last_error_kind: Option<ErrorKind>,
    /// Message of the most recent error
    pub last_error: Option<String>,
}

/// Session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    /// Producer behaviour on a full buffer
    pub overflow_policy: OverflowPolicy,
    /// Bound on a blocking write reservation
    pub reserve_timeout: Duration,
    /// Bound on arming the hardware
    pub start_timeout: Duration,
    /// Bound on disarming the hardware
    pub stop_timeout: Duration,
    /// Number of recent frame events the error rate is measured over
    pub error_window: usize,
    /// Errors tolerated inside the window
    pub max_errors_in_window: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            overflow_policy: OverflowPolicy::Block,
            reserve_timeout: Duration::from_millis(1000),
            start_timeout: Duration::from_millis(2000),
            stop_timeout: Duration::from_millis(2000),
            error_window: 100,
            max_errors_in_window: 10,
        }
    }
}

impl AcquisitionConfig {
    /// Reject zero timeouts and an error window smaller than its threshold.
    pub fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("reserve_timeout", self.reserve_timeout),
            ("start_timeout", self.start_timeout),
            ("stop_timeout", self.stop_timeout),
        ] {
            if value.is_zero() {
                return Err(DaqError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.error_window == 0 {
            return Err(DaqError::InvalidConfig("error_window must be > 0".into()));
        }
        if self.error_window < self.max_errors_in_window {
            return Err(DaqError::InvalidConfig(format!(
                "error_window ({}) must be >= max_errors_in_window ({})",
                self.error_window, self.max_errors_in_window
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Inner {
    state: AcqState,
    session: AcquisitionSession,
    /// Frame count set while Idle, taken by the next prepare
    pending_frames: Option<u64>,
    config: AcquisitionConfig,
    last_error: Option<(ErrorKind, String)>,
    /// true = error, most recent at the back
    window: VecDeque<bool>,
    baseline_errors: u64,
    signalled_errors: u64,
}

impl Inner {
    fn snapshot(&self) -> AcquisitionStatus {
        AcquisitionStatus {
            state: self.state,
            requested_frames: self.session.requested_frames,
            captured_count: self.session.captured_count,
            error_count: self.session.error_count,
            overflow_count: self.session.overflow_count,
            hardware_error_count: self.session.hardware_error_count,
            last_error_kind: self.last_error.as_ref().map(|(kind, _)| *kind),
            last_error: self.last_error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }

    /// Push one frame event into the error window; true once the rate is exceeded.
    fn record_event(&mut self, is_error: bool) -> bool {
        self.window.push_back(is_error);
        while self.window.len() > self.config.error_window {
            self.window.pop_front();
        }
        self.window.iter().filter(|e| **e).count() > self.config.max_errors_in_window
    }

    fn count_overflow(&mut self, message: String) {
        self.session.overflow_count += 1;
        self.session.error_count += 1;
        self.last_error = Some((ErrorKind::Overflow, message));
    }

    fn count_hardware_errors(&mut self, count: u64, message: String) {
        self.session.hardware_error_count += count;
        self.session.error_count += count;
        self.last_error = Some((ErrorKind::HardwareError, message));
    }

    fn enter_fault(&mut self, error: &DaqError) {
        self.state = AcqState::Fault;
        self.last_error = Some((error.kind(), error.to_string()));
    }
}

struct Shared {
    hardware: Arc<dyn HardwareAdapter>,
    buffer: Arc<FrameBuffer>,
    inner: parking_lot::Mutex<Inner>,
    status_tx: watch::Sender<AcquisitionStatus>,
}

impl Shared {
    /// Mutate the inner state and publish a snapshot.
    fn update<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = f(&mut inner);
        self.status_tx.send_replace(inner.snapshot());
        result
    }

    fn state(&self) -> AcqState {
        self.inner.lock().state
    }
}

struct Producer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<AppResult<()>>,
}

// =============================================================================
// AcquisitionController
// =============================================================================

/// Drives one detector into one frame buffer.
///
/// Lifecycle calls are serialized by an async command lock; status reads
/// never take it.
pub struct AcquisitionController {
    shared: Arc<Shared>,
    command_lock: tokio::sync::Mutex<()>,
    producer: parking_lot::Mutex<Option<Producer>>,
}

impl AcquisitionController {
    /// Controller in Idle.
    pub fn new(hardware: Arc<dyn HardwareAdapter>, buffer: Arc<FrameBuffer>) -> Self {
        let inner = Inner {
            state: AcqState::Idle,
            session: AcquisitionSession::default(),
            pending_frames: None,
            config: AcquisitionConfig::default(),
            last_error: None,
            window: VecDeque::new(),
            baseline_errors: 0,
            signalled_errors: 0,
        };
        let (status_tx, _) = watch::channel(inner.snapshot());
        Self {
            shared: Arc::new(Shared {
                hardware,
                buffer,
                inner: parking_lot::Mutex::new(inner),
                status_tx,
            }),
            command_lock: tokio::sync::Mutex::new(()),
            producer: parking_lot::Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> AcqState {
        self.shared.state()
    }

    /// Latest status snapshot.
    pub fn status(&self) -> AcquisitionStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver of status snapshots, updated on every change.
    pub fn subscribe(&self) -> watch::Receiver<AcquisitionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// The frame buffer this controller writes into.
    pub fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.shared.buffer
    }

    /// Configure a new session. Legal from Idle only.
    ///
    /// A frame count given to [`Self::set_requested_frames`] while Idle takes
    /// precedence over `session.requested_frames`.
    ///
    /// Reads live telemetry: an active fault or over-temperature rejects the
    /// session with `HardwareFault` and leaves the state unchanged.
    pub async fn prepare(
        &self,
        session: AcquisitionSession,
        config: AcquisitionConfig,
    ) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.state();
        if state != AcqState::Idle {
            return Err(DaqError::illegal_transition("prepare", state));
        }
        config.validate()?;

        let telemetry = tokio::time::timeout(config.start_timeout, self.shared.hardware.telemetry())
            .await
            .map_err(|_| DaqError::timeout("telemetry read", config.start_timeout))??;
        if let Err(e) = telemetry.check_ready() {
            warn!(error = %e, "Detector not ready, session rejected");
            self.shared
                .update(|inner| inner.last_error = Some((e.kind(), e.to_string())));
            return Err(e);
        }

        // A producer that completed on its own leaves its handle behind
        self.producer.lock().take();

        self.shared.buffer.reset();
        self.shared.buffer.set_overflow_policy(config.overflow_policy);
        let requested_frames = self.shared.update(|inner| {
            let requested_frames = inner
                .pending_frames
                .take()
                .unwrap_or(session.requested_frames);
            inner.session = AcquisitionSession::new(requested_frames);
            inner.config = config;
            inner.last_error = None;
            inner.window.clear();
            inner.baseline_errors = 0;
            inner.signalled_errors = 0;
            inner.state = AcqState::Prepared;
            requested_frames
        });
        info!(requested_frames, "Acquisition prepared");
        Ok(())
    }

    /// Change the requested frame count. Legal in Idle or Prepared.
    ///
    /// In Idle the count is kept for the next [`Self::prepare`].
    pub fn set_requested_frames(&self, requested_frames: u64) -> AppResult<()> {
        self.shared.update(|inner| {
            if !inner.state.is_configurable() {
                return Err(DaqError::illegal_transition(
                    "change the frame count",
                    inner.state,
                ));
            }
            if inner.state == AcqState::Idle {
                inner.pending_frames = Some(requested_frames);
            }
            inner.session.requested_frames = requested_frames;
            Ok(())
        })
    }

    /// Arm the hardware and spawn the producer. Legal from Prepared only.
    pub async fn start(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let (state, requested_frames, config) = {
            let inner = self.shared.inner.lock();
            (
                inner.state,
                inner.session.requested_frames,
                inner.config.clone(),
            )
        };
        if state != AcqState::Prepared {
            return Err(DaqError::illegal_transition("start", state));
        }

        let hardware = Arc::clone(&self.shared.hardware);
        let armed = tokio::time::timeout(config.start_timeout, async move {
            let baseline = hardware.frame_error_count().await?;
            hardware.arm(requested_frames).await?;
            Ok::<u64, DaqError>(baseline)
        })
        .await;

        let baseline = match armed {
            Ok(Ok(baseline)) => baseline,
            Ok(Err(e)) => {
                error!(error = %e, "Arming failed");
                self.shared.update(|inner| inner.enter_fault(&e));
                return Err(e);
            }
            Err(_) => {
                let e = DaqError::timeout("arm", config.start_timeout);
                error!(error = %e, "Arming timed out");
                self.shared.update(|inner| inner.enter_fault(&e));
                let _ = tokio::time::timeout(config.stop_timeout, self.shared.hardware.disarm())
                    .await;
                return Err(e);
            }
        };

        self.shared.update(|inner| {
            inner.baseline_errors = baseline;
            inner.state = AcqState::Running;
        });

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_producer(Arc::clone(&self.shared), shutdown_rx));
        *self.producer.lock() = Some(Producer {
            shutdown_tx: Some(shutdown_tx),
            task,
        });
        info!(requested_frames, "Acquisition started");
        Ok(())
    }

    /// Stop the acquisition.
    ///
    /// - Running: winds down and waits (bounded) for the producer
    /// - Prepared: back to Idle
    /// - Idle, Fault: no-op
    ///
    /// Idempotent. When the producer does not finish within twice the stop
    /// timeout it is aborted and the controller goes to Fault.
    pub async fn stop(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let stop_timeout = self.shared.inner.lock().config.stop_timeout;

        let state = self.state();
        match state {
            AcqState::Prepared => {
                self.shared.update(|inner| inner.state = AcqState::Idle);
                debug!("Prepared session discarded");
                return Ok(());
            }
            AcqState::Running => {
                self.shared.update(|inner| inner.state = AcqState::Stopping);
                info!("Stopping acquisition");
            }
            AcqState::Idle | AcqState::Stopping | AcqState::Fault => {}
        }

        let Some(mut producer) = self.producer.lock().take() else {
            return Ok(());
        };
        if let Some(tx) = producer.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.shared.buffer.cancel_writers();

        let bound = stop_timeout * 2;
        match tokio::time::timeout(bound, &mut producer.task).await {
            Ok(Ok(result)) if state == AcqState::Running || state == AcqState::Stopping => result,
            Ok(Ok(_)) => Ok(()),
            Ok(Err(join_error)) => {
                let e = DaqError::HardwareError(format!("producer task failed: {join_error}"));
                self.shared.update(|inner| inner.enter_fault(&e));
                Err(e)
            }
            Err(_) => {
                producer.task.abort();
                let e = DaqError::timeout("acquisition stop", bound);
                error!(error = %e, "Producer did not wind down, aborted");
                self.shared.update(|inner| inner.enter_fault(&e));
                self.shared.buffer.finish_writes();
                Err(e)
            }
        }
    }

    /// Fatal error raised outside the controller (saving).
    ///
    /// The producer is signalled and winds down on its own; counters are kept.
    pub fn fault(&self, error: DaqError) {
        self.fault_with(error.kind(), error.to_string());
    }

    /// Same as [`fault`](Self::fault) for an error already reduced to its kind
    /// and message.
    pub fn fault_with(&self, kind: ErrorKind, message: String) {
        let already = self.shared.update(|inner| {
            let already = inner.state == AcqState::Fault;
            if !already {
                inner.state = AcqState::Fault;
                inner.last_error = Some((kind, message.clone()));
            }
            already
        });
        if already {
            return;
        }
        error!(%kind, %message, "Acquisition faulted");
        if let Some(producer) = self.producer.lock().as_mut() {
            if let Some(tx) = producer.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
        self.shared.buffer.cancel_writers();
    }

    /// Leave Fault. Legal in Fault or Idle.
    pub async fn reset(&self) -> AppResult<()> {
        let _guard = self.command_lock.lock().await;
        let state = self.state();
        if !matches!(state, AcqState::Fault | AcqState::Idle) {
            return Err(DaqError::illegal_transition("reset", state));
        }
        let producer = self.producer.lock().take();
        if let Some(mut producer) = producer {
            if let Some(tx) = producer.shutdown_tx.take() {
                let _ = tx.send(());
            }
            let stop_timeout = self.shared.inner.lock().config.stop_timeout;
            if tokio::time::timeout(stop_timeout, &mut producer.task)
                .await
                .is_err()
            {
                producer.task.abort();
            }
        }
        self.shared.update(|inner| inner.state = AcqState::Idle);
        info!(from = %state, "Acquisition reset");
        Ok(())
    }
}

// =============================================================================
// Producer
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Requested count reached or the hardware queue closed
    Complete,
    /// Stop or external fault
    Signalled,
    /// Error rate exceeded
    ErrorRate,
}

async fn run_producer(shared: Arc<Shared>, mut shutdown_rx: oneshot::Receiver<()>) -> AppResult<()> {
    let exit = loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown_rx => break Exit::Signalled,
            event = shared.hardware.next_frame() => event,
        };

        match event {
            None => break Exit::Complete,
            Some(FrameEvent::Error(message)) => {
                warn!(%message, "Hardware frame error");
                let exceeded = shared.update(|inner| {
                    inner.signalled_errors += 1;
                    inner.count_hardware_errors(1, message);
                    inner.record_event(true)
                });
                if exceeded {
                    break Exit::ErrorRate;
                }
            }
            Some(FrameEvent::Frame(frame)) => {
                shared.update(|inner| {
                    inner.session.captured_count += 1;
                    inner.record_event(false);
                });
                if !store(&shared, frame).await {
                    break Exit::Signalled;
                }
                if shared.inner.lock().session.is_complete() {
                    break Exit::Complete;
                }
            }
        }
    };
    debug!(?exit, "Producer loop finished");
    wind_down(&shared, exit).await
}

/// Write one frame into the buffer per the overflow policy. False once writers
/// are cancelled.
async fn store(shared: &Shared, frame: RawFrame) -> bool {
    let (policy, reserve_timeout) = {
        let inner = shared.inner.lock();
        (inner.config.overflow_policy, inner.config.reserve_timeout)
    };
    let reservation = match policy {
        OverflowPolicy::Block => shared.buffer.reserve_for_write(reserve_timeout).await,
        OverflowPolicy::DropOldest | OverflowPolicy::DropNewest => {
            shared.buffer.try_reserve_for_write()
        }
    };

    match reservation {
        Ok(reservation) => {
            if let Some(dropped) = reservation.reclaimed() {
                warn!(sequence = dropped, "Oldest unread frame dropped");
                shared.update(|inner| {
                    inner.count_overflow(format!("frame {dropped} dropped to make room"))
                });
            }
            let sequence = reservation.sequence();
            if let Err(e) = shared.buffer.commit_write(reservation, frame) {
                warn!(sequence, error = %e, "Commit failed");
            }
            true
        }
        Err(BufferError::Cancelled | BufferError::Finished) => false,
        Err(e @ (BufferError::Full | BufferError::Timeout(_) | BufferError::SlotBusy(_))) => {
            warn!(error = %e, "Incoming frame discarded");
            shared.update(|inner| inner.count_overflow(format!("incoming frame discarded: {e}")));
            true
        }
        Err(BufferError::Empty) => true,
    }
}

/// Disarm, reconcile the frame-error counter and settle in Idle or Fault.
async fn wind_down(shared: &Shared, exit: Exit) -> AppResult<()> {
    let stop_timeout = shared.update(|inner| {
        if exit == Exit::ErrorRate {
            let e = DaqError::HardwareError(format!(
                "more than {} errors in the last {} frame events",
                inner.config.max_errors_in_window, inner.config.error_window
            ));
            inner.enter_fault(&e);
        } else if inner.state != AcqState::Fault {
            inner.state = AcqState::Stopping;
        }
        inner.config.stop_timeout
    });
    if exit == Exit::ErrorRate {
        error!("Frame error rate exceeded, acquisition faulted");
    }

    let mut result = Ok(());
    match tokio::time::timeout(stop_timeout, shared.hardware.disarm()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "Disarm failed");
            shared.update(|inner| inner.enter_fault(&e));
            result = Err(e);
        }
        Err(_) => {
            let e = DaqError::timeout("disarm", stop_timeout);
            error!(error = %e, "Hardware did not go quiet");
            shared.update(|inner| inner.enter_fault(&e));
            result = Err(e);
        }
    }

    if shared.state() != AcqState::Fault {
        reconcile_frame_errors(shared, stop_timeout / 2).await;
    }
    shared.buffer.finish_writes();

    let status = shared.update(|inner| {
        if inner.state != AcqState::Fault {
            inner.state = AcqState::Idle;
        }
        inner.snapshot()
    });
    info!(
        state = %status.state,
        captured = status.captured_count,
        errors = status.error_count,
        overflows = status.overflow_count,
        hardware_errors = status.hardware_error_count,
        "Acquisition finished"
    );
    if exit == Exit::ErrorRate && result.is_ok() {
        result = Err(DaqError::HardwareError("frame error rate exceeded".into()));
    }
    result
}

/// Count errors the hardware recorded but never signalled as events.
async fn reconcile_frame_errors(shared: &Shared, bound: Duration) {
    match tokio::time::timeout(bound, shared.hardware.frame_error_count()).await {
        Ok(Ok(count)) => shared.update(|inner| {
            let delta = count.saturating_sub(inner.baseline_errors);
            let unsignalled = delta.saturating_sub(inner.signalled_errors);
            if unsignalled > 0 {
                warn!(unsignalled, "Hardware counted frame errors it never signalled");
                inner.count_hardware_errors(
                    unsignalled,
                    format!("{unsignalled} frame error(s) counted by the hardware"),
                );
            }
        }),
        Ok(Err(e)) => warn!(error = %e, "Frame error counter unavailable"),
        Err(_) => warn!("Frame error counter read timed out"),
    }
}
