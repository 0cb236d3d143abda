//! Mock Hardware Implementation
//!
//! Simulated detector for tests and dry runs without a head on the network.
//! All timing uses `tokio::time`, never `std::thread::sleep`.
//!
//! Frames are produced by a background task at a fixed period and pushed into
//! a bounded queue that [`next_frame`](HardwareAdapter::next_frame) drains. The
//! builder can inject failure modes:
//!
//! - error events at given positions of the event stream
//! - frame errors the hardware counts but never signals
//! - a producer that stops delivering after N frames
//! - a slow `disarm` that does not confirm quiescence in time
//! - over-temperature or an active fault in telemetry
//!
//! # Example
//!
//! ```rust,ignore
//! let detector = MockDetector::builder()
//!     .resolution(512, 1)
//!     .frame_period(Duration::from_millis(1))
//!     .error_events([3, 7])
//!     .build();
//! detector.arm(10).await?;
//! while let Some(event) = detector.next_frame().await { /* ... */ }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::data::frame::RawFrame;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    ensure_subsystem, CalibrationTable, ChannelCalibration, DetectorInfo, FrameEvent,
    HardwareAdapter, Subsystem, Telemetry, TimingParams,
};

/// Depth of the simulated hardware frame queue.
const QUEUE_DEPTH: usize = 16;

/// Serializable parameters of the simulated detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockDetectorConfig {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Frame period in milliseconds
    pub frame_period_ms: u64,
    /// Number of calibration channels
    pub channels: usize,
}

impl Default for MockDetectorConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 1,
            frame_period_ms: 10,
            channels: 16,
        }
    }
}

// =============================================================================
// MockDetectorBuilder
// =============================================================================

/// Builder for [`MockDetector`] with failure injection.
pub struct MockDetectorBuilder {
    config: MockDetectorConfig,
    error_events: BTreeSet<u64>,
    silent_frame_errors: u64,
    stall_after: Option<u64>,
    disarm_delay: Option<Duration>,
    over_temperature: bool,
    subsystems: Vec<Subsystem>,
}

impl MockDetectorBuilder {
    /// Builder for a `width × height` detector.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            config: MockDetectorConfig {
                width,
                height,
                ..MockDetectorConfig::default()
            },
            error_events: BTreeSet::new(),
            silent_frame_errors: 0,
            stall_after: None,
            disarm_delay: None,
            over_temperature: false,
            subsystems: Subsystem::ALL.to_vec(),
        }
    }

    /// Builder seeded from configuration.
    pub fn from_config(config: MockDetectorConfig) -> Self {
        let mut builder = Self::new(config.width, config.height);
        builder.config = config;
        builder
    }

    /// Image geometry.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    /// Time between frames.
    pub fn frame_period(mut self, period: Duration) -> Self {
        self.config.frame_period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Number of calibration channels.
    pub fn channels(mut self, channels: usize) -> Self {
        self.config.channels = channels;
        self
    }

    /// Deliver `FrameEvent::Error` at these positions of the event stream.
    pub fn error_events(mut self, positions: impl IntoIterator<Item = u64>) -> Self {
        self.error_events.extend(positions);
        self
    }

    /// Frame errors the hardware counter reports without signalling them.
    pub fn silent_frame_errors(mut self, count: u64) -> Self {
        self.silent_frame_errors = count;
        self
    }

    /// Stop delivering frames after `frames`, without closing the queue.
    pub fn stall_after(mut self, frames: u64) -> Self {
        self.stall_after = Some(frames);
        self
    }

    /// Delay before `disarm` completes.
    pub fn disarm_delay(mut self, delay: Duration) -> Self {
        self.disarm_delay = Some(delay);
        self
    }

    /// Start with the over-temperature flag raised.
    pub fn over_temperature(mut self, over: bool) -> Self {
        self.over_temperature = over;
        self
    }

    /// Restrict the declared subsystem set.
    pub fn supported_subsystems(mut self, subsystems: impl IntoIterator<Item = Subsystem>) -> Self {
        self.subsystems = subsystems.into_iter().collect();
        self
    }

    /// Build the detector.
    pub fn build(self) -> MockDetector {
        let period = Duration::from_millis(self.config.frame_period_ms.max(1));
        let subsystems = self
            .subsystems
            .iter()
            .map(|s| (*s, matches!(s, Subsystem::HeadPower | Subsystem::TecPower)))
            .collect();

        MockDetector {
            state: Mutex::new(MockState {
                timing: TimingParams {
                    exposure: period,
                    ..TimingParams::default()
                },
                calibration: CalibrationTable::new(self.config.channels),
                subsystems,
                over_temperature: self.over_temperature,
                fault: None,
                armed: false,
                stored: None,
            }),
            config: self.config,
            error_events: Arc::new(self.error_events),
            silent_frame_errors: self.silent_frame_errors,
            stall_after: self.stall_after,
            disarm_delay: self.disarm_delay,
            declared_subsystems: self.subsystems,
            frame_rx: tokio::sync::Mutex::new(None),
            generator: Mutex::new(None),
            frames_generated: Arc::new(AtomicU64::new(0)),
            frame_errors: Arc::new(AtomicU64::new(0)),
            arm_count: AtomicU64::new(0),
        }
    }
}

// =============================================================================
// MockDetector
// =============================================================================

struct MockState {
    timing: TimingParams,
    calibration: CalibrationTable,
    subsystems: BTreeMap<Subsystem, bool>,
    over_temperature: bool,
    fault: Option<String>,
    armed: bool,
    stored: Option<StoredSettings>,
}

#[derive(Clone)]
struct StoredSettings {
    timing: TimingParams,
    calibration: CalibrationTable,
    subsystems: BTreeMap<Subsystem, bool>,
}

struct Generator {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Simulated detector implementing [`HardwareAdapter`].
pub struct MockDetector {
    config: MockDetectorConfig,
    error_events: Arc<BTreeSet<u64>>,
    silent_frame_errors: u64,
    stall_after: Option<u64>,
    disarm_delay: Option<Duration>,
    declared_subsystems: Vec<Subsystem>,
    state: Mutex<MockState>,
    frame_rx: tokio::sync::Mutex<Option<mpsc::Receiver<FrameEvent>>>,
    generator: Mutex<Option<Generator>>,
    frames_generated: Arc<AtomicU64>,
    frame_errors: Arc<AtomicU64>,
    arm_count: AtomicU64,
}

impl MockDetector {
    /// Detector with default configuration and the given geometry.
    pub fn new(width: u32, height: u32) -> Self {
        MockDetectorBuilder::new(width, height).build()
    }

    /// Builder with a 512 × 1 geometry.
    pub fn builder() -> MockDetectorBuilder {
        MockDetectorBuilder::new(512, 1)
    }

    /// Detector built from configuration.
    pub fn with_config(config: MockDetectorConfig) -> Self {
        MockDetectorBuilder::from_config(config).build()
    }

    /// Frames generated since construction.
    pub fn frames_generated(&self) -> u64 {
        self.frames_generated.load(Ordering::SeqCst)
    }

    /// Number of `arm` calls.
    pub fn arm_count(&self) -> u64 {
        self.arm_count.load(Ordering::SeqCst)
    }

    /// Whether the detector is armed.
    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Raise or clear the over-temperature flag.
    pub fn set_over_temperature(&self, over: bool) {
        self.state.lock().over_temperature = over;
    }

    /// Raise or clear an active fault.
    pub fn set_fault(&self, fault: Option<String>) {
        self.state.lock().fault = fault;
    }

    fn frame_period(&self, timing: &TimingParams) -> Duration {
        let period = timing.exposure + timing.latency;
        if period.is_zero() {
            Duration::from_millis(self.config.frame_period_ms.max(1))
        } else {
            period
        }
    }

    fn stop_generator(&self) -> Option<Generator> {
        self.generator.lock().take()
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::with_config(MockDetectorConfig::default())
    }
}

struct GeneratorPlan {
    width: u32,
    height: u32,
    period: Duration,
    requested_frames: u64,
    stall_after: Option<u64>,
    error_events: Arc<BTreeSet<u64>>,
    frames_generated: Arc<AtomicU64>,
    frame_errors: Arc<AtomicU64>,
}

/// Ramp pattern offset by the frame number.
fn ramp(width: u32, height: u32, frame_number: u64) -> RawFrame {
    let pixels: Vec<u16> = (0..u64::from(width) * u64::from(height))
        .map(|i| ((i + frame_number) % 65536) as u16)
        .collect();
    RawFrame::from_u16(width, height, frame_number, &pixels)
}

async fn generate(
    plan: GeneratorPlan,
    tx: mpsc::Sender<FrameEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(plan.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    let mut event_index = 0u64;
    let mut frames = 0u64;

    loop {
        if plan.requested_frames > 0 && frames >= plan.requested_frames {
            break;
        }
        if plan.stall_after.is_some_and(|limit| frames >= limit) {
            debug!(frames, "Mock detector stalled");
            let _ = shutdown_rx.await;
            return;
        }

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            _ = ticker.tick() => {}
        }

        let event = if plan.error_events.contains(&event_index) {
            plan.frame_errors.fetch_add(1, Ordering::SeqCst);
            FrameEvent::Error(format!("simulated frame error at event {event_index}"))
        } else {
            frames += 1;
            let number = plan.frames_generated.fetch_add(1, Ordering::SeqCst) + 1;
            FrameEvent::Frame(ramp(plan.width, plan.height, number))
        };
        event_index += 1;

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            sent = tx.send(event) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
    debug!(frames, "Mock detector finished sequence");
}

#[async_trait]
impl HardwareAdapter for MockDetector {
    fn describe(&self) -> DetectorInfo {
        DetectorInfo {
            detector_type: "Mock".to_string(),
            model: "Simulated linear array".to_string(),
            width: self.config.width,
            height: self.config.height,
            bit_depth: 16,
            pixel_size_um: (1.0, 1.0),
        }
    }

    async fn telemetry(&self) -> AppResult<Telemetry> {
        let state = self.state.lock();
        let frame_count = self.frames_generated.load(Ordering::SeqCst);
        let frame_error_count = self.frame_errors.load(Ordering::SeqCst);

        let cold = if state.over_temperature { 45.0 } else { -20.0 };
        let temperatures = BTreeMap::from([
            ("coldtemp".to_string(), cold),
            ("hottemp".to_string(), 24.5),
            ("tectemp".to_string(), cold + 0.5),
        ]);
        let voltages = BTreeMap::from([
            ("psupvadc".to_string(), 5.0),
            ("psunvadc".to_string(), -5.0),
            ("headvcc".to_string(), 3.3),
            ("headvref".to_string(), 2.5),
        ]);
        let registers = BTreeMap::from([
            ("fpgaframe".to_string(), frame_count as u32),
            ("fpgaerror".to_string(), frame_error_count as u32),
        ]);

        Ok(Telemetry {
            temperatures,
            voltages,
            registers,
            subsystems: state.subsystems.clone(),
            over_temperature: state.over_temperature,
            fault: state.fault.clone(),
            frame_count,
            frame_error_count,
        })
    }

    fn channel_count(&self) -> usize {
        self.config.channels
    }

    async fn calibration(&self, channel: usize) -> AppResult<ChannelCalibration> {
        self.state.lock().calibration.get(channel)
    }

    async fn set_calibration(
        &self,
        channel: usize,
        calibration: ChannelCalibration,
    ) -> AppResult<()> {
        self.state.lock().calibration.set(channel, calibration)
    }

    async fn timing(&self) -> AppResult<TimingParams> {
        Ok(self.state.lock().timing.clone())
    }

    async fn set_timing(&self, params: &TimingParams) -> AppResult<()> {
        if params.exposure.is_zero() {
            return Err(DaqError::InvalidParams("exposure must be positive".into()));
        }
        self.state.lock().timing = params.clone();
        Ok(())
    }

    fn subsystems(&self) -> &[Subsystem] {
        &self.declared_subsystems
    }

    async fn subsystem_enabled(&self, subsystem: Subsystem) -> AppResult<bool> {
        ensure_subsystem(self, subsystem)?;
        Ok(self
            .state
            .lock()
            .subsystems
            .get(&subsystem)
            .copied()
            .unwrap_or(false))
    }

    async fn set_subsystem_enabled(&self, subsystem: Subsystem, enabled: bool) -> AppResult<()> {
        ensure_subsystem(self, subsystem)?;
        self.state.lock().subsystems.insert(subsystem, enabled);
        Ok(())
    }

    async fn arm(&self, requested_frames: u64) -> AppResult<()> {
        if let Some(previous) = self.stop_generator() {
            let _ = previous.shutdown_tx.send(());
            let _ = previous.task.await;
        }

        let period = {
            let mut state = self.state.lock();
            state.armed = true;
            self.frame_period(&state.timing)
        };
        self.arm_count.fetch_add(1, Ordering::SeqCst);
        self.frame_errors
            .fetch_add(self.silent_frame_errors, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        *self.frame_rx.lock().await = Some(rx);

        let plan = GeneratorPlan {
            width: self.config.width,
            height: self.config.height,
            period,
            requested_frames,
            stall_after: self.stall_after,
            error_events: Arc::clone(&self.error_events),
            frames_generated: Arc::clone(&self.frames_generated),
            frame_errors: Arc::clone(&self.frame_errors),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(generate(plan, tx, shutdown_rx));
        *self.generator.lock() = Some(Generator { shutdown_tx, task });

        info!(requested_frames, period_ms = period.as_millis() as u64, "Mock detector armed");
        Ok(())
    }

    async fn disarm(&self) -> AppResult<()> {
        if let Some(delay) = self.disarm_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(generator) = self.stop_generator() {
            let _ = generator.shutdown_tx.send(());
            let _ = generator.task.await;
        }
        self.state.lock().armed = false;
        debug!("Mock detector disarmed");
        Ok(())
    }

    async fn next_frame(&self) -> Option<FrameEvent> {
        let mut guard = self.frame_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn frame_error_count(&self) -> AppResult<u64> {
        Ok(self.frame_errors.load(Ordering::SeqCst))
    }

    async fn save_configuration(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.stored = Some(StoredSettings {
            timing: state.timing.clone(),
            calibration: state.calibration.clone(),
            subsystems: state.subsystems.clone(),
        });
        Ok(())
    }

    async fn restore_configuration(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        let stored = state
            .stored
            .clone()
            .ok_or_else(|| DaqError::InvalidParams("no stored configuration".into()))?;
        state.timing = stored.timing;
        state.calibration = stored.calibration;
        state.subsystems = stored.subsystems;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(detector: &MockDetector) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        while let Some(event) = detector.next_frame().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_delivers_requested_frames_then_closes() {
        let detector = MockDetector::builder()
            .resolution(8, 1)
            .frame_period(Duration::from_millis(1))
            .build();

        detector.arm(5).await.unwrap();
        let events = collect(&detector).await;
        assert_eq!(events.len(), 5);

        let numbers: Vec<u64> = events
            .iter()
            .map(|e| match e {
                FrameEvent::Frame(frame) => frame.hw_frame_number,
                FrameEvent::Error(msg) => panic!("unexpected error {msg}"),
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(detector.frames_generated(), 5);
    }

    #[tokio::test]
    async fn test_error_events_do_not_consume_frame_quota() {
        let detector = MockDetector::builder()
            .frame_period(Duration::from_millis(1))
            .error_events([1, 3])
            .build();

        detector.arm(3).await.unwrap();
        let events = collect(&detector).await;
        let errors = events
            .iter()
            .filter(|e| matches!(e, FrameEvent::Error(_)))
            .count();
        assert_eq!(events.len(), 5);
        assert_eq!(errors, 2);
        assert_eq!(detector.frame_error_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disarm_stops_continuous_sequence() {
        let detector = MockDetector::builder()
            .frame_period(Duration::from_millis(1))
            .build();

        detector.arm(0).await.unwrap();
        assert!(detector.is_armed());
        assert!(matches!(
            detector.next_frame().await,
            Some(FrameEvent::Frame(_))
        ));

        detector.disarm().await.unwrap();
        assert!(!detector.is_armed());

        // Queue drains then closes
        let remaining = tokio::time::timeout(Duration::from_secs(1), collect(&detector))
            .await
            .unwrap();
        assert!(remaining.len() <= QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn test_next_frame_without_arm_is_none() {
        let detector = MockDetector::default();
        assert!(detector.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_telemetry_reflects_over_temperature() {
        let detector = MockDetector::builder().over_temperature(true).build();
        let telemetry = detector.telemetry().await.unwrap();
        assert!(telemetry.over_temperature);
        assert!(telemetry.check_ready().is_err());

        detector.set_over_temperature(false);
        detector.set_fault(Some("tec trip".into()));
        let telemetry = detector.telemetry().await.unwrap();
        assert_eq!(telemetry.fault.as_deref(), Some("tec trip"));
    }

    #[tokio::test]
    async fn test_calibration_bounds_checked() {
        let detector = MockDetector::builder().channels(16).build();
        let cal = ChannelCalibration {
            offset: 0.01,
            gain: 1.2,
        };
        detector.set_calibration(3, cal).await.unwrap();
        assert_eq!(detector.calibration(3).await.unwrap(), cal);
        assert!(matches!(
            detector.calibration(16).await,
            Err(DaqError::InvalidChannel { .. })
        ));
        assert_eq!(detector.calibration_table().await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_undeclared_subsystem_rejected() {
        let detector = MockDetector::builder()
            .supported_subsystems([Subsystem::Bias])
            .build();
        detector
            .set_subsystem_enabled(Subsystem::Bias, true)
            .await
            .unwrap();
        assert!(detector.subsystem_enabled(Subsystem::Bias).await.unwrap());
        assert!(matches!(
            detector.set_subsystem_enabled(Subsystem::Sync, true).await,
            Err(DaqError::UnsupportedSubsystem(_))
        ));
    }

    #[tokio::test]
    async fn test_save_and_restore_configuration() {
        let detector = MockDetector::default();
        assert!(detector.restore_configuration().await.is_err());

        detector.save_configuration().await.unwrap();
        let mut timing = detector.timing().await.unwrap();
        timing.exposure = Duration::from_millis(250);
        detector.set_timing(&timing).await.unwrap();

        detector.restore_configuration().await.unwrap();
        assert_ne!(
            detector.timing().await.unwrap().exposure,
            Duration::from_millis(250)
        );
    }
}
