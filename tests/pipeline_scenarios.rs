//! End-to-end pipeline scenarios against the simulated detector.
//!
//! Every test drives the public `Pipeline` API only: prepare, start, wait,
//! stop, reset, and checks the counters and the files left on disk.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ultra_daq::acquisition::AcquisitionConfig;
use ultra_daq::config::{DaqConfig, DetectorKind};
use ultra_daq::data::frame::FrameRecord;
use ultra_daq::data::frame_buffer::OverflowPolicy;
use ultra_daq::hardware::{self, HardwareAdapter, MockDetector, TimingParams};
use ultra_daq::saving::{
    FrameSink, OpenMode, OverwritePolicy, SavingBackend, SavingConfig, SavingController,
    SavingFormat, SavingMode, SavingState,
};
use ultra_daq::{AppResult, ErrorKind, Pipeline, PipelineConfig, PipelineState};

const WAIT: Duration = Duration::from_secs(10);

fn fast_detector() -> Arc<MockDetector> {
    Arc::new(
        MockDetector::builder()
            .resolution(16, 1)
            .frame_period(Duration::from_millis(1))
            .build(),
    )
}

fn config(dir: &Path, capacity: usize, frames: u64) -> PipelineConfig {
    PipelineConfig {
        buffer_capacity: capacity,
        requested_frames: frames,
        saving: SavingConfig {
            directory: dir.to_path_buf(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pipeline_for(detector: &Arc<MockDetector>, config: PipelineConfig) -> Pipeline {
    let hardware: Arc<dyn HardwareAdapter> = detector.clone();
    Pipeline::new(hardware, config).expect("pipeline")
}

fn saved_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("read dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Accepts every frame but takes `delay` per write and touches no file.
struct SlowBackend {
    delay: Duration,
}

struct SlowSink {
    path: PathBuf,
    delay: Duration,
    written: usize,
}

#[async_trait]
impl FrameSink for SlowSink {
    async fn write(&mut self, _record: &FrameRecord) -> AppResult<()> {
        tokio::time::sleep(self.delay).await;
        self.written += 1;
        Ok(())
    }

    async fn close(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }

    fn frames_written(&self) -> usize {
        self.written
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SavingBackend for SlowBackend {
    async fn open(&self, path: &Path, _mode: OpenMode) -> AppResult<Box<dyn FrameSink>> {
        Ok(Box::new(SlowSink {
            path: path.to_path_buf(),
            delay: self.delay,
            written: 0,
        }))
    }
}

#[tokio::test]
async fn test_five_frames_make_five_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 5));

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.captured_count, 5);
    assert_eq!(status.saved_count, 5);
    assert_eq!(status.error_count, 0);
    assert_eq!(status.saving_error_count, 0);
    assert_eq!(
        saved_files(dir.path()),
        vec![
            "ultra_0000.edf",
            "ultra_0001.edf",
            "ultra_0002.edf",
            "ultra_0003.edf",
            "ultra_0004.edf",
        ]
    );
}

#[tokio::test]
async fn test_block_policy_saves_every_frame_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    // Far fewer slots than frames
    let pipeline = pipeline_for(&detector, config(dir.path(), 2, 20));

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.captured_count, 20);
    assert_eq!(status.saved_count, 20);
    assert_eq!(status.overflow_count, 0);

    for sequence in 0..20u64 {
        let path = dir.path().join(format!("ultra_{sequence:04}.edf"));
        let contents = std::fs::read(&path).expect("saved file");
        let header = String::from_utf8_lossy(&contents[..512]);
        assert!(
            header.contains(&format!("acq_frame_nb = {sequence} ;")),
            "{} holds the wrong frame",
            path.display()
        );
    }
}

#[tokio::test]
async fn test_drop_newest_with_slow_saving_counts_overflow() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let mut cfg = config(dir.path(), 2, 20);
    cfg.acquisition = AcquisitionConfig {
        overflow_policy: OverflowPolicy::DropNewest,
        ..Default::default()
    };
    let hardware: Arc<dyn HardwareAdapter> = detector.clone();
    let saving = SavingController::with_backend(Arc::new(SlowBackend {
        delay: Duration::from_millis(25),
    }));
    let pipeline = Pipeline::with_saving(hardware, cfg, saving).expect("pipeline");

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.captured_count, 20);
    assert!(status.overflow_count > 0);
    assert_eq!(status.overflow_count + status.saved_count, 20);
    assert_eq!(status.error_count, status.overflow_count);
}

#[tokio::test]
async fn test_drop_oldest_with_slow_saving_discards_incoming_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let mut cfg = config(dir.path(), 2, 20);
    cfg.acquisition = AcquisitionConfig {
        overflow_policy: OverflowPolicy::DropOldest,
        ..Default::default()
    };
    let hardware: Arc<dyn HardwareAdapter> = detector.clone();
    let saving = SavingController::with_backend(Arc::new(SlowBackend {
        delay: Duration::from_millis(50),
    }));
    let pipeline = Pipeline::with_saving(hardware, cfg, saving).expect("pipeline");

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.captured_count, 20);
    assert_eq!(status.overflow_count + status.saved_count, 20);
    assert_eq!(status.error_count, status.overflow_count);
    // The frame being saved pins the oldest slot, so most frames are lost
    assert!(status.overflow_count > status.saved_count);
}

#[tokio::test]
async fn test_second_stop_changes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 3));

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    pipeline.wait_for_completion(WAIT).await.expect("completion");

    pipeline.stop_acq().await.expect("first stop");
    let first = pipeline.get_status();
    pipeline.stop_acq().await.expect("second stop");
    let second = pipeline.get_status();

    assert_eq!(first, second);
    assert_eq!(second.state, PipelineState::Idle);
    assert_eq!(second.saved_count, 3);
}

#[tokio::test]
async fn test_stop_during_continuous_run_drains_saving() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 0));

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.stop_acq().await.expect("stop");

    let status = pipeline.get_status();
    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.saving_state, SavingState::Idle);
    assert!(status.saved_count > 0);
    assert!(status.saved_count <= status.captured_count);
    assert_eq!(saved_files(dir.path()).len() as u64, status.saved_count);
    assert!(!detector.is_armed());
}

#[tokio::test]
async fn test_prepare_while_running_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 0));

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");

    let err = pipeline.prepare_acq().await.expect_err("prepare while running");
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
    assert_eq!(pipeline.get_status().state, PipelineState::Running);

    pipeline.stop_acq().await.expect("stop");
}

#[tokio::test]
async fn test_existing_file_aborts_and_reset_recovers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let existing = dir.path().join("ultra_0000.edf");
    std::fs::write(&existing, b"").expect("seed file");

    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 1));
    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Fault);
    assert_eq!(status.saving_state, SavingState::Fault);
    assert_eq!(status.saved_count, 0);
    assert_eq!(status.saving_error_count, 1);
    assert_eq!(std::fs::metadata(&existing).expect("metadata").len(), 0);

    let failures = pipeline.saving().status().failures;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, ErrorKind::FileExists);

    // A faulted pipeline refuses to prepare until reset
    assert!(pipeline.prepare_acq().await.is_err());
    pipeline.reset().await.expect("reset");
    assert_eq!(pipeline.get_status().state, PipelineState::Idle);

    pipeline
        .set_overwrite_policy(OverwritePolicy::Overwrite)
        .await
        .expect("policy");
    pipeline.prepare_acq().await.expect("prepare after reset");
    pipeline.start_acq().await.expect("start after reset");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");
    assert_eq!(status.state, PipelineState::Idle);
    assert!(std::fs::metadata(&existing).expect("metadata").len() > 0);
}

#[tokio::test]
async fn test_timing_only_changes_when_idle_or_prepared() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 0));

    let timing = TimingParams {
        exposure: Duration::from_millis(2),
        ..pipeline.timing().await.expect("timing")
    };
    pipeline.set_timing(&timing).await.expect("idle");

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.set_timing(&timing).await.expect("prepared");

    pipeline.start_acq().await.expect("start");
    let err = pipeline.set_timing(&timing).await.expect_err("running");
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);

    pipeline.stop_acq().await.expect("stop");
    assert_eq!(pipeline.timing().await.expect("timing").exposure, timing.exposure);
}

#[tokio::test]
async fn test_error_rate_faults_pipeline() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = Arc::new(
        MockDetector::builder()
            .resolution(16, 1)
            .frame_period(Duration::from_millis(1))
            .error_events([1, 2, 3, 4])
            .build(),
    );
    let mut cfg = config(dir.path(), 8, 0);
    cfg.acquisition = AcquisitionConfig {
        error_window: 10,
        max_errors_in_window: 2,
        ..Default::default()
    };
    let pipeline = pipeline_for(&detector, cfg);

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Fault);
    assert_eq!(status.hardware_error_count, 3);
    assert!(status.last_error.is_some());
    // Frames captured before the fault are still on disk
    assert_eq!(saved_files(dir.path()).len() as u64, status.saved_count);

    pipeline.reset().await.expect("reset");
    assert_eq!(pipeline.get_status().state, PipelineState::Idle);
}

#[tokio::test]
async fn test_over_temperature_blocks_prepare() {
    let dir = tempfile::tempdir().expect("tempdir");
    let detector = fast_detector();
    detector.set_over_temperature(true);
    let pipeline = pipeline_for(&detector, config(dir.path(), 8, 1));

    let err = pipeline.prepare_acq().await.expect_err("over temperature");
    assert_eq!(err.kind(), ErrorKind::HardwareFault);
    assert_eq!(pipeline.get_status().state, PipelineState::Idle);
    assert_eq!(detector.arm_count(), 0);

    detector.set_over_temperature(false);
    pipeline.prepare_acq().await.expect("prepare once cooled");
    pipeline.stop_acq().await.expect("stop");
}

#[tokio::test]
async fn test_pipeline_from_configuration_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("run");
    std::fs::create_dir(&output).expect("output dir");
    let path = dir.path().join("ultra_daq.toml");
    std::fs::write(
        &path,
        format!(
            r#"
            [detector]
            kind = "mock"

            [detector.mock]
            width = 8
            height = 1
            frame_period_ms = 1

            [acquisition]
            buffer_capacity = 4
            requested_frames = 6

            [saving]
            directory = "{}"
            format = "raw"
            suffix = ".raw"
            mode = "multi_frame_batch"
            frames_per_file = 4
            next_number = 1
            "#,
            output.display()
        ),
    )
    .expect("write config");

    let config = DaqConfig::load_from(&path).expect("load");
    assert_eq!(config.detector.kind, DetectorKind::Mock);
    let detector = hardware::connect(&config.detector).await.expect("connect");
    let pipeline = Pipeline::from_config(&config, detector).expect("pipeline");

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.saved_count, 6);
    assert_eq!(saved_files(&output), vec!["ultra_0001.raw", "ultra_0002.raw"]);
    // 8 pixels of 16 bits per frame
    let first = std::fs::metadata(output.join("ultra_0001.raw")).expect("first");
    let second = std::fs::metadata(output.join("ultra_0002.raw")).expect("second");
    assert_eq!(first.len(), 4 * 16);
    assert_eq!(second.len(), 2 * 16);
}

#[tokio::test]
async fn test_blocked_batch_file_does_not_stop_later_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A directory where the first batch file should go
    std::fs::create_dir(dir.path().join("ultra_0000.raw")).expect("blocking dir");

    let detector = fast_detector();
    let mut cfg = config(dir.path(), 8, 6);
    cfg.saving = SavingConfig {
        directory: dir.path().to_path_buf(),
        format: SavingFormat::Raw,
        suffix: ".raw".into(),
        mode: SavingMode::MultiFrameBatch,
        frames_per_file: 2,
        overwrite_policy: OverwritePolicy::Overwrite,
        ..Default::default()
    };
    let pipeline = pipeline_for(&detector, cfg);

    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline.wait_for_completion(WAIT).await.expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.captured_count, 6);
    assert_eq!(status.saved_count, 4);
    assert_eq!(status.saving_error_count, 2);
    assert_eq!(
        saved_files(dir.path()),
        vec!["ultra_0000.raw", "ultra_0001.raw", "ultra_0002.raw"]
    );
    // 16 pixels of 16 bits per frame, two frames per file
    for name in ["ultra_0001.raw", "ultra_0002.raw"] {
        let metadata = std::fs::metadata(dir.path().join(name)).expect("batch file");
        assert_eq!(metadata.len(), 2 * 32);
    }
}
