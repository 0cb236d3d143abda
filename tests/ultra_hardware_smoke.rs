#![cfg(feature = "hardware_tests")]

//! Smoke test against a real Ultra head.
//!
//! Network settings come from `config/ultra_daq.toml` and `ULTRA_DAQ_*`
//! overrides. Run with:
//!
//! ```bash
//! ULTRA_DAQ_DETECTOR__KIND=ultra cargo test --features hardware_tests --test ultra_hardware_smoke -- --nocapture
//! ```

use std::time::Duration;

use ultra_daq::config::{DaqConfig, DetectorKind};
use ultra_daq::hardware;
use ultra_daq::{Pipeline, PipelineState};

#[tokio::test]
async fn test_head_reports_telemetry_and_acquires() {
    let mut config = DaqConfig::load().expect("configuration");
    if config.detector.kind != DetectorKind::Ultra {
        eprintln!("detector.kind is not 'ultra', skipping");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    config.saving.directory = dir.path().to_path_buf();
    config.acquisition.requested_frames = 10;

    let detector = hardware::connect(&config.detector).await.expect("connect");
    let info = detector.describe();
    println!("Connected to {} head, {} pixels", info.model, info.width);

    let telemetry = detector.telemetry().await.expect("telemetry");
    println!("{}", serde_json::to_string_pretty(&telemetry).expect("json"));
    telemetry.check_ready().expect("head ready");

    let pipeline = Pipeline::from_config(&config, detector).expect("pipeline");
    pipeline.prepare_acq().await.expect("prepare");
    pipeline.start_acq().await.expect("start");
    let status = pipeline
        .wait_for_completion(Duration::from_secs(30))
        .await
        .expect("completion");

    assert_eq!(status.state, PipelineState::Idle);
    assert_eq!(status.saved_count, 10);
}
