//! CLI Entry Point for ultra-daq
//!
//! Provides command-line access to:
//! - One-shot acquisitions saved to disk (`acquire`)
//! - Telemetry, timing and calibration readout of the detector
//!
//! Every subcommand prints its result as JSON on stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! ultra-daq --config config/ultra_daq.toml acquire --frames 5 --directory /data/run42
//! ultra-daq status --mock
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ultra_daq::config::{DaqConfig, DetectorKind, DEFAULT_CONFIG_PATH};
use ultra_daq::hardware::{self, HardwareAdapter};
use ultra_daq::logging;
use ultra_daq::Pipeline;

#[derive(Parser)]
#[command(name = "ultra-daq")]
#[command(about = "Acquisition and saving for Ultra detector heads", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition and print the final status
    Acquire {
        /// Frames to acquire (0 = until Ctrl-C)
        #[arg(long)]
        frames: Option<u64>,

        /// Use the simulated detector
        #[arg(long)]
        mock: bool,

        /// Output directory
        #[arg(long)]
        directory: Option<PathBuf>,

        /// File name prefix
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Print the telemetry snapshot
    Status {
        /// Use the simulated detector
        #[arg(long)]
        mock: bool,
    },

    /// Print the timing parameters
    Timing {
        /// Use the simulated detector
        #[arg(long)]
        mock: bool,
    },

    /// Print the calibration table
    Calibration {
        /// Use the simulated detector
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate()?;
    logging::init(logging::LoggingConfig::from_config(&config)?.with_ansi(false))?;

    match cli.command {
        Commands::Acquire {
            frames,
            mock,
            directory,
            prefix,
        } => {
            if let Some(frames) = frames {
                config.acquisition.requested_frames = frames;
            }
            if let Some(directory) = directory {
                config.saving.directory = directory;
            }
            if let Some(prefix) = prefix {
                config.saving.prefix = prefix;
            }
            acquire(config, mock).await
        }
        Commands::Status { mock } => {
            let detector = open_detector(&mut config, mock).await?;
            print_json(&detector.telemetry().await?)
        }
        Commands::Timing { mock } => {
            let detector = open_detector(&mut config, mock).await?;
            print_json(&detector.timing().await?)
        }
        Commands::Calibration { mock } => {
            let detector = open_detector(&mut config, mock).await?;
            let table = detector.calibration_table().await?;
            print_json(&table.iter().collect::<Vec<_>>())
        }
    }
}

async fn open_detector(config: &mut DaqConfig, mock: bool) -> Result<Arc<dyn HardwareAdapter>> {
    if mock {
        config.detector.kind = DetectorKind::Mock;
    }
    let detector = hardware::connect(&config.detector)
        .await
        .context("connecting to the detector")?;
    Ok(detector)
}

async fn acquire(mut config: DaqConfig, mock: bool) -> Result<()> {
    let detector = open_detector(&mut config, mock).await?;
    let pipeline = Pipeline::from_config(&config, detector)?;

    pipeline.prepare_acq().await?;
    pipeline.start_acq().await?;

    let frames = config.acquisition.requested_frames;
    info!(frames, "Acquisition running");

    // Generous bound: every frame blocked for its reservation plus a full drain
    let bound = Duration::from_millis(
        config
            .acquisition
            .reserve_timeout_ms
            .saturating_mul(frames.max(1))
            .saturating_add(config.acquisition.stop_timeout_ms * 2)
            .saturating_add(config.acquisition.drain_timeout_ms),
    );

    let status = if frames == 0 {
        tokio::signal::ctrl_c().await?;
        info!("Interrupted, stopping");
        pipeline.stop_acq().await?;
        pipeline.get_status()
    } else {
        tokio::select! {
            status = pipeline.wait_for_completion(bound) => status?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping");
                pipeline.stop_acq().await?;
                pipeline.get_status()
            }
        }
    };
    // Collect the drain result
    if let Err(e) = pipeline.stop_acq().await {
        warn!(error = %e, "Acquisition ended with an error");
    }

    print_json(&status)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
