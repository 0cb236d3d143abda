//! Ultra linear-array detector head.
//!
//! The head is controlled over an ASCII command port (TCP) and streams frames
//! to the host as UDP datagrams, one per frame. [`UltraDetector`] implements
//! [`HardwareAdapter`] on top of [`net::CommandChannel`] and
//! [`net::DataSocket`]; the wire formats live in [`protocol`].
//!
//! # Connection sequence
//!
//! 1. bind the host data port
//! 2. connect the command port
//! 3. empty command handshake
//! 4. read the head type from EEPROM
//!
//! Exposure and trigger mode are host-side settings: the head free-runs on its
//! x-chip timing and the receiver counts frames.

pub mod net;
pub mod protocol;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::frame::RawFrame;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    ensure_subsystem, ChannelCalibration, DetectorInfo, FrameEvent, HardwareAdapter, Subsystem,
    Telemetry, TimingParams, TriggerMode,
};

use self::net::{CommandChannel, DataSocket};
use self::protocol::{mask, timing_keys, HeadType, XchipRegisters, XchipTiming};

/// Depth of the received frame queue.
const QUEUE_DEPTH: usize = 64;

/// Network parameters of an Ultra head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UltraConfig {
    /// Head IP address
    pub head_ip: String,
    /// Head command port
    pub tcp_port: u16,
    /// Host address the head sends frames to
    pub host_ip: String,
    /// Host data port
    pub udp_port: u16,
    /// Pixels per frame
    pub npixels: usize,
    /// Bound on each command round trip
    pub command_timeout_ms: u64,
}

impl Default for UltraConfig {
    fn default() -> Self {
        Self {
            head_ip: "192.168.1.100".to_string(),
            tcp_port: 7,
            host_ip: "192.168.1.103".to_string(),
            udp_port: 5005,
            npixels: 512,
            command_timeout_ms: 1000,
        }
    }
}

impl UltraConfig {
    fn parse_addr(ip: &str, port: u16, what: &str) -> AppResult<SocketAddr> {
        let ip: IpAddr = ip
            .parse()
            .map_err(|_| DaqError::InvalidConfig(format!("invalid {what} address '{ip}'")))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Head command endpoint.
    pub fn command_addr(&self) -> AppResult<SocketAddr> {
        Self::parse_addr(&self.head_ip, self.tcp_port, "head")
    }

    /// Host data endpoint.
    pub fn data_addr(&self) -> AppResult<SocketAddr> {
        Self::parse_addr(&self.host_ip, self.udp_port, "host")
    }
}

/// Register and mask holding each subsystem flag.
fn subsystem_register(subsystem: Subsystem) -> (&'static str, u32) {
    match subsystem {
        Subsystem::HeadPower => ("fpgapwr", mask::HEAD_POWER),
        Subsystem::TecPower => ("fpgapwr", mask::TEC_POWER),
        Subsystem::Bias => ("fpgapwr", mask::BIAS_ENABLE),
        Subsystem::Sync => ("fpgasync", mask::SYNC_ENABLE),
        Subsystem::Calibration => ("fpgaxchip", mask::CAL_ENABLE),
        Subsystem::EightPhaseClock => ("fpgaxchip", mask::EIGHT_PHASE_CLOCK),
    }
}

/// Longest exposure the 32-bit tick counter can express.
pub fn max_exposure() -> Duration {
    Duration::from_nanos(u64::from(u32::MAX) * protocol::TICK_NS)
}

struct Receiver {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct HostTiming {
    exposure: Duration,
    trigger_mode: TriggerMode,
}

/// Ultra head adapter.
pub struct UltraDetector {
    config: UltraConfig,
    head_type: HeadType,
    commands: CommandChannel,
    data: Arc<DataSocket>,
    host_timing: Mutex<HostTiming>,
    frame_rx: tokio::sync::Mutex<Option<mpsc::Receiver<FrameEvent>>>,
    receiver: Mutex<Option<Receiver>>,
}

impl UltraDetector {
    /// Bind the data port, connect the command port and identify the head.
    pub async fn connect(config: UltraConfig) -> AppResult<Self> {
        if config.npixels == 0 {
            return Err(DaqError::InvalidConfig("npixels must be > 0".into()));
        }
        let data = DataSocket::bind(config.data_addr()?, config.npixels).await?;
        let commands = CommandChannel::connect(
            config.command_addr()?,
            Duration::from_millis(config.command_timeout_ms),
        )
        .await?;
        commands.handshake().await?;

        let code = commands.read_hex(protocol::HEAD_TYPE_ADDRESS).await?;
        let head_type = HeadType::from_code(code)?;
        info!(head = head_type.name(), npixels = config.npixels, "Ultra head identified");

        Ok(Self {
            config,
            head_type,
            commands,
            data: Arc::new(data),
            host_timing: Mutex::new(HostTiming {
                exposure: Duration::ZERO,
                trigger_mode: TriggerMode::Internal,
            }),
            frame_rx: tokio::sync::Mutex::new(None),
            receiver: Mutex::new(None),
        })
    }

    /// Sensor technology of the connected head.
    pub fn head_type(&self) -> HeadType {
        self.head_type
    }

    /// Address the data socket is bound to.
    pub fn data_addr(&self) -> AppResult<SocketAddr> {
        self.data.local_addr()
    }

    /// Set one of the adjustable head voltages.
    pub async fn set_head_voltage(&self, name: &str, volts: f64) -> AppResult<()> {
        if !protocol::SETTABLE_VOLTAGES.contains(&name) {
            return Err(DaqError::InvalidParams(format!(
                "'{name}' is not a settable head voltage"
            )));
        }
        self.commands
            .set(name, &protocol::format_volts(volts))
            .await
    }

    /// Read one head voltage.
    pub async fn head_voltage(&self, name: &str) -> AppResult<f64> {
        Ok(self.commands.read_float(name).await?.value)
    }

    async fn read_xchip(&self) -> AppResult<XchipTiming> {
        let regs = XchipRegisters {
            rst: self.commands.read_pair("fpgarst").await?,
            s1: self.commands.read_pair("fpgas1").await?,
            s2: self.commands.read_pair("fpgas2").await?,
            xclk: self.commands.read_pair("fpgaxclk").await?,
            shift: self.commands.read_pair("fpgashift").await?,
        };
        Ok(XchipTiming::decode(self.head_type, &regs))
    }

    fn stop_receiver(&self) -> Option<Receiver> {
        self.receiver.lock().take()
    }

    fn validate_timing(params: &TimingParams) -> AppResult<()> {
        if !params.latency.is_zero() {
            return Err(DaqError::InvalidParams(
                "latency is not supported by the Ultra head".into(),
            ));
        }
        if params.exposure > max_exposure() {
            return Err(DaqError::InvalidParams(format!(
                "exposure {:?} exceeds maximum {:?}",
                params.exposure,
                max_exposure()
            )));
        }
        if params.trigger_mode == TriggerMode::ExternalSingle {
            return Err(DaqError::InvalidParams(
                "trigger mode external_single is not supported".into(),
            ));
        }
        let known: [&str; 13] = [
            timing_keys::DELAY,
            timing_keys::WIDTH,
            timing_keys::ZERO_WIDTH,
            timing_keys::SAMPLE_WIDTH,
            timing_keys::RESET_WIDTH,
            timing_keys::SETTLING_TIME,
            timing_keys::XCLK_HALF_PERIOD,
            timing_keys::READOUT_MODE,
            timing_keys::SHIFT_DELAY,
            timing_keys::AUX1_DELAY,
            timing_keys::AUX1_WIDTH,
            timing_keys::AUX2_DELAY,
            timing_keys::AUX2_WIDTH,
        ];
        if let Some(unknown) = params.registers.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(DaqError::InvalidParams(format!(
                "unknown timing register '{unknown}'"
            )));
        }
        Ok(())
    }
}

/// Pair of aux keys that must be given together.
fn aux_pair(
    registers: &BTreeMap<String, u32>,
    delay_key: &str,
    width_key: &str,
) -> AppResult<Option<(u32, u32)>> {
    match (registers.get(delay_key), registers.get(width_key)) {
        (Some(delay), Some(width)) => Ok(Some((*delay, *width))),
        (None, None) => Ok(None),
        _ => Err(DaqError::InvalidParams(format!(
            "'{delay_key}' and '{width_key}' must be set together"
        ))),
    }
}

async fn receive(
    data: Arc<DataSocket>,
    requested_frames: u64,
    tx: mpsc::Sender<FrameEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut buf = data.packet_buffer();
    let mut tracker = protocol::SequenceTracker::default();
    let mut frames = 0u64;

    while requested_frames == 0 || frames < requested_frames {
        let received = tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            received = data.recv_packet(&mut buf) => received,
        };

        let mut events = Vec::with_capacity(2);
        match received {
            Ok(packet) => {
                if let Err(gap) = tracker.check(packet.frame_number) {
                    warn!(%gap, "Ultra frame sequence gap");
                    events.push(FrameEvent::Error(gap.to_string()));
                }
                frames += 1;
                let pixels = packet.pixels.len() / 2;
                events.push(FrameEvent::Frame(RawFrame::new(
                    pixels as u32,
                    1,
                    16,
                    u64::from(packet.frame_number),
                    packet.pixels,
                )));
            }
            Err(e) => {
                warn!(error = %e, "Ultra data packet rejected");
                events.push(FrameEvent::Error(e.to_string()));
            }
        }

        for event in events {
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
    }
    debug!(frames, "Ultra receiver finished sequence");
}

#[async_trait]
impl HardwareAdapter for UltraDetector {
    fn describe(&self) -> DetectorInfo {
        DetectorInfo {
            detector_type: "Ultra".to_string(),
            model: self.head_type.name().to_string(),
            width: self.config.npixels as u32,
            height: 1,
            bit_depth: 16,
            pixel_size_um: (1.0, 1.0),
        }
    }

    async fn telemetry(&self) -> AppResult<Telemetry> {
        let mut telemetry = Telemetry::default();
        for name in protocol::TEMPERATURE_NAMES {
            let reading = self.commands.read_float(name).await?;
            telemetry.temperatures.insert(name.to_string(), reading.value);
        }
        for name in protocol::VOLTAGE_NAMES {
            let reading = self.commands.read_float(name).await?;
            telemetry.voltages.insert(name.to_string(), reading.value);
        }
        for name in protocol::REGISTER_NAMES {
            let value = self.commands.read_hex(name).await?;
            telemetry.registers.insert(name.to_string(), value);
        }

        let register = |name: &str| telemetry.registers.get(name).copied().unwrap_or(0);
        let subsystems: BTreeMap<Subsystem, bool> = Subsystem::ALL
            .iter()
            .map(|s| {
                let (name, bits) = subsystem_register(*s);
                (*s, register(name) & bits == bits)
            })
            .collect();
        let over_temperature = register("fpgapwr") & mask::TEC_OVER_TEMP != 0;
        let frame_count = u64::from(register("fpgaframe"));
        let frame_error_count = u64::from(register("fpgaerror"));

        telemetry.subsystems = subsystems;
        telemetry.over_temperature = over_temperature;
        telemetry.frame_count = frame_count;
        telemetry.frame_error_count = frame_error_count;
        Ok(telemetry)
    }

    fn channel_count(&self) -> usize {
        protocol::CHANNELS
    }

    async fn calibration(&self, channel: usize) -> AppResult<ChannelCalibration> {
        let offset_name = protocol::adc_offset_name(self.head_type, channel)?;
        let gain_name = protocol::adc_gain_name(self.head_type, channel)?;
        Ok(ChannelCalibration {
            offset: self.commands.read_float(&offset_name).await?.value,
            gain: self.commands.read_float(&gain_name).await?.value,
        })
    }

    async fn set_calibration(
        &self,
        channel: usize,
        calibration: ChannelCalibration,
    ) -> AppResult<()> {
        let offset_name = protocol::adc_offset_name(self.head_type, channel)?;
        let gain_name = protocol::adc_gain_name(self.head_type, channel)?;
        self.commands
            .set(&offset_name, &protocol::format_volts(calibration.offset))
            .await?;
        self.commands
            .set(&gain_name, &protocol::format_volts(calibration.gain))
            .await
    }

    async fn timing(&self) -> AppResult<TimingParams> {
        let host = *self.host_timing.lock();
        let mut registers = BTreeMap::new();
        self.read_xchip().await?.write_registers(&mut registers);

        let (aux1_delay, aux1_width) = self.commands.read_pair("fpgaaux1").await?;
        let (aux2_delay, aux2_width) = self.commands.read_pair("fpgaaux2").await?;
        registers.insert(timing_keys::AUX1_DELAY.to_string(), aux1_delay);
        registers.insert(timing_keys::AUX1_WIDTH.to_string(), aux1_width);
        registers.insert(timing_keys::AUX2_DELAY.to_string(), aux2_delay);
        registers.insert(timing_keys::AUX2_WIDTH.to_string(), aux2_width);

        Ok(TimingParams {
            exposure: host.exposure,
            latency: Duration::ZERO,
            trigger_mode: host.trigger_mode,
            registers,
        })
    }

    async fn set_timing(&self, params: &TimingParams) -> AppResult<()> {
        Self::validate_timing(params)?;
        let xchip = XchipTiming::from_registers(&params.registers)
            .transpose()
            .map_err(|key| DaqError::InvalidParams(format!("missing timing register '{key}'")))?;
        let aux1 = aux_pair(
            &params.registers,
            timing_keys::AUX1_DELAY,
            timing_keys::AUX1_WIDTH,
        )?;
        let aux2 = aux_pair(
            &params.registers,
            timing_keys::AUX2_DELAY,
            timing_keys::AUX2_WIDTH,
        )?;

        if let Some(xchip) = xchip {
            for (name, first, second) in xchip.encode(self.head_type) {
                self.commands.set_pair(name, first, second).await?;
            }
        }
        if let Some((delay, width)) = aux1 {
            self.commands.set_pair("fpgaaux1", delay, width).await?;
        }
        if let Some((delay, width)) = aux2 {
            self.commands.set_pair("fpgaaux2", delay, width).await?;
        }

        *self.host_timing.lock() = HostTiming {
            exposure: params.exposure,
            trigger_mode: params.trigger_mode,
        };
        Ok(())
    }

    fn subsystems(&self) -> &[Subsystem] {
        &Subsystem::ALL
    }

    async fn subsystem_enabled(&self, subsystem: Subsystem) -> AppResult<bool> {
        ensure_subsystem(self, subsystem)?;
        let (name, bits) = subsystem_register(subsystem);
        Ok(self.commands.read_hex(name).await? & bits == bits)
    }

    async fn set_subsystem_enabled(&self, subsystem: Subsystem, enabled: bool) -> AppResult<()> {
        ensure_subsystem(self, subsystem)?;
        let (name, bits) = subsystem_register(subsystem);
        self.commands.update_register(name, bits, enabled).await
    }

    async fn arm(&self, requested_frames: u64) -> AppResult<()> {
        if let Some(previous) = self.stop_receiver() {
            let _ = previous.shutdown_tx.send(());
            let _ = previous.task.await;
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        *self.frame_rx.lock().await = Some(rx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receive(
            Arc::clone(&self.data),
            requested_frames,
            tx,
            shutdown_rx,
        ));
        *self.receiver.lock() = Some(Receiver { shutdown_tx, task });

        info!(requested_frames, "Ultra receiver armed");
        Ok(())
    }

    async fn disarm(&self) -> AppResult<()> {
        if let Some(receiver) = self.stop_receiver() {
            let _ = receiver.shutdown_tx.send(());
            let _ = receiver.task.await;
        }
        debug!("Ultra receiver disarmed");
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
        Ok(u64::from(self.commands.read_hex("fpgaerror").await?))
    }

    async fn save_configuration(&self) -> AppResult<()> {
        self.commands.set_flag("state").await?;
        info!("Ultra head configuration saved");
        Ok(())
    }

    /// The head takes the same `state` command to reload its stored settings.
    async fn restore_configuration(&self) -> AppResult<()> {
        self.commands.set_flag("state").await?;
        info!("Ultra head configuration restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let config = UltraConfig::default();
        assert_eq!(
            config.command_addr().unwrap(),
            "192.168.1.100:7".parse().unwrap()
        );
        assert_eq!(
            config.data_addr().unwrap(),
            "192.168.1.103:5005".parse().unwrap()
        );
    }

    #[test]
    fn test_bad_address_rejected() {
        let config = UltraConfig {
            head_ip: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.command_addr(),
            Err(DaqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_timing_validation() {
        let mut params = TimingParams {
            exposure: Duration::from_millis(10),
            ..Default::default()
        };
        assert!(UltraDetector::validate_timing(&params).is_ok());

        params.latency = Duration::from_millis(1);
        assert!(UltraDetector::validate_timing(&params).is_err());
        params.latency = Duration::ZERO;

        params.exposure = max_exposure() + Duration::from_secs(1);
        assert!(UltraDetector::validate_timing(&params).is_err());
        params.exposure = Duration::from_millis(10);

        params.trigger_mode = TriggerMode::ExternalSingle;
        assert!(UltraDetector::validate_timing(&params).is_err());
        params.trigger_mode = TriggerMode::ExternalMulti;
        assert!(UltraDetector::validate_timing(&params).is_ok());

        params.registers.insert("bogus".into(), 1);
        assert!(matches!(
            UltraDetector::validate_timing(&params),
            Err(DaqError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_aux_pair_requires_both() {
        let mut registers = BTreeMap::new();
        assert_eq!(
            aux_pair(&registers, timing_keys::AUX1_DELAY, timing_keys::AUX1_WIDTH).unwrap(),
            None
        );
        registers.insert(timing_keys::AUX1_DELAY.to_string(), 4);
        assert!(aux_pair(&registers, timing_keys::AUX1_DELAY, timing_keys::AUX1_WIDTH).is_err());
        registers.insert(timing_keys::AUX1_WIDTH.to_string(), 8);
        assert_eq!(
            aux_pair(&registers, timing_keys::AUX1_DELAY, timing_keys::AUX1_WIDTH).unwrap(),
            Some((4, 8))
        );
    }

    #[test]
    fn test_max_exposure_is_tick_bound() {
        assert_eq!(max_exposure().as_nanos(), u128::from(u32::MAX) * 20);
    }
}
