//! Ultra head wire formats.
//!
//! Pure functions only: command strings, reply parsing, ADC channel lookup,
//! x-chip timing register encoding and UDP data packet decoding. Socket I/O
//! lives in [`super::net`].
//!
//! # Command channel
//!
//! ASCII over TCP, `\r\n` terminated, one reply per command:
//!
//! | request              | reply                                   |
//! |----------------------|-----------------------------------------|
//! | *(empty line)*       | `!Command Not Recognised\r\n`           |
//! | `read <name>`        | float (`<`/`>` out-of-range prefix), hex register, or `a b` pair |
//! | `set <name> <value>` | `ACK\r\n`                               |
//!
//! # Data channel
//!
//! One UDP datagram per frame:
//!
//! ```text
//! [frame number: u32 BE][frame type: u16 BE][npixels × u16 LE]
//! ```

use bytes::Bytes;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::DaqError;

/// Line terminator on the command channel.
pub const TERMINATOR: &str = "\r\n";
/// Reply expected to the empty handshake command.
pub const HANDSHAKE_REPLY: &str = "!Command Not Recognised\r\n";
/// Reply expected to every `set` command.
pub const ACK_REPLY: &str = "ACK\r\n";
/// Readout channels with ADC calibration.
pub const CHANNELS: usize = 16;
/// FPGA timer tick.
pub const TICK_NS: u64 = 20;
/// Bytes before the pixel payload in a data packet.
pub const PACKET_HEADER_LEN: usize = 6;
/// EEPROM location holding the head type.
pub const HEAD_TYPE_ADDRESS: &str = "eeprom 0x1ff";

/// Register bit masks.
pub mod mask {
    /// `fpgapwr`: thermo-electric cooler supply
    pub const TEC_POWER: u32 = 0x01;
    /// `fpgapwr`: head supply
    pub const HEAD_POWER: u32 = 0x02;
    /// `fpgapwr`: sensor bias
    pub const BIAS_ENABLE: u32 = 0x04;
    /// `fpgapwr`: cooler over-temperature (read only)
    pub const TEC_OVER_TEMP: u32 = 0x8000_0000;
    /// `fpgasync`: external sync input
    pub const SYNC_ENABLE: u32 = 0x8000_0000;
    /// `fpgaxchip`: calibration pulse
    pub const CAL_ENABLE: u32 = 0x01;
    /// `fpgaxchip`: eight-phase clock
    pub const EIGHT_PHASE_CLOCK: u32 = 0x06;
}

/// Temperature sensors, in degrees Celsius.
pub const TEMPERATURE_NAMES: [&str; 3] = ["coldtemp", "hottemp", "tectemp"];

/// Supply and head voltages, in volts.
pub const VOLTAGE_NAMES: [&str; 14] = [
    "tecsup",
    "psupvadc",
    "psunvadc",
    "psupvin",
    "psunvin",
    "headvccadc",
    "headvcc",
    "headvref",
    "headvrefc",
    "headvpupref",
    "headvclamp",
    "headvres1",
    "headvres2",
    "headtrip",
];

/// Head voltages that accept `set <name> <volts>V`.
pub const SETTABLE_VOLTAGES: [&str; 8] = [
    "headvcc",
    "headvref",
    "headvrefc",
    "headvpupref",
    "headvclamp",
    "headvres1",
    "headvres2",
    "headtrip",
];

/// FPGA registers, hexadecimal replies.
pub const REGISTER_NAMES: [&str; 6] = [
    "fpgaxchip",
    "fpgapwr",
    "fpgasync",
    "fpgaadc",
    "fpgaframe",
    "fpgaerror",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad acknowledgement: {0:?}")]
    BadAck(String),
    #[error("unexpected handshake reply: {0:?}")]
    BadHandshake(String),
    #[error("cannot parse {what} from reply {reply:?}")]
    Unparsable { what: &'static str, reply: String },
    #[error("unknown head type {0}")]
    UnknownHeadType(u32),
    #[error("invalid channel {0}")]
    InvalidChannel(usize),
    #[error("data packet of {len} bytes, expected {expected}")]
    ShortPacket { len: usize, expected: usize },
    #[error("frame sequence error: lost data (expected frame {expected}, got {got})")]
    FrameSequence { expected: u32, got: u32 },
}

impl From<ProtocolError> for DaqError {
    fn from(value: ProtocolError) -> Self {
        match value {
            ProtocolError::InvalidChannel(channel) => DaqError::InvalidChannel {
                channel,
                count: CHANNELS,
            },
            other => DaqError::Protocol(other.to_string()),
        }
    }
}

// =============================================================================
// Head type and channel lookup
// =============================================================================

/// Sensor technology fitted to the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HeadType {
    /// Silicon strip
    Silicon,
    /// Indium gallium arsenide
    InGaAs,
    /// Mercury cadmium telluride
    Mct,
}

impl HeadType {
    /// Decode the EEPROM head type code.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(HeadType::Silicon),
            1 => Ok(HeadType::InGaAs),
            2 => Ok(HeadType::Mct),
            other => Err(ProtocolError::UnknownHeadType(other)),
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            HeadType::Silicon => "Silicon",
            HeadType::InGaAs => "InGaAs",
            HeadType::Mct => "MCT",
        }
    }
}

const SI_BOARD: [u8; CHANNELS] = [1, 0, 1, 0, 1, 0, 1, 0, 2, 3, 2, 3, 2, 3, 2, 3];
const SI_CHANNEL: [u8; CHANNELS] = [3, 2, 0, 1, 1, 0, 2, 3, 3, 2, 0, 1, 1, 0, 2, 3];

/// ADC board and board-local channel serving a readout channel.
pub fn adc_location(head: HeadType, channel: usize) -> Result<(u8, u8), ProtocolError> {
    if channel >= CHANNELS {
        return Err(ProtocolError::InvalidChannel(channel));
    }
    Ok(match head {
        HeadType::Mct => ((channel / 4) as u8, (channel % 4) as u8),
        HeadType::Silicon | HeadType::InGaAs => (SI_BOARD[channel], SI_CHANNEL[channel]),
    })
}

/// Name of the ADC offset value for a readout channel.
pub fn adc_offset_name(head: HeadType, channel: usize) -> Result<String, ProtocolError> {
    let (board, chan) = adc_location(head, channel)?;
    Ok(format!("adc{board}off{chan}"))
}

/// Name of the ADC gain reference for a readout channel.
pub fn adc_gain_name(head: HeadType, channel: usize) -> Result<String, ProtocolError> {
    let (board, chan) = adc_location(head, channel)?;
    Ok(format!("adc{board}ref{chan}"))
}

// =============================================================================
// Commands and replies
// =============================================================================

/// `read <name>`
pub fn read_command(name: &str) -> String {
    format!("read {name}")
}

/// `set <name> <value>`
pub fn set_command(name: &str, value: &str) -> String {
    format!("set {name} {value}")
}

/// Register value as the head expects it: lowercase hex without prefix.
pub fn format_register(value: u32) -> String {
    format!("{value:x}")
}

/// Voltage with the `V` unit suffix.
pub fn format_volts(volts: f64) -> String {
    format!("{volts}V")
}

/// Check a `set` reply.
pub fn check_ack(reply: &str) -> Result<(), ProtocolError> {
    if reply == ACK_REPLY {
        Ok(())
    } else {
        Err(ProtocolError::BadAck(reply.to_string()))
    }
}

/// Check the handshake reply.
pub fn check_handshake(reply: &str) -> Result<(), ProtocolError> {
    if reply == HANDSHAKE_REPLY {
        Ok(())
    } else {
        Err(ProtocolError::BadHandshake(reply.to_string()))
    }
}

/// Out-of-range marker on a float reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMarker {
    /// `<`: below the measurable range
    Below,
    /// `>`: above the measurable range
    Above,
}

/// A float reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatReading {
    /// Parsed value
    pub value: f64,
    /// Out-of-range marker, if the head sent one
    pub marker: Option<RangeMarker>,
}

/// Leading token of a reply, up to the first whitespace.
fn first_token(reply: &str) -> &str {
    reply.split_whitespace().next().unwrap_or("")
}

/// Parse a float reply, accepting a `<` or `>` prefix and a trailing unit.
pub fn parse_float(reply: &str) -> Result<FloatReading, ProtocolError> {
    let trimmed = reply.trim();
    let (marker, rest) = match trimmed.chars().next() {
        Some('<') => (Some(RangeMarker::Below), &trimmed[1..]),
        Some('>') => (Some(RangeMarker::Above), &trimmed[1..]),
        _ => (None, trimmed),
    };
    let token = first_token(rest);
    // Longest numeric prefix, so "3.30V" parses as 3.30
    let end = token
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    token[..end]
        .parse::<f64>()
        .map(|value| FloatReading { value, marker })
        .map_err(|_| ProtocolError::Unparsable {
            what: "float",
            reply: reply.to_string(),
        })
}

/// Parse a hexadecimal register reply.
pub fn parse_hex(reply: &str) -> Result<u32, ProtocolError> {
    let token = first_token(reply);
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u32::from_str_radix(digits, 16).map_err(|_| ProtocolError::Unparsable {
        what: "hex register",
        reply: reply.to_string(),
    })
}

/// Parse a two-value `delay width` reply.
pub fn parse_pair(reply: &str) -> Result<(u32, u32), ProtocolError> {
    let mut values = reply.split_whitespace().map(str::parse::<u32>);
    match (values.next(), values.next()) {
        (Some(Ok(a)), Some(Ok(b))) => Ok((a, b)),
        _ => Err(ProtocolError::Unparsable {
            what: "value pair",
            reply: reply.to_string(),
        }),
    }
}

// =============================================================================
// X-chip timing
// =============================================================================

/// Keys used for x-chip and aux timing in `TimingParams::registers`.
pub mod timing_keys {
    /// Integration start delay
    pub const DELAY: &str = "xchip_delay";
    /// Integration width
    pub const WIDTH: &str = "xchip_width";
    /// Zero (reset level) sample width
    pub const ZERO_WIDTH: &str = "xchip_zero_width";
    /// Signal sample width
    pub const SAMPLE_WIDTH: &str = "xchip_sample_width";
    /// Reset pulse width
    pub const RESET_WIDTH: &str = "xchip_reset_width";
    /// ADC settling time
    pub const SETTLING_TIME: &str = "xchip_settling_time";
    /// Half period of the readout clock
    pub const XCLK_HALF_PERIOD: &str = "xchip_xclk_half_period";
    /// 1 = shift after the signal sample, 0 = shift at the start delay
    pub const READOUT_MODE: &str = "xchip_readout_mode";
    /// Shift register delay (read only)
    pub const SHIFT_DELAY: &str = "xchip_shift_delay";
    /// Aux output 1 delay
    pub const AUX1_DELAY: &str = "aux1_delay";
    /// Aux output 1 width
    pub const AUX1_WIDTH: &str = "aux1_width";
    /// Aux output 2 delay
    pub const AUX2_DELAY: &str = "aux2_delay";
    /// Aux output 2 width
    pub const AUX2_WIDTH: &str = "aux2_width";

    /// Keys written by `XchipTiming::encode`.
    pub const XCHIP_WRITABLE: [&str; 8] = [
        DELAY,
        WIDTH,
        ZERO_WIDTH,
        SAMPLE_WIDTH,
        RESET_WIDTH,
        SETTLING_TIME,
        XCLK_HALF_PERIOD,
        READOUT_MODE,
    ];
}

/// Raw x-chip registers, each a `(delay, width)` style pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XchipRegisters {
    /// `fpgarst`: delay, reset width
    pub rst: (u32, u32),
    /// `fpgas1`: delay, width
    pub s1: (u32, u32),
    /// `fpgas2`: delay, width
    pub s2: (u32, u32),
    /// `fpgaxclk`: half period, settling time
    pub xclk: (u32, u32),
    /// `fpgashift`: delay, width
    pub shift: (u32, u32),
}

/// X-chip timing in FPGA ticks, as seen by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XchipTiming {
    /// Integration start delay
    pub delay: u32,
    /// Integration width
    pub width: u32,
    /// Zero sample width
    pub zero_width: u32,
    /// Signal sample width
    pub sample_width: u32,
    /// Reset pulse width
    pub reset_width: u32,
    /// ADC settling time
    pub settling_time: u32,
    /// Readout clock half period
    pub xclk_half_period: u32,
    /// Readout mode (0 or 1)
    pub readout_mode: u32,
    /// Shift register delay, derived
    pub shift_delay: u32,
}

impl XchipTiming {
    /// Reconstruct user timing from the registers.
    ///
    /// InGaAs heads sample zero on S2 and signal on S1; the other heads use
    /// the opposite assignment.
    pub fn decode(head: HeadType, regs: &XchipRegisters) -> Self {
        let (rst_delay, reset_width) = regs.rst;
        let (xclk_half_period, settling_time) = regs.xclk;
        let shift_delay = regs.shift.0;
        let ((s1_delay, s1_width), (s2_delay, s2_width)) = (regs.s1, regs.s2);

        match head {
            HeadType::InGaAs => XchipTiming {
                delay: rst_delay + s2_width,
                width: (s1_width + s1_delay).saturating_sub(s2_width + s2_delay),
                zero_width: s2_width,
                sample_width: s1_width,
                reset_width,
                settling_time,
                xclk_half_period,
                readout_mode: 0,
                shift_delay,
            },
            HeadType::Silicon | HeadType::Mct => {
                let delay = rst_delay + s1_width;
                let width = (s2_width + s2_delay).saturating_sub(s1_width + s1_delay);
                XchipTiming {
                    delay,
                    width,
                    zero_width: s1_width,
                    sample_width: s2_width,
                    reset_width,
                    settling_time,
                    xclk_half_period,
                    readout_mode: u32::from(shift_delay == delay + width),
                    shift_delay,
                }
            }
        }
    }

    /// Commands (`name`, first value, second value) that program this timing.
    ///
    /// `fpgaxclk` is only written when the settling time has to be clamped to
    /// `xclk_half_period - 2`.
    pub fn encode(&self, head: HeadType) -> Vec<(&'static str, u32, u32)> {
        let delay = if self.delay > self.zero_width {
            self.delay - self.zero_width
        } else {
            1
        };
        let start_delay = (delay + self.zero_width + self.width).saturating_sub(self.sample_width);
        let shift_delay = if self.readout_mode == 1 {
            start_delay + self.sample_width
        } else {
            delay
        };

        let (s1, s2) = match head {
            HeadType::InGaAs => ((start_delay, self.sample_width), (delay, self.zero_width)),
            HeadType::Silicon | HeadType::Mct => {
                ((delay, self.zero_width), (start_delay, self.sample_width))
            }
        };

        let mut commands = vec![
            ("fpgarst", delay, self.reset_width),
            ("fpgas1", s1.0, s1.1),
            ("fpgas2", s2.0, s2.1),
            ("fpgashift", shift_delay, 1),
        ];
        let max_settling = self.xclk_half_period.saturating_sub(2);
        if self.settling_time > max_settling {
            commands.push(("fpgaxclk", self.xclk_half_period, max_settling));
        }
        commands
    }

    /// Store into a timing register map.
    pub fn write_registers(&self, registers: &mut BTreeMap<String, u32>) {
        use timing_keys::*;
        for (key, value) in [
            (DELAY, self.delay),
            (WIDTH, self.width),
            (ZERO_WIDTH, self.zero_width),
            (SAMPLE_WIDTH, self.sample_width),
            (RESET_WIDTH, self.reset_width),
            (SETTLING_TIME, self.settling_time),
            (XCLK_HALF_PERIOD, self.xclk_half_period),
            (READOUT_MODE, self.readout_mode),
            (SHIFT_DELAY, self.shift_delay),
        ] {
            registers.insert(key.to_string(), value);
        }
    }

    /// Read from a timing register map.
    ///
    /// `None` when no x-chip key is present; `Err` naming the first missing key
    /// when only some are.
    pub fn from_registers(registers: &BTreeMap<String, u32>) -> Option<Result<Self, String>> {
        use timing_keys::*;
        if !XCHIP_WRITABLE.iter().any(|k| registers.contains_key(*k)) {
            return None;
        }
        let get = |key: &str| registers.get(key).copied().ok_or_else(|| key.to_string());
        Some((|| {
            Ok(XchipTiming {
                delay: get(DELAY)?,
                width: get(WIDTH)?,
                zero_width: get(ZERO_WIDTH)?,
                sample_width: get(SAMPLE_WIDTH)?,
                reset_width: get(RESET_WIDTH)?,
                settling_time: get(SETTLING_TIME)?,
                xclk_half_period: get(XCLK_HALF_PERIOD)?,
                readout_mode: get(READOUT_MODE)?,
                shift_delay: registers.get(SHIFT_DELAY).copied().unwrap_or(0),
            })
        })())
    }
}

// =============================================================================
// Data packets
// =============================================================================

/// One decoded UDP frame packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    /// Head frame counter
    pub frame_number: u32,
    /// Frame type word (unused by the head firmware so far)
    pub frame_type: u16,
    /// `npixels` little-endian u16 pixels
    pub pixels: Bytes,
}

/// Decode a datagram carrying `npixels` 16-bit pixels.
pub fn decode_packet(datagram: &[u8], npixels: usize) -> Result<DataPacket, ProtocolError> {
    let expected = PACKET_HEADER_LEN + npixels * 2;
    if datagram.len() < expected {
        return Err(ProtocolError::ShortPacket {
            len: datagram.len(),
            expected,
        });
    }
    Ok(DataPacket {
        frame_number: u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]),
        frame_type: u16::from_be_bytes([datagram[4], datagram[5]]),
        pixels: Bytes::copy_from_slice(&datagram[PACKET_HEADER_LEN..expected]),
    })
}

/// Build a datagram, as the head firmware does.
pub fn encode_packet(frame_number: u32, frame_type: u16, pixels: &[u16]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(PACKET_HEADER_LEN + pixels.len() * 2);
    datagram.extend_from_slice(&frame_number.to_be_bytes());
    datagram.extend_from_slice(&frame_type.to_be_bytes());
    for pixel in pixels {
        datagram.extend_from_slice(&pixel.to_le_bytes());
    }
    datagram
}

/// Detects gaps in the head frame counter.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    /// Record `frame_number`; `FrameSequence` if frames were skipped.
    pub fn check(&mut self, frame_number: u32) -> Result<(), ProtocolError> {
        let previous = self.last.replace(frame_number);
        match previous {
            Some(last) if frame_number != last.wrapping_add(1) => {
                Err(ProtocolError::FrameSequence {
                    expected: last.wrapping_add(1),
                    got: frame_number,
                })
            }
            _ => Ok(()),
        }
    }

    /// Forget the last frame number.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
