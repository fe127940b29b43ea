//! Wire protocol: opcodes, response types, command encoding and incremental
//! response parsing.
//!
//! Command: `[opcode][payload..]`. Response: `[type][fixed payload]`, after an
//! ACK byte. Streaming frame: `[0x00][timestamp:2][channel payload..]`.

use std::time::Duration;

use crate::types::{FirmwareVersion, HardwareGeneration, ShimmerError};

// Packet types
pub const DATA_PACKET: u8 = 0x00;
pub const ACK: u8 = 0xFF;

// Commands
pub const INQUIRY_COMMAND: u8 = 0x01;
pub const GET_SAMPLING_RATE_COMMAND: u8 = 0x03;
pub const SET_SAMPLING_RATE_COMMAND: u8 = 0x05;
pub const TOGGLE_LED_COMMAND: u8 = 0x06;
pub const START_STREAMING_COMMAND: u8 = 0x07;
pub const SET_SENSORS_COMMAND: u8 = 0x08;
pub const SET_ACCEL_RANGE_COMMAND: u8 = 0x09;
pub const GET_ACCEL_RANGE_COMMAND: u8 = 0x0B;
pub const SET_5V_REGULATOR_COMMAND: u8 = 0x0C;
pub const SET_PMUX_COMMAND: u8 = 0x0D;
pub const SET_CONFIG_BYTES_COMMAND: u8 = 0x0E;
pub const GET_CONFIG_BYTES_COMMAND: u8 = 0x10;
pub const GET_ACCEL_CALIBRATION_COMMAND: u8 = 0x13;
pub const GET_GYRO_CALIBRATION_COMMAND: u8 = 0x16;
pub const GET_MAG_CALIBRATION_COMMAND: u8 = 0x19;
pub const STOP_STREAMING_COMMAND: u8 = 0x20;
pub const SET_GSR_RANGE_COMMAND: u8 = 0x21;
pub const GET_GSR_RANGE_COMMAND: u8 = 0x23;
pub const GET_EMG_CALIBRATION_COMMAND: u8 = 0x28;
pub const GET_ECG_CALIBRATION_COMMAND: u8 = 0x2B;
pub const GET_ALL_CALIBRATION_COMMAND: u8 = 0x2C;
pub const GET_FW_VERSION_COMMAND: u8 = 0x2E;
pub const SET_BLINK_LED_COMMAND: u8 = 0x30;
pub const GET_BLINK_LED_COMMAND: u8 = 0x32;
pub const SET_BUFFER_SIZE_COMMAND: u8 = 0x34;
pub const GET_BUFFER_SIZE_COMMAND: u8 = 0x36;
pub const SET_MAG_GAIN_COMMAND: u8 = 0x37;
pub const GET_MAG_GAIN_COMMAND: u8 = 0x39;
pub const SET_MAG_SAMPLING_RATE_COMMAND: u8 = 0x3A;
pub const GET_MAG_SAMPLING_RATE_COMMAND: u8 = 0x3C;
pub const GET_HW_VERSION_COMMAND: u8 = 0x3F;
pub const SET_ACCEL_LOW_POWER_COMMAND: u8 = 0x43;
pub const SET_GYRO_RANGE_COMMAND: u8 = 0x49;
pub const GET_GYRO_RANGE_COMMAND: u8 = 0x4B;
pub const SET_GYRO_SAMPLING_RATE_COMMAND: u8 = 0x4C;
pub const SET_INTERNAL_EXP_POWER_COMMAND: u8 = 0x5E;

// Responses
pub const INQUIRY_RESPONSE: u8 = 0x02;
pub const SAMPLING_RATE_RESPONSE: u8 = 0x04;
pub const ACCEL_RANGE_RESPONSE: u8 = 0x0A;
pub const CONFIG_BYTES_RESPONSE: u8 = 0x0F;
pub const ACCEL_CALIBRATION_RESPONSE: u8 = 0x12;
pub const GYRO_CALIBRATION_RESPONSE: u8 = 0x15;
pub const MAG_CALIBRATION_RESPONSE: u8 = 0x18;
pub const GSR_RANGE_RESPONSE: u8 = 0x22;
pub const HW_VERSION_RESPONSE: u8 = 0x25;
pub const EMG_CALIBRATION_RESPONSE: u8 = 0x27;
pub const ECG_CALIBRATION_RESPONSE: u8 = 0x2A;
pub const ALL_CALIBRATION_RESPONSE: u8 = 0x2D;
pub const FW_VERSION_RESPONSE: u8 = 0x2F;
pub const BLINK_LED_RESPONSE: u8 = 0x31;
pub const BUFFER_SIZE_RESPONSE: u8 = 0x35;
pub const MAG_GAIN_RESPONSE: u8 = 0x38;
pub const MAG_SAMPLING_RATE_RESPONSE: u8 = 0x3B;
pub const GYRO_RANGE_RESPONSE: u8 = 0x4A;

/// Size of one inertial calibration block: offset, sensitivity, alignment.
pub const INERTIAL_CALIBRATION_LEN: usize = 21;
pub const ECG_CALIBRATION_LEN: usize = 8;
pub const EMG_CALIBRATION_LEN: usize = 4;

/// Encode a sampling rate for the set-sampling-rate command.
pub fn encode_sampling_rate(generation: HardwareGeneration, hz: f64) -> Vec<u8> {
    if generation.is_legacy() {
        let divider = (1024.0 / hz).round().clamp(1.0, 255.0) as u8;
        vec![divider]
    } else {
        let divider = (32768.0 / hz).round().clamp(1.0, 65535.0) as u16;
        divider.to_le_bytes().to_vec()
    }
}

/// Decode a sampling-rate divider as reported by the device.
pub fn decode_sampling_rate(generation: HardwareGeneration, raw: &[u8]) -> f64 {
    let (clock, divider) = if generation.is_legacy() {
        (1024.0, raw.first().copied().unwrap_or(0) as f64)
    } else {
        let lo = raw.first().copied().unwrap_or(0) as u16;
        let hi = raw.get(1).copied().unwrap_or(0) as u16;
        (32768.0, (lo | (hi << 8)) as f64)
    };
    if divider == 0.0 {
        0.0
    } else {
        clock / divider
    }
}

/// The rate the device actually runs at after rounding the divider.
pub fn effective_sampling_rate(generation: HardwareGeneration, hz: f64) -> f64 {
    decode_sampling_rate(generation, &encode_sampling_rate(generation, hz))
}

/// Gyroscope (MPU9150) internal rate setting: `8000 / (1 + x)` Hz.
pub fn gyro_rate_setting(sampling_rate_hz: f64, low_power: bool) -> u8 {
    if low_power {
        return 0xFF;
    }
    let x = (8000.0 / sampling_rate_hz.max(1.0)).floor() - 1.0;
    x.clamp(0.0, 255.0) as u8
}

/// Magnetometer internal rate index: the slowest rate not below the sampling
/// rate, capped at 15 Hz in low-power mode.
pub fn mag_rate_setting(generation: HardwareGeneration, sampling_rate_hz: f64, low_power: bool) -> u8 {
    const SHIMMER3_RATES: [f64; 8] = [0.75, 1.5, 3.0, 7.5, 15.0, 30.0, 75.0, 220.0];
    const LEGACY_RATES: [f64; 7] = [0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0];
    let (rates, low_power_index): (&[f64], usize) = if generation.is_legacy() {
        (&LEGACY_RATES, 4)
    } else {
        (&SHIMMER3_RATES, 4)
    };
    let index = rates
        .iter()
        .position(|&r| r >= sampling_rate_hz)
        .unwrap_or(rates.len() - 1);
    if low_power {
        index.min(low_power_index) as u8
    } else {
        index as u8
    }
}

/// Which calibration block a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationGroup {
    Accel,
    Gyro,
    Mag,
    Emg,
    Ecg,
    All,
}

impl CalibrationGroup {
    pub fn command(self) -> u8 {
        match self {
            CalibrationGroup::Accel => GET_ACCEL_CALIBRATION_COMMAND,
            CalibrationGroup::Gyro => GET_GYRO_CALIBRATION_COMMAND,
            CalibrationGroup::Mag => GET_MAG_CALIBRATION_COMMAND,
            CalibrationGroup::Emg => GET_EMG_CALIBRATION_COMMAND,
            CalibrationGroup::Ecg => GET_ECG_CALIBRATION_COMMAND,
            CalibrationGroup::All => GET_ALL_CALIBRATION_COMMAND,
        }
    }

    pub fn response(self) -> u8 {
        match self {
            CalibrationGroup::Accel => ACCEL_CALIBRATION_RESPONSE,
            CalibrationGroup::Gyro => GYRO_CALIBRATION_RESPONSE,
            CalibrationGroup::Mag => MAG_CALIBRATION_RESPONSE,
            CalibrationGroup::Emg => EMG_CALIBRATION_RESPONSE,
            CalibrationGroup::Ecg => ECG_CALIBRATION_RESPONSE,
            CalibrationGroup::All => ALL_CALIBRATION_RESPONSE,
        }
    }

    pub fn payload_len(self, generation: HardwareGeneration) -> usize {
        match self {
            CalibrationGroup::Accel | CalibrationGroup::Gyro | CalibrationGroup::Mag => {
                INERTIAL_CALIBRATION_LEN
            }
            CalibrationGroup::Emg => EMG_CALIBRATION_LEN,
            CalibrationGroup::Ecg => ECG_CALIBRATION_LEN,
            CalibrationGroup::All => all_calibration_len(generation),
        }
    }
}

/// Length of the all-calibration dump.
pub fn all_calibration_len(generation: HardwareGeneration) -> usize {
    if generation.is_legacy() {
        3 * INERTIAL_CALIBRATION_LEN + EMG_CALIBRATION_LEN + ECG_CALIBRATION_LEN
    } else {
        4 * INERTIAL_CALIBRATION_LEN
    }
}

/// Everything a command does, in the device session's vocabulary.
///
/// The variant decides the wire bytes, what the device answers with and which
/// side effect the state machine applies when the answer arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Dummy sampling-rate read issued first to flush the link.
    FlushProbe,
    FirmwareProbe,
    ReadHardwareVersion,
    ReadSamplingRate,
    ReadAccelRange,
    ReadGyroRange,
    ReadMagGain,
    ReadGsrRange,
    ReadConfigBytes,
    ReadBufferSize,
    ReadBlinkLed,
    ReadMagSamplingRate,
    ReadCalibration(CalibrationGroup),
    Inquiry,
    SetSamplingRate(f64),
    SetSensors(u32),
    SetAccelRange(u8),
    SetGyroRange(u8),
    SetMagGain(u8),
    SetGsrRange(u8),
    /// Full configuration bytes, used for sub-mode changes.
    SetConfigBytes(Vec<u8>),
    SetAccelLowPower(bool),
    SetGyroSamplingRate { setting: u8, low_power: bool },
    SetMagSamplingRate { setting: u8, low_power: bool },
    ToggleLed,
    SetFiveVoltRegulator(bool),
    SetPmux(bool),
    SetInternalExpPower(bool),
    SetBlinkLed(u8),
    SetBufferSize(u8),
    StartStreaming,
    StopStreaming,
}

/// What completes a pending command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    AckOnly,
    AckThenResponse(u8),
}

impl CommandKind {
    pub fn opcode(&self) -> u8 {
        match self {
            CommandKind::FlushProbe | CommandKind::ReadSamplingRate => GET_SAMPLING_RATE_COMMAND,
            CommandKind::FirmwareProbe => GET_FW_VERSION_COMMAND,
            CommandKind::ReadHardwareVersion => GET_HW_VERSION_COMMAND,
            CommandKind::ReadAccelRange => GET_ACCEL_RANGE_COMMAND,
            CommandKind::ReadGyroRange => GET_GYRO_RANGE_COMMAND,
            CommandKind::ReadMagGain => GET_MAG_GAIN_COMMAND,
            CommandKind::ReadGsrRange => GET_GSR_RANGE_COMMAND,
            CommandKind::ReadConfigBytes => GET_CONFIG_BYTES_COMMAND,
            CommandKind::ReadBufferSize => GET_BUFFER_SIZE_COMMAND,
            CommandKind::ReadBlinkLed => GET_BLINK_LED_COMMAND,
            CommandKind::ReadMagSamplingRate => GET_MAG_SAMPLING_RATE_COMMAND,
            CommandKind::ReadCalibration(group) => group.command(),
            CommandKind::Inquiry => INQUIRY_COMMAND,
            CommandKind::SetSamplingRate(_) => SET_SAMPLING_RATE_COMMAND,
            CommandKind::SetSensors(_) => SET_SENSORS_COMMAND,
            CommandKind::SetAccelRange(_) => SET_ACCEL_RANGE_COMMAND,
            CommandKind::SetGyroRange(_) => SET_GYRO_RANGE_COMMAND,
            CommandKind::SetMagGain(_) => SET_MAG_GAIN_COMMAND,
            CommandKind::SetGsrRange(_) => SET_GSR_RANGE_COMMAND,
            CommandKind::SetConfigBytes(_) => SET_CONFIG_BYTES_COMMAND,
            CommandKind::SetAccelLowPower(_) => SET_ACCEL_LOW_POWER_COMMAND,
            CommandKind::SetGyroSamplingRate { .. } => SET_GYRO_SAMPLING_RATE_COMMAND,
            CommandKind::SetMagSamplingRate { .. } => SET_MAG_SAMPLING_RATE_COMMAND,
            CommandKind::ToggleLed => TOGGLE_LED_COMMAND,
            CommandKind::SetFiveVoltRegulator(_) => SET_5V_REGULATOR_COMMAND,
            CommandKind::SetPmux(_) => SET_PMUX_COMMAND,
            CommandKind::SetInternalExpPower(_) => SET_INTERNAL_EXP_POWER_COMMAND,
            CommandKind::SetBlinkLed(_) => SET_BLINK_LED_COMMAND,
            CommandKind::SetBufferSize(_) => SET_BUFFER_SIZE_COMMAND,
            CommandKind::StartStreaming => START_STREAMING_COMMAND,
            CommandKind::StopStreaming => STOP_STREAMING_COMMAND,
        }
    }

    pub fn expectation(&self) -> Expectation {
        let response = match self {
            CommandKind::FlushProbe | CommandKind::ReadSamplingRate => SAMPLING_RATE_RESPONSE,
            CommandKind::FirmwareProbe => FW_VERSION_RESPONSE,
            CommandKind::ReadHardwareVersion => HW_VERSION_RESPONSE,
            CommandKind::ReadAccelRange => ACCEL_RANGE_RESPONSE,
            CommandKind::ReadGyroRange => GYRO_RANGE_RESPONSE,
            CommandKind::ReadMagGain => MAG_GAIN_RESPONSE,
            CommandKind::ReadGsrRange => GSR_RANGE_RESPONSE,
            CommandKind::ReadConfigBytes => CONFIG_BYTES_RESPONSE,
            CommandKind::ReadBufferSize => BUFFER_SIZE_RESPONSE,
            CommandKind::ReadBlinkLed => BLINK_LED_RESPONSE,
            CommandKind::ReadMagSamplingRate => MAG_SAMPLING_RATE_RESPONSE,
            CommandKind::ReadCalibration(group) => group.response(),
            CommandKind::Inquiry => INQUIRY_RESPONSE,
            _ => return Expectation::AckOnly,
        };
        Expectation::AckThenResponse(response)
    }

    /// Commands whose response is long enough to need the long timeout.
    pub fn is_long(&self) -> bool {
        matches!(
            self,
            CommandKind::Inquiry | CommandKind::ReadCalibration(CalibrationGroup::All)
        )
    }

    /// Commands only valid once bring-up has finished and while not streaming.
    pub fn requires_idle(&self) -> bool {
        matches!(
            self,
            CommandKind::SetSamplingRate(_)
                | CommandKind::SetSensors(_)
                | CommandKind::SetMagGain(_)
                | CommandKind::SetConfigBytes(_)
                | CommandKind::SetPmux(_)
                | CommandKind::Inquiry
                | CommandKind::StartStreaming
        )
    }

    /// Whether the command may go out mid-stream. Its reply must be a bare
    /// ACK, since anything longer would be read as frame bytes.
    pub fn allowed_while_streaming(&self) -> bool {
        !self.requires_idle() && self.expectation() == Expectation::AckOnly
    }

    /// Full wire bytes for this command.
    pub fn encode(&self, generation: HardwareGeneration) -> Vec<u8> {
        let mut bytes = vec![self.opcode()];
        match self {
            CommandKind::SetSamplingRate(hz) => {
                bytes.extend(encode_sampling_rate(generation, *hz));
            }
            CommandKind::SetSensors(bitmap) => {
                let le = bitmap.to_le_bytes();
                let width = if generation.is_legacy() { 2 } else { 3 };
                bytes.extend_from_slice(&le[..width]);
            }
            CommandKind::SetAccelRange(v)
            | CommandKind::SetGyroRange(v)
            | CommandKind::SetMagGain(v)
            | CommandKind::SetGsrRange(v)
            | CommandKind::SetBlinkLed(v)
            | CommandKind::SetBufferSize(v) => bytes.push(*v),
            CommandKind::SetGyroSamplingRate { setting, .. }
            | CommandKind::SetMagSamplingRate { setting, .. } => bytes.push(*setting),
            CommandKind::SetConfigBytes(config) => bytes.extend_from_slice(config),
            CommandKind::SetAccelLowPower(on)
            | CommandKind::SetFiveVoltRegulator(on)
            | CommandKind::SetPmux(on)
            | CommandKind::SetInternalExpPower(on) => bytes.push(u8::from(*on)),
            _ => {}
        }
        bytes
    }
}

/// A command sitting in the instruction queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub bytes: Vec<u8>,
    pub expects: Expectation,
    pub timeout: Duration,
    /// A timeout is a soft failure rather than fatal.
    pub probe: bool,
    /// Completing this command finishes bring-up.
    pub completes_bring_up: bool,
}

impl PendingCommand {
    pub fn new(
        kind: CommandKind,
        generation: HardwareGeneration,
        ack_timeout: Duration,
        long_timeout: Duration,
    ) -> Self {
        let timeout = if kind.is_long() { long_timeout } else { ack_timeout };
        Self {
            bytes: kind.encode(generation),
            expects: kind.expectation(),
            probe: matches!(kind, CommandKind::FlushProbe | CommandKind::FirmwareProbe),
            completes_bring_up: false,
            timeout,
            kind,
        }
    }

    pub fn opcode(&self) -> u8 {
        self.kind.opcode()
    }

    pub fn completing_bring_up(mut self) -> Self {
        self.completes_bring_up = true;
        self
    }
}

/// Inquiry answer: the device's live configuration and channel list.
#[derive(Debug, Clone, PartialEq)]
pub struct InquiryResponse {
    pub sampling_rate_hz: f64,
    /// Only legacy devices report it in the inquiry.
    pub accel_range: Option<u8>,
    pub config_bytes: Vec<u8>,
    pub buffer_size: u8,
    pub channel_ids: Vec<u8>,
}

/// A parsed device response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Inquiry(InquiryResponse),
    SamplingRate(f64),
    AccelRange(u8),
    GyroRange(u8),
    MagGain(u8),
    GsrRange(u8),
    ConfigBytes(Vec<u8>),
    Calibration {
        group: CalibrationGroup,
        payload: Vec<u8>,
    },
    FirmwareVersion(FirmwareVersion),
    HardwareVersion(u8),
    BlinkLed(u8),
    BufferSize(u8),
    MagSamplingRate(u8),
}

fn calibration_group_for(type_byte: u8) -> Option<CalibrationGroup> {
    match type_byte {
        ACCEL_CALIBRATION_RESPONSE => Some(CalibrationGroup::Accel),
        GYRO_CALIBRATION_RESPONSE => Some(CalibrationGroup::Gyro),
        MAG_CALIBRATION_RESPONSE => Some(CalibrationGroup::Mag),
        EMG_CALIBRATION_RESPONSE => Some(CalibrationGroup::Emg),
        ECG_CALIBRATION_RESPONSE => Some(CalibrationGroup::Ecg),
        ALL_CALIBRATION_RESPONSE => Some(CalibrationGroup::All),
        _ => None,
    }
}

/// Parse a response from `buf`, which starts at the type byte.
///
/// Returns `Ok(None)` while more bytes are needed, or the response together
/// with the number of bytes it used.
pub fn parse_response(
    generation: HardwareGeneration,
    buf: &[u8],
) -> Result<Option<(Response, usize)>, ShimmerError> {
    let Some(&type_byte) = buf.first() else {
        return Ok(None);
    };
    let payload = &buf[1..];
    let legacy = generation.is_legacy();

    // Fixed-size responses first.
    let fixed_len = match type_byte {
        SAMPLING_RATE_RESPONSE => Some(if legacy { 1 } else { 2 }),
        CONFIG_BYTES_RESPONSE => Some(if legacy { 1 } else { 4 }),
        FW_VERSION_RESPONSE => Some(6),
        INQUIRY_RESPONSE => None,
        ACCEL_RANGE_RESPONSE | GYRO_RANGE_RESPONSE | MAG_GAIN_RESPONSE | GSR_RANGE_RESPONSE
        | HW_VERSION_RESPONSE | BLINK_LED_RESPONSE | BUFFER_SIZE_RESPONSE
        | MAG_SAMPLING_RATE_RESPONSE => Some(1),
        other => match calibration_group_for(other) {
            Some(group) => Some(group.payload_len(generation)),
            None => {
                return Err(ShimmerError::Configuration(format!(
                    "Unknown response type 0x{:02X}",
                    other
                )))
            }
        },
    };

    if let Some(len) = fixed_len {
        if payload.len() < len {
            return Ok(None);
        }
        let body = &payload[..len];
        let response = match type_byte {
            SAMPLING_RATE_RESPONSE => Response::SamplingRate(decode_sampling_rate(generation, body)),
            CONFIG_BYTES_RESPONSE => Response::ConfigBytes(body.to_vec()),
            FW_VERSION_RESPONSE => Response::FirmwareVersion(FirmwareVersion {
                identifier: u16::from_le_bytes([body[0], body[1]]),
                major: u16::from_le_bytes([body[2], body[3]]),
                minor: body[4],
                internal: body[5],
            }),
            ACCEL_RANGE_RESPONSE => Response::AccelRange(body[0]),
            GYRO_RANGE_RESPONSE => Response::GyroRange(body[0]),
            MAG_GAIN_RESPONSE => Response::MagGain(body[0]),
            GSR_RANGE_RESPONSE => Response::GsrRange(body[0]),
            HW_VERSION_RESPONSE => Response::HardwareVersion(body[0]),
            BLINK_LED_RESPONSE => Response::BlinkLed(body[0]),
            BUFFER_SIZE_RESPONSE => Response::BufferSize(body[0]),
            MAG_SAMPLING_RATE_RESPONSE => Response::MagSamplingRate(body[0]),
            other => {
                let group = calibration_group_for(other).ok_or_else(|| {
                    ShimmerError::Configuration(format!("Unknown response type 0x{:02X}", other))
                })?;
                Response::Calibration {
                    group,
                    payload: body.to_vec(),
                }
            }
        };
        return Ok(Some((response, 1 + len)));
    }

    // Inquiry: header then one id per channel.
    let (rate_len, config_len) = if legacy { (1, 2) } else { (2, 4) };
    let header_len = rate_len + config_len + 2;
    if payload.len() < header_len {
        return Ok(None);
    }
    let n_channels = payload[rate_len + config_len] as usize;
    let total = header_len + n_channels;
    if payload.len() < total {
        return Ok(None);
    }
    let sampling_rate_hz = decode_sampling_rate(generation, &payload[..rate_len]);
    let (accel_range, config_bytes) = if legacy {
        (Some(payload[1]), vec![payload[2]])
    } else {
        (None, payload[rate_len..rate_len + config_len].to_vec())
    };
    let inquiry = InquiryResponse {
        sampling_rate_hz,
        accel_range,
        config_bytes,
        buffer_size: payload[rate_len + config_len + 1],
        channel_ids: payload[header_len..total].to_vec(),
    };
    Ok(Some((Response::Inquiry(inquiry), 1 + total)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_rate_encoding() {
        assert_eq!(encode_sampling_rate(HardwareGeneration::Shimmer2r, 51.2), vec![20]);
        assert_eq!(
            encode_sampling_rate(HardwareGeneration::Shimmer3, 51.2),
            640u16.to_le_bytes().to_vec()
        );
        // Clamped to one byte on legacy hardware.
        assert_eq!(encode_sampling_rate(HardwareGeneration::Shimmer2, 1.0), vec![255]);
        let rate = effective_sampling_rate(HardwareGeneration::Shimmer3, 512.0);
        assert!((rate - 512.0).abs() < 1e-9);
    }

    #[test]
    fn test_mid_stream_commands() {
        assert!(CommandKind::StopStreaming.allowed_while_streaming());
        assert!(CommandKind::ToggleLed.allowed_while_streaming());
        assert!(CommandKind::SetAccelRange(2).allowed_while_streaming());
        assert!(!CommandKind::SetSensors(0x80).allowed_while_streaming());
        assert!(!CommandKind::SetPmux(true).allowed_while_streaming());
        assert!(!CommandKind::StartStreaming.allowed_while_streaming());
        // A response would land in the frame stream.
        assert!(!CommandKind::Inquiry.allowed_while_streaming());
        assert!(!CommandKind::ReadGsrRange.allowed_while_streaming());
    }

    #[test]
    fn test_set_sensors_width_per_generation() {
        let cmd = CommandKind::SetSensors(0x80_00C0);
        assert_eq!(cmd.encode(HardwareGeneration::Shimmer2r), vec![0x08, 0xC0, 0x00]);
        assert_eq!(cmd.encode(HardwareGeneration::Shimmer3), vec![0x08, 0xC0, 0x00, 0x80]);
    }

    #[test]
    fn test_pending_command_timeouts() {
        let short = Duration::from_millis(2000);
        let long = Duration::from_millis(4000);
        let inquiry = PendingCommand::new(CommandKind::Inquiry, HardwareGeneration::Shimmer3, short, long);
        assert_eq!(inquiry.timeout, long);
        assert_eq!(inquiry.expects, Expectation::AckThenResponse(INQUIRY_RESPONSE));
        assert!(!inquiry.probe);

        let probe = PendingCommand::new(CommandKind::FirmwareProbe, HardwareGeneration::Shimmer2r, short, long);
        assert!(probe.probe);
        assert_eq!(probe.timeout, short);

        let led = PendingCommand::new(CommandKind::ToggleLed, HardwareGeneration::Shimmer3, short, long);
        assert_eq!(led.expects, Expectation::AckOnly);
        assert_eq!(led.bytes, vec![TOGGLE_LED_COMMAND]);
    }

    #[test]
    fn test_parse_incremental_firmware() {
        let full = [FW_VERSION_RESPONSE, 3, 0, 0, 0, 7, 2];
        for cut in 0..full.len() {
            assert_eq!(parse_response(HardwareGeneration::Shimmer3, &full[..cut]).unwrap(), None);
        }
        let (response, used) = parse_response(HardwareGeneration::Shimmer3, &full).unwrap().unwrap();
        assert_eq!(used, full.len());
        assert_eq!(
            response,
            Response::FirmwareVersion(FirmwareVersion { identifier: 3, major: 0, minor: 7, internal: 2 })
        );
    }

    #[test]
    fn test_parse_inquiry_shimmer3() {
        let mut bytes = vec![INQUIRY_RESPONSE, 0x80, 0x02, 0x04, 0x00, 0x20, 0x40, 3, 1];
        bytes.extend_from_slice(&[0x00, 0x01, 0x02]);
        let (response, used) = parse_response(HardwareGeneration::Shimmer3, &bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        let Response::Inquiry(inquiry) = response else {
            panic!("expected inquiry");
        };
        assert!((inquiry.sampling_rate_hz - 51.2).abs() < 1e-9);
        assert_eq!(inquiry.config_bytes, vec![0x04, 0x00, 0x20, 0x40]);
        assert_eq!(inquiry.channel_ids, vec![0x00, 0x01, 0x02]);
        assert_eq!(inquiry.accel_range, None);
    }

    #[test]
    fn test_parse_inquiry_legacy_partial() {
        let bytes = [INQUIRY_RESPONSE, 20, 1, 0x40, 2, 1, 0x00, 0x01];
        assert_eq!(
            parse_response(HardwareGeneration::Shimmer2r, &bytes[..7]).unwrap(),
            None
        );
        let (response, _) = parse_response(HardwareGeneration::Shimmer2r, &bytes).unwrap().unwrap();
        let Response::Inquiry(inquiry) = response else {
            panic!("expected inquiry");
        };
        assert_eq!(inquiry.accel_range, Some(1));
        assert_eq!(inquiry.config_bytes, vec![0x40]);
        assert_eq!(inquiry.channel_ids, vec![0x00, 0x01]);
    }

    #[test]
    fn test_parse_all_calibration_length() {
        let mut bytes = vec![ALL_CALIBRATION_RESPONSE];
        bytes.extend(vec![0xFF; 84]);
        assert!(parse_response(HardwareGeneration::Shimmer3, &bytes[..84]).unwrap().is_none());
        let (_, used) = parse_response(HardwareGeneration::Shimmer3, &bytes).unwrap().unwrap();
        assert_eq!(used, 85);
        let (_, used) = parse_response(HardwareGeneration::Shimmer2r, &bytes).unwrap().unwrap();
        assert_eq!(used, 76);
    }

    #[test]
    fn test_unknown_response_type() {
        assert!(parse_response(HardwareGeneration::Shimmer3, &[0x77, 1, 2]).is_err());
    }

    #[test]
    fn test_mag_rate_setting() {
        assert_eq!(mag_rate_setting(HardwareGeneration::Shimmer3, 51.2, false), 6);
        assert_eq!(mag_rate_setting(HardwareGeneration::Shimmer3, 51.2, true), 4);
        assert_eq!(mag_rate_setting(HardwareGeneration::Shimmer3, 1000.0, false), 7);
        assert_eq!(gyro_rate_setting(51.2, true), 0xFF);
        assert_eq!(gyro_rate_setting(51.2, false), 155);
    }
}
