//! Common types for the Shimmer driver

use std::fmt;

use sensor_types::SensorError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hardware generation of the connected device.
///
/// The same channel id, opcode payload width and timestamp clock mean
/// different things per generation, so almost every table is keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareGeneration {
    Shimmer2,
    Shimmer2r,
    Shimmer3,
}

impl HardwareGeneration {
    pub const ALL: [HardwareGeneration; 3] = [
        HardwareGeneration::Shimmer2,
        HardwareGeneration::Shimmer2r,
        HardwareGeneration::Shimmer3,
    ];

    /// Map the byte returned by the hardware-version query.
    pub fn from_hardware_id(id: u8) -> Option<Self> {
        match id {
            0 | 1 => Some(HardwareGeneration::Shimmer2),
            2 => Some(HardwareGeneration::Shimmer2r),
            3 => Some(HardwareGeneration::Shimmer3),
            _ => None,
        }
    }

    /// Frequency of the 16-bit free-running timestamp counter.
    pub fn tick_frequency_hz(self) -> f64 {
        match self {
            HardwareGeneration::Shimmer2 => 1024.0,
            HardwareGeneration::Shimmer2r | HardwareGeneration::Shimmer3 => 32768.0,
        }
    }

    /// Shimmer2 and Shimmer2r share ADC hardware between several sensors and
    /// use one-byte configuration fields.
    pub fn is_legacy(self) -> bool {
        !matches!(self, HardwareGeneration::Shimmer3)
    }
}

impl fmt::Display for HardwareGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HardwareGeneration::Shimmer2 => "Shimmer2",
            HardwareGeneration::Shimmer2r => "Shimmer2r",
            HardwareGeneration::Shimmer3 => "Shimmer3",
        };
        f.write_str(name)
    }
}

/// Accelerometer sub-mode. Smart modes route the wide-range accelerometer into
/// the primary accelerometer slots; dual modes stream both accelerometers.
///
/// The encoding (Shimmer3 config byte 3, bits 6-7) belongs to one firmware
/// revision and may not hold for others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccelSubMode {
    #[default]
    Standard,
    Smart,
    Dual,
    DualSmart,
}

impl AccelSubMode {
    pub const ALL: [AccelSubMode; 4] = [
        AccelSubMode::Standard,
        AccelSubMode::Smart,
        AccelSubMode::Dual,
        AccelSubMode::DualSmart,
    ];

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => AccelSubMode::Standard,
            1 => AccelSubMode::Smart,
            2 => AccelSubMode::Dual,
            _ => AccelSubMode::DualSmart,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            AccelSubMode::Standard => 0,
            AccelSubMode::Smart => 1,
            AccelSubMode::Dual => 2,
            AccelSubMode::DualSmart => 3,
        }
    }

    /// True when ids 0x00-0x02 carry the wide-range accelerometer.
    pub fn swaps_primary(self) -> bool {
        matches!(self, AccelSubMode::Smart | AccelSubMode::DualSmart)
    }
}

/// Sensors whose measurement range can be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    Accel,
    Gyro,
    Mag,
    Gsr,
}

/// Sensors with a low-power acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowPowerKind {
    Accel,
    Gyro,
    Mag,
}

/// Lifecycle state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
}

/// Firmware version reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub identifier: u16,
    pub major: u16,
    pub minor: u8,
    pub internal: u8,
}

impl FirmwareVersion {
    /// Assumed when the firmware probe goes unanswered: the oldest firmware
    /// does not implement the version query at all.
    pub fn legacy_baseline() -> Self {
        Self {
            identifier: 0,
            major: 0,
            minor: 1,
            internal: 0,
        }
    }

    /// Firmware newer than the baseline answers the hardware-version query.
    pub fn supports_hardware_query(&self) -> bool {
        (self.major, self.minor) > (0, 1)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (id {})",
            self.major, self.minor, self.internal, self.identifier
        )
    }
}

/// In-memory mirror of the device configuration, updated only when the
/// device acknowledges or reports a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub generation: Option<HardwareGeneration>,
    pub firmware: Option<FirmwareVersion>,
    pub sampling_rate_hz: f64,
    pub enabled_sensors: u32,
    pub accel_range: u8,
    pub gyro_range: u8,
    pub mag_gain: u8,
    pub gsr_range: u8,
    pub accel_sub_mode: AccelSubMode,
    pub accel_low_power: bool,
    pub gyro_low_power: bool,
    pub mag_low_power: bool,
    pub five_volt_regulator: bool,
    pub pmux: bool,
    pub internal_exp_power: bool,
    pub buffer_size: u8,
    pub blink_led: u8,
    pub orientation_fusion: bool,
    /// Config bytes exactly as the device last reported them. Bits the mirror
    /// does not model (internal sensor rates) are carried back unchanged.
    #[serde(default)]
    pub raw_config: Vec<u8>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            generation: None,
            firmware: None,
            sampling_rate_hz: 51.2,
            enabled_sensors: 0,
            accel_range: 0,
            gyro_range: 0,
            mag_gain: 1,
            gsr_range: 0,
            accel_sub_mode: AccelSubMode::Standard,
            accel_low_power: false,
            gyro_low_power: false,
            mag_low_power: false,
            five_volt_regulator: false,
            pmux: false,
            internal_exp_power: false,
            buffer_size: 1,
            blink_led: 0,
            orientation_fusion: false,
            raw_config: Vec::new(),
        }
    }
}

impl DeviceSettings {
    /// Decode configuration bytes as reported by an inquiry or config-bytes
    /// response.
    ///
    /// Shimmer2/2r: byte 0 bit 7 = 5 V regulator, bit 6 = PMUX, bits 1-3 = GSR
    /// range. Shimmer3: byte 0 bits 2-3 = wide-range accel range, bit 1 = accel
    /// low power; byte 2 bits 5-7 = mag gain, bits 0-1 = gyro range; byte 3
    /// bits 6-7 = accel sub-mode, bits 1-3 = GSR range, bit 0 = internal
    /// expansion power.
    pub fn apply_config_bytes(&mut self, generation: HardwareGeneration, bytes: &[u8]) {
        if generation.is_legacy() {
            if let Some(&b0) = bytes.first() {
                self.raw_config = vec![b0];
                self.five_volt_regulator = b0 & 0x80 != 0;
                self.pmux = b0 & 0x40 != 0;
                self.gsr_range = (b0 >> 1) & 0x07;
            }
            return;
        }
        if bytes.len() < 4 {
            return;
        }
        self.raw_config = bytes[..4].to_vec();
        self.accel_range = (bytes[0] >> 2) & 0x03;
        self.accel_low_power = bytes[0] & 0x02 != 0;
        self.mag_gain = (bytes[2] >> 5) & 0x07;
        self.gyro_range = bytes[2] & 0x03;
        self.accel_sub_mode = AccelSubMode::from_bits(bytes[3] >> 6);
        self.gsr_range = (bytes[3] >> 1) & 0x07;
        self.internal_exp_power = bytes[3] & 0x01 != 0;
    }

    /// Encode the settings back into configuration bytes for a set-config
    /// command. Starts from the last reported bytes and rewrites only the
    /// fields decoded by [`apply_config_bytes`](Self::apply_config_bytes).
    pub fn config_bytes(&self, generation: HardwareGeneration) -> Vec<u8> {
        let len = if generation.is_legacy() { 1 } else { 4 };
        let mut bytes = if self.raw_config.len() == len {
            self.raw_config.clone()
        } else {
            vec![0; len]
        };
        if generation.is_legacy() {
            let mut b0 = bytes[0] & !0xCE;
            b0 |= (self.gsr_range & 0x07) << 1;
            if self.five_volt_regulator {
                b0 |= 0x80;
            }
            if self.pmux {
                b0 |= 0x40;
            }
            bytes[0] = b0;
            return bytes;
        }
        let mut b0 = (bytes[0] & !0x0E) | ((self.accel_range & 0x03) << 2);
        if self.accel_low_power {
            b0 |= 0x02;
        }
        let b2 = (bytes[2] & !0xE3) | ((self.mag_gain & 0x07) << 5) | (self.gyro_range & 0x03);
        let mut b3 = (bytes[3] & !0xCF) | (self.accel_sub_mode.bits() << 6) | ((self.gsr_range & 0x07) << 1);
        if self.internal_exp_power {
            b3 |= 0x01;
        }
        bytes[0] = b0;
        bytes[2] = b2;
        bytes[3] = b3;
        bytes
    }
}

/// Counters describing the health of a streaming session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_decoded: u64,
    pub packets_lost: u64,
    pub reception_rate: f64,
    pub resyncs: u64,
    pub dropped_frames: u64,
    pub schema_mismatches: u64,
}

/// Errors that can occur in the Shimmer driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShimmerError {
    /// Transport I/O failure; always fatal to the session.
    #[error("Transport error: {0}")]
    Transport(String),
    /// A command went unanswered.
    #[error("Protocol timeout waiting on opcode 0x{opcode:02X}")]
    ProtocolTimeout { opcode: u8 },
    /// A requested sensor combination shares hardware.
    #[error("Sensor conflict for bitmap 0x{requested:06X}: {reason}")]
    SensorConflict { requested: u32, reason: String },
    /// Frame length disagrees with the live packet schema.
    #[error("Schema mismatch: expected {expected} bytes, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },
    /// A channel id has no meaning for the hardware generation.
    #[error("Unknown channel id 0x{channel_id:02X} for {generation}")]
    UnknownChannel {
        generation: HardwareGeneration,
        channel_id: u8,
    },
    /// Defaults are being used for a calibration group.
    #[error("Calibration unavailable: {0}")]
    CalibrationUnavailable(String),
    /// A calibration matrix cannot be inverted.
    #[error("Calibration matrix is singular")]
    SingularMatrix,
    /// The operation is not valid in the current session state.
    #[error("Invalid state: expected {expected}, session is {actual:?}")]
    InvalidState {
        expected: &'static str,
        actual: SessionState,
    },
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ShimmerError {
    fn from(err: std::io::Error) -> Self {
        ShimmerError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ShimmerError {
    fn from(err: serde_json::Error) -> Self {
        ShimmerError::Configuration(err.to_string())
    }
}

impl From<ShimmerError> for SensorError {
    fn from(err: ShimmerError) -> Self {
        match err {
            ShimmerError::Transport(_) | ShimmerError::Io(_) => {
                SensorError::Transport(err.to_string())
            }
            ShimmerError::ProtocolTimeout { .. } => SensorError::Timeout(err.to_string()),
            ShimmerError::SensorConflict { .. } | ShimmerError::Configuration(_) => {
                SensorError::Rejected(err.to_string())
            }
            ShimmerError::InvalidState { .. } => SensorError::InvalidState(err.to_string()),
            _ => SensorError::DriverError(err.to_string()),
        }
    }
}
