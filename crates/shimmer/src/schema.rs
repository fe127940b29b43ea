//! Packet schema derivation.
//!
//! The device reports the active channels as a list of one-byte ids. What an
//! id means depends on the hardware generation, the accelerometer sub-mode and
//! (on Shimmer2r) the PMUX bit, so the mapping lives in one table built at
//! first use and keyed on all three.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::sensors;
use crate::types::{AccelSubMode, HardwareGeneration, ShimmerError};

/// Bytes in the timestamp field leading every frame.
pub const TIMESTAMP_BYTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// How one channel sits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEncoding {
    pub width: usize,
    pub signed: bool,
    pub order: ByteOrder,
}

impl ChannelEncoding {
    pub const U8: ChannelEncoding = ChannelEncoding { width: 1, signed: false, order: ByteOrder::Little };
    pub const U16_LE: ChannelEncoding = ChannelEncoding { width: 2, signed: false, order: ByteOrder::Little };
    pub const I16_LE: ChannelEncoding = ChannelEncoding { width: 2, signed: true, order: ByteOrder::Little };
    pub const I16_BE: ChannelEncoding = ChannelEncoding { width: 2, signed: true, order: ByteOrder::Big };

    /// Decode `bytes`, which must be exactly `width` long.
    pub fn decode(&self, bytes: &[u8]) -> i32 {
        match (self.width, self.signed) {
            (1, false) => bytes[0] as i32,
            (1, true) => bytes[0] as i8 as i32,
            (_, signed) => {
                let pair = [bytes[0], bytes[1]];
                let unsigned = match self.order {
                    ByteOrder::Little => u16::from_le_bytes(pair),
                    ByteOrder::Big => u16::from_be_bytes(pair),
                };
                if signed {
                    unsigned as i16 as i32
                } else {
                    unsigned as i32
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

/// Which calibration a channel goes through.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelRole {
    /// Low-noise (or the only) accelerometer.
    Accel(Axis),
    WideRangeAccel(Axis),
    Gyro(Axis),
    Mag(Axis),
    EcgRaLl,
    EcgLaLl,
    Emg,
    Gsr,
    /// 12-bit ADC scaled to mV, then multiplied by `divider`.
    Adc { divider: f64 },
    StrainHigh,
    StrainLow,
    Exg16,
    HeartRate,
    /// Passed through uncalibrated.
    Raw,
}

/// One channel in the live packet schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub name: &'static str,
    pub encoding: ChannelEncoding,
    pub role: ChannelRole,
    /// Enabled-sensor bit that makes the device stream this channel; 0 when
    /// it cannot be selected directly.
    pub sensor_bit: u32,
}

/// Everything besides the channel id that changes what an id means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaContext {
    pub generation: HardwareGeneration,
    pub accel_mode: AccelSubMode,
    pub pmux: bool,
}

impl SchemaContext {
    pub fn new(generation: HardwareGeneration) -> Self {
        Self {
            generation,
            accel_mode: AccelSubMode::Standard,
            pmux: false,
        }
    }

    /// Collapse fields the generation ignores so table lookups hit.
    fn normalized(self) -> Self {
        match self.generation {
            HardwareGeneration::Shimmer3 => Self { pmux: false, ..self },
            HardwareGeneration::Shimmer2 => Self {
                accel_mode: AccelSubMode::Standard,
                pmux: false,
                ..self
            },
            HardwareGeneration::Shimmer2r => Self {
                accel_mode: AccelSubMode::Standard,
                ..self
            },
        }
    }
}

type Row = (u8, &'static str, ChannelEncoding, ChannelRole, u32);

fn legacy_rows() -> Vec<Row> {
    use ChannelEncoding as E;
    use ChannelRole as R;
    vec![
        (0x00, "Accelerometer X", E::U16_LE, R::Accel(Axis::X), sensors::LEGACY_ACCEL),
        (0x01, "Accelerometer Y", E::U16_LE, R::Accel(Axis::Y), sensors::LEGACY_ACCEL),
        (0x02, "Accelerometer Z", E::U16_LE, R::Accel(Axis::Z), sensors::LEGACY_ACCEL),
        (0x03, "Gyroscope X", E::U16_LE, R::Gyro(Axis::X), sensors::LEGACY_GYRO),
        (0x04, "Gyroscope Y", E::U16_LE, R::Gyro(Axis::Y), sensors::LEGACY_GYRO),
        (0x05, "Gyroscope Z", E::U16_LE, R::Gyro(Axis::Z), sensors::LEGACY_GYRO),
        (0x06, "Magnetometer X", E::I16_LE, R::Mag(Axis::X), sensors::LEGACY_MAG),
        (0x07, "Magnetometer Y", E::I16_LE, R::Mag(Axis::Y), sensors::LEGACY_MAG),
        (0x08, "Magnetometer Z", E::I16_LE, R::Mag(Axis::Z), sensors::LEGACY_MAG),
        (0x09, "ECG RA-LL", E::U16_LE, R::EcgRaLl, sensors::LEGACY_ECG),
        (0x0A, "ECG LA-LL", E::U16_LE, R::EcgLaLl, sensors::LEGACY_ECG),
        (0x0B, "GSR", E::U16_LE, R::Gsr, sensors::LEGACY_GSR),
        (0x0C, "GSR Res", E::U16_LE, R::Raw, 0),
        (0x0D, "EMG", E::U16_LE, R::Emg, sensors::LEGACY_EMG),
        (0x0E, "Expansion A0", E::U16_LE, R::Adc { divider: 1.0 }, sensors::LEGACY_EXP_A0),
        (0x0F, "Expansion A7", E::U16_LE, R::Adc { divider: 1.0 }, sensors::LEGACY_EXP_A7),
        (0x10, "Strain Gauge High", E::U16_LE, R::StrainHigh, sensors::LEGACY_STRAIN),
        (0x11, "Strain Gauge Low", E::U16_LE, R::StrainLow, sensors::LEGACY_STRAIN),
        (0x12, "Heart Rate", E::U8, R::HeartRate, sensors::LEGACY_HEART_RATE),
    ]
}

fn shimmer3_rows() -> Vec<Row> {
    use ChannelEncoding as E;
    use ChannelRole as R;
    let adc = R::Adc { divider: 1.0 };
    vec![
        (0x00, "Low Noise Accelerometer X", E::U16_LE, R::Accel(Axis::X), sensors::S3_LN_ACCEL),
        (0x01, "Low Noise Accelerometer Y", E::U16_LE, R::Accel(Axis::Y), sensors::S3_LN_ACCEL),
        (0x02, "Low Noise Accelerometer Z", E::U16_LE, R::Accel(Axis::Z), sensors::S3_LN_ACCEL),
        (0x03, "Battery", E::U16_LE, R::Adc { divider: 1.988 }, sensors::S3_VBATT),
        (0x04, "Wide Range Accelerometer X", E::I16_LE, R::WideRangeAccel(Axis::X), sensors::S3_WR_ACCEL),
        (0x05, "Wide Range Accelerometer Y", E::I16_LE, R::WideRangeAccel(Axis::Y), sensors::S3_WR_ACCEL),
        (0x06, "Wide Range Accelerometer Z", E::I16_LE, R::WideRangeAccel(Axis::Z), sensors::S3_WR_ACCEL),
        (0x07, "Magnetometer X", E::I16_BE, R::Mag(Axis::X), sensors::S3_MAG),
        (0x08, "Magnetometer Y", E::I16_BE, R::Mag(Axis::Y), sensors::S3_MAG),
        (0x09, "Magnetometer Z", E::I16_BE, R::Mag(Axis::Z), sensors::S3_MAG),
        (0x0A, "Gyroscope X", E::I16_BE, R::Gyro(Axis::X), sensors::S3_GYRO),
        (0x0B, "Gyroscope Y", E::I16_BE, R::Gyro(Axis::Y), sensors::S3_GYRO),
        (0x0C, "Gyroscope Z", E::I16_BE, R::Gyro(Axis::Z), sensors::S3_GYRO),
        (0x0D, "External ADC A7", E::U16_LE, adc, sensors::S3_EXT_A7),
        (0x0E, "External ADC A6", E::U16_LE, adc, sensors::S3_EXT_A6),
        (0x0F, "External ADC A15", E::U16_LE, adc, sensors::S3_EXT_A15),
        (0x10, "Internal ADC A1", E::U16_LE, adc, sensors::S3_INT_A1),
        (0x11, "Internal ADC A12", E::U16_LE, adc, sensors::S3_INT_A12),
        (0x12, "Internal ADC A13", E::U16_LE, adc, sensors::S3_INT_A13),
        (0x13, "Internal ADC A14", E::U16_LE, adc, sensors::S3_INT_A14),
        (0x1C, "GSR", E::U16_LE, R::Gsr, sensors::S3_GSR),
        (0x1D, "EXG1 Status", E::U8, R::Raw, sensors::S3_EXG1_16BIT),
        (0x20, "EXG2 Status", E::U8, R::Raw, sensors::S3_EXG2_16BIT),
        (0x23, "EXG1 CH1 16Bit", E::I16_BE, R::Exg16, sensors::S3_EXG1_16BIT),
        (0x24, "EXG1 CH2 16Bit", E::I16_BE, R::Exg16, sensors::S3_EXG1_16BIT),
        (0x25, "EXG2 CH1 16Bit", E::I16_BE, R::Exg16, sensors::S3_EXG2_16BIT),
        (0x26, "EXG2 CH2 16Bit", E::I16_BE, R::Exg16, sensors::S3_EXG2_16BIT),
        (0x27, "Bridge Amplifier High", E::U16_LE, R::StrainHigh, sensors::S3_BRIDGE_AMP),
        (0x28, "Bridge Amplifier Low", E::U16_LE, R::StrainLow, sensors::S3_BRIDGE_AMP),
    ]
}

/// Channel ids of a generation in wire order.
pub fn channel_ids(generation: HardwareGeneration) -> Vec<u8> {
    let rows = if generation.is_legacy() { legacy_rows() } else { shimmer3_rows() };
    rows.into_iter().map(|row| row.0).collect()
}

fn contexts() -> Vec<SchemaContext> {
    let mut all = Vec::new();
    for generation in HardwareGeneration::ALL {
        for accel_mode in AccelSubMode::ALL {
            for pmux in [false, true] {
                let ctx = SchemaContext { generation, accel_mode, pmux };
                if ctx.normalized() == ctx {
                    all.push(ctx);
                }
            }
        }
    }
    all
}

fn rows_for(ctx: SchemaContext) -> Vec<Row> {
    let mut rows = if ctx.generation.is_legacy() { legacy_rows() } else { shimmer3_rows() };
    if ctx.generation == HardwareGeneration::Shimmer2r && ctx.pmux {
        for row in rows.iter_mut() {
            match row.0 {
                0x0E => {
                    row.1 = "VSenseReg";
                    row.3 = ChannelRole::Adc { divider: 1.988 };
                    row.4 = sensors::LEGACY_BATTERY;
                }
                0x0F => {
                    row.1 = "VSenseBatt";
                    row.3 = ChannelRole::Adc { divider: 1.988 };
                    row.4 = sensors::LEGACY_BATTERY;
                }
                _ => {}
            }
        }
    }
    if ctx.generation == HardwareGeneration::Shimmer3 && ctx.accel_mode.swaps_primary() {
        // Smart modes put the wide-range accelerometer in the primary slots.
        let primary: Vec<Row> = rows.iter().filter(|r| r.0 <= 0x02).cloned().collect();
        let wide: Vec<Row> = rows.iter().filter(|r| (0x04..=0x06).contains(&r.0)).cloned().collect();
        for row in rows.iter_mut() {
            if row.0 <= 0x02 {
                let w = wide[row.0 as usize];
                *row = (row.0, w.1, w.2, w.3, w.4);
            } else if (0x04..=0x06).contains(&row.0) {
                let p = primary[(row.0 - 0x04) as usize];
                *row = (row.0, p.1, p.2, p.3, p.4);
            }
        }
    }
    rows
}

static CHANNEL_TABLE: Lazy<HashMap<(SchemaContext, u8), ChannelDescriptor>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for ctx in contexts() {
        for (id, name, encoding, role, sensor_bit) in rows_for(ctx) {
            table.insert(
                (ctx, id),
                ChannelDescriptor { id, name, encoding, role, sensor_bit },
            );
        }
    }
    table
});

/// Look up what `id` means in `ctx`.
pub fn descriptor(ctx: SchemaContext, id: u8) -> Result<ChannelDescriptor, ShimmerError> {
    CHANNEL_TABLE
        .get(&(ctx.normalized(), id))
        .copied()
        .ok_or(ShimmerError::UnknownChannel {
            generation: ctx.generation,
            channel_id: id,
        })
}

/// Check that every context has a descriptor for every id of its generation
/// and that every width is supported.
pub fn validate_channel_table() -> Result<(), ShimmerError> {
    for ctx in contexts() {
        for id in channel_ids(ctx.generation) {
            let desc = descriptor(ctx, id)?;
            if !matches!(desc.encoding.width, 1 | 2) {
                return Err(ShimmerError::Configuration(format!(
                    "Channel 0x{:02X} has unsupported width {}",
                    id, desc.encoding.width
                )));
            }
            if desc.name.is_empty() {
                return Err(ShimmerError::Configuration(format!(
                    "Channel 0x{:02X} has no name",
                    id
                )));
            }
        }
    }
    Ok(())
}

/// Ordered channel ids the device streams for an enabled-sensor bitmap.
pub fn channels_for_sensors(ctx: SchemaContext, bitmap: u32) -> Vec<u8> {
    channel_ids(ctx.generation)
        .into_iter()
        .filter(|&id| {
            descriptor(ctx, id)
                .map(|d| d.sensor_bit != 0 && bitmap & d.sensor_bit != 0)
                .unwrap_or(false)
        })
        .collect()
}

/// Raw values of one frame, in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub timestamp: u16,
    pub values: Vec<i32>,
}

/// The live frame layout. Replaced wholesale on reconfiguration.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSchema {
    pub context: SchemaContext,
    pub channels: Vec<ChannelDescriptor>,
    pub frame_size: usize,
}

impl PacketSchema {
    /// Derive a schema from the channel ids reported by the device.
    pub fn build(context: SchemaContext, ids: &[u8]) -> Result<Self, ShimmerError> {
        let channels = ids
            .iter()
            .map(|&id| descriptor(context, id))
            .collect::<Result<Vec<_>, _>>()?;
        let frame_size = TIMESTAMP_BYTES + channels.iter().map(|c| c.encoding.width).sum::<usize>();
        Ok(Self { context, channels, frame_size })
    }

    /// A schema with only the timestamp.
    pub fn empty(context: SchemaContext) -> Self {
        Self {
            context,
            channels: Vec::new(),
            frame_size: TIMESTAMP_BYTES,
        }
    }

    /// Enabled-sensor bitmap implied by the channels present.
    pub fn sensor_bitmap(&self) -> u32 {
        self.channels.iter().fold(0, |acc, c| acc | c.sensor_bit)
    }

    pub fn channel_ids(&self) -> Vec<u8> {
        self.channels.iter().map(|c| c.id).collect()
    }

    pub fn has_role(&self, predicate: impl Fn(ChannelRole) -> bool) -> bool {
        self.channels.iter().any(|c| predicate(c.role))
    }

    /// Decode a frame without its leading packet-type byte.
    pub fn decode(&self, frame: &[u8]) -> Result<RawFrame, ShimmerError> {
        if frame.len() != self.frame_size {
            return Err(ShimmerError::SchemaMismatch {
                expected: self.frame_size,
                actual: frame.len(),
            });
        }
        let timestamp = u16::from_le_bytes([frame[0], frame[1]]);
        let mut offset = TIMESTAMP_BYTES;
        let mut values = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let width = channel.encoding.width;
            values.push(channel.encoding.decode(&frame[offset..offset + width]));
            offset += width;
        }
        Ok(RawFrame { timestamp, values })
    }
}
