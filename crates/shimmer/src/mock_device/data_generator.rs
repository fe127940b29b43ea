use std::f64::consts::PI;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::schema::{ByteOrder, ChannelDescriptor, ChannelEncoding, ChannelRole};
use crate::types::HardwareGeneration;

/// Synthesises plausible raw channel values: a slow sinusoid per sensor plus
/// gaussian noise, centred where the default calibration puts zero.
pub struct SignalGenerator {
    generation: HardwareGeneration,
    rng: StdRng,
}

/// Noise deviation in LSBs, like a real ADC at rest.
const NOISE_STD: f64 = 2.0;

impl SignalGenerator {
    pub fn new(generation: HardwareGeneration, seed: u64) -> Self {
        Self {
            generation,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn noise(&mut self) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        z * NOISE_STD
    }

    /// Raw value for `role` at `t_secs` since streaming started.
    pub fn raw_value(&mut self, role: ChannelRole, t_secs: f64) -> i32 {
        let legacy = self.generation.is_legacy();
        let wave = |freq: f64, phase: f64| (2.0 * PI * freq * t_secs + phase).sin();
        let value = match role {
            ChannelRole::Accel(axis) => {
                // Gravity on Z, slow sway on X and Y.
                let centre = if legacy { 2048.0 } else { 2047.0 };
                let gravity = if axis.index() == 2 { -83.0 } else { 0.0 };
                centre + gravity + 40.0 * wave(0.5, axis.index() as f64)
            }
            ChannelRole::WideRangeAccel(axis) => {
                let gravity = if axis.index() == 2 { 1631.0 } else { 0.0 };
                gravity + 200.0 * wave(0.5, axis.index() as f64)
            }
            ChannelRole::Gyro(axis) => {
                let centre = if legacy { 1843.0 } else { 0.0 };
                centre + 30.0 * wave(0.25, axis.index() as f64)
            }
            ChannelRole::Mag(axis) => 300.0 * wave(0.1, axis.index() as f64 * PI / 3.0),
            ChannelRole::EcgRaLl | ChannelRole::EcgLaLl => {
                // Crude QRS: a narrow spike once a second.
                let beat = (t_secs % 1.0) < 0.04;
                2060.0 + if beat { 600.0 } else { 20.0 * wave(1.0, 0.0) }
            }
            ChannelRole::Emg => 2060.0 + 150.0 * wave(40.0, 0.0),
            // Twelve bits only; the top bits carry the range and stay clear.
            ChannelRole::Gsr => 2000.0 + 500.0 * wave(0.05, 0.0),
            ChannelRole::Adc { .. } => 2048.0 + 1000.0 * wave(0.2, 0.0),
            ChannelRole::StrainHigh | ChannelRole::StrainLow => 2048.0 + 100.0 * wave(0.3, 0.0),
            ChannelRole::Exg16 => 4000.0 * wave(1.0, 0.0),
            ChannelRole::HeartRate => 72.0,
            ChannelRole::Raw => 0.0,
        };
        let noisy = match role {
            ChannelRole::HeartRate | ChannelRole::Raw => value,
            _ => value + self.noise(),
        };
        trace!("{:?} at t={:.3}s -> {:.1}", role, t_secs, noisy);
        noisy.round() as i32
    }

    /// Append one frame payload (timestamp, then every channel).
    pub fn frame_payload(&mut self, channels: &[ChannelDescriptor], timestamp: u16, t_secs: f64, out: &mut Vec<u8>) {
        out.extend_from_slice(&timestamp.to_le_bytes());
        for channel in channels {
            let value = self.raw_value(channel.role, t_secs);
            let value = match channel.role {
                ChannelRole::Gsr => value.clamp(0, 0x0FFF),
                _ => value,
            };
            encode_value(channel.encoding, value, out);
        }
    }
}

/// Encode `value`, clamped to what the encoding can carry.
pub fn encode_value(encoding: ChannelEncoding, value: i32, out: &mut Vec<u8>) {
    match (encoding.width, encoding.signed) {
        (1, false) => out.push(value.clamp(0, u8::MAX as i32) as u8),
        (1, true) => out.push(value.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8),
        (_, signed) => {
            let word = if signed {
                value.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16
            } else {
                value.clamp(0, u16::MAX as i32) as u16
            };
            match encoding.order {
                ByteOrder::Little => out.extend_from_slice(&word.to_le_bytes()),
                ByteOrder::Big => out.extend_from_slice(&word.to_be_bytes()),
            }
        }
    }
}

/// One 21-byte inertial calibration block: offset and sensitivity as
/// big-endian i16, alignment as i8 hundredths.
pub fn inertial_block(offset: [i16; 3], sensitivity: [i16; 3], alignment: [i8; 9]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(21);
    for word in offset.iter().chain(sensitivity.iter()) {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes.extend(alignment.iter().map(|&a| a as u8));
    bytes
}

/// What a factory-calibrated device reports for the all-calibration dump.
pub fn stored_calibration(generation: HardwareGeneration) -> Vec<u8> {
    const IDENTITY: [i8; 9] = [100, 0, 0, 0, 100, 0, 0, 0, 100];
    const S3_AXES: [i8; 9] = [0, -100, 0, -100, 0, 0, 0, 0, -100];
    if generation.is_legacy() {
        let mut bytes = inertial_block([2048; 3], [101; 3], [-100, 0, 0, 0, -100, 0, 0, 0, 100]);
        bytes.extend(inertial_block([1843; 3], [273; 3], [0, -100, 0, -100, 0, 0, 0, 0, -100]));
        bytes.extend(inertial_block([0; 3], [580; 3], IDENTITY));
        // EMG offset 2060, gain 750.
        bytes.extend([0x08, 0x0C, 0x02, 0xEE]);
        // ECG RA-LL and LA-LL.
        bytes.extend([0x08, 0x0C, 0x00, 0xAF, 0x08, 0x0C, 0x00, 0xAF]);
        bytes
    } else {
        let mut bytes = inertial_block([2047; 3], [83; 3], S3_AXES);
        bytes.extend(inertial_block([0; 3], [6550; 3], S3_AXES));
        bytes.extend(inertial_block([0; 3], [1100, 1100, 980], [-100, 0, 0, 0, 100, 0, 0, 0, -100]));
        bytes.extend(inertial_block([0; 3], [1631; 3], [-100, 0, 0, 0, 100, 0, 0, 0, -100]));
        bytes
    }
}
