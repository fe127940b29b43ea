//! Calibration profiles and their defaults.
//!
//! Profiles are plain values. The engine holds them behind an `Arc` and swaps
//! the whole set when anything changes, so a frame is always decoded against
//! one consistent snapshot.

pub mod engine;
pub mod timestamp;

pub use engine::{CalibrationEngine, GyroOnTheFly};
pub use timestamp::{TimestampCalibrator, TimestampSample};

use crate::protocol::{CalibrationGroup, ECG_CALIBRATION_LEN, EMG_CALIBRATION_LEN, INERTIAL_CALIBRATION_LEN};
use crate::types::{DeviceSettings, HardwareGeneration, ShimmerError};

pub type Vector3 = [f64; 3];

/// Reference voltage of the 12-bit ADC, mV.
pub const ADC_VREF_MV: f64 = 3000.0;
pub const ADC_FULL_SCALE: f64 = 4095.0;
pub const BATTERY_DIVIDER: f64 = 1.988;
pub const EXG_VREF_MV: f64 = 2420.0;
pub const EXG_GAIN: f64 = 6.0;
pub const EXG_FULL_SCALE: f64 = 32767.0;

/// Determinants below this are treated as singular.
const SINGULAR_EPSILON: f64 = 1e-12;

/// A 3x3 matrix, row major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix3(pub [[f64; 3]; 3]);

impl Matrix3 {
    pub const IDENTITY: Matrix3 = Matrix3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    pub fn diagonal(d: Vector3) -> Self {
        Matrix3([[d[0], 0.0, 0.0], [0.0, d[1], 0.0], [0.0, 0.0, d[2]]])
    }

    pub fn determinant(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Closed-form inverse via the adjugate.
    pub fn inverse(&self) -> Result<Matrix3, ShimmerError> {
        let det = self.determinant();
        if det.abs() < SINGULAR_EPSILON || !det.is_finite() {
            return Err(ShimmerError::SingularMatrix);
        }
        let m = &self.0;
        let cof = |r0: usize, r1: usize, c0: usize, c1: usize| m[r0][c0] * m[r1][c1] - m[r0][c1] * m[r1][c0];
        let adj = [
            [cof(1, 2, 1, 2), -cof(0, 2, 1, 2), cof(0, 1, 1, 2)],
            [-cof(1, 2, 0, 2), cof(0, 2, 0, 2), -cof(0, 1, 0, 2)],
            [cof(1, 2, 0, 1), -cof(0, 2, 0, 1), cof(0, 1, 0, 1)],
        ];
        let mut out = [[0.0; 3]; 3];
        for (r, row) in adj.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                out[r][c] = v / det;
            }
        }
        Ok(Matrix3(out))
    }

    pub fn mul(&self, other: &Matrix3) -> Matrix3 {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.0[r][k] * other.0[k][c]).sum();
            }
        }
        Matrix3(out)
    }

    pub fn mul_vec(&self, v: Vector3) -> Vector3 {
        let mut out = [0.0; 3];
        for (r, cell) in out.iter_mut().enumerate() {
            *cell = (0..3).map(|k| self.0[r][k] * v[k]).sum();
        }
        out
    }
}

/// Alignment, sensitivity and offset of a three-axis sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialProfile {
    pub alignment: Matrix3,
    pub sensitivity: Matrix3,
    pub offset: Vector3,
    pub is_default: bool,
}

impl InertialProfile {
    pub fn new(alignment: Matrix3, sensitivity: Vector3, offset: Vector3) -> Self {
        Self {
            alignment,
            sensitivity: Matrix3::diagonal(sensitivity),
            offset,
            is_default: false,
        }
    }

    fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Precompute `A⁻¹·S⁻¹` for per-frame use.
    pub fn compile(&self) -> Result<InertialCalibrator, ShimmerError> {
        let a_inv = self.alignment.inverse()?;
        let s_inv = self.sensitivity.inverse()?;
        Ok(InertialCalibrator {
            matrix: a_inv.mul(&s_inv),
            offset: self.offset,
            is_default: self.is_default,
        })
    }

    /// `A⁻¹·S⁻¹·(raw − o)`
    pub fn calibrate(&self, raw: Vector3) -> Result<Vector3, ShimmerError> {
        Ok(self.compile()?.apply(raw))
    }

    /// Inverse of `calibrate`: `S·A·cal + o`.
    pub fn uncalibrate(&self, calibrated: Vector3) -> Vector3 {
        let v = self.sensitivity.mul(&self.alignment).mul_vec(calibrated);
        [v[0] + self.offset[0], v[1] + self.offset[1], v[2] + self.offset[2]]
    }

    /// Parse a 21-byte block: offset 3×i16 BE, sensitivity 3×i16 BE, alignment
    /// 9×i8 scaled by 1/100. Returns `None` for the "nothing stored" sentinel.
    pub fn from_payload(bytes: &[u8], sensitivity_scale: f64) -> Option<Self> {
        if bytes.len() < INERTIAL_CALIBRATION_LEN || is_unset(&bytes[..INERTIAL_CALIBRATION_LEN]) {
            return None;
        }
        let word = |i: usize| i16::from_be_bytes([bytes[2 * i], bytes[2 * i + 1]]) as f64;
        let offset = [word(0), word(1), word(2)];
        let sensitivity = [
            word(3) / sensitivity_scale,
            word(4) / sensitivity_scale,
            word(5) / sensitivity_scale,
        ];
        let mut alignment = [[0.0; 3]; 3];
        for (i, cell) in alignment.iter_mut().flatten().enumerate() {
            *cell = bytes[12 + i] as i8 as f64 / 100.0;
        }
        Some(Self::new(Matrix3(alignment), sensitivity, offset))
    }
}

/// A compiled inertial profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InertialCalibrator {
    pub matrix: Matrix3,
    pub offset: Vector3,
    pub is_default: bool,
}

impl InertialCalibrator {
    pub fn apply(&self, raw: Vector3) -> Vector3 {
        self.matrix.mul_vec([
            raw[0] - self.offset[0],
            raw[1] - self.offset[1],
            raw[2] - self.offset[2],
        ])
    }
}

/// Offset and gain of a one-dimensional ADC channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearProfile {
    pub offset: f64,
    pub gain: f64,
    pub is_default: bool,
}

impl LinearProfile {
    pub fn new(offset: f64, gain: f64) -> Self {
        Self { offset, gain, is_default: false }
    }

    fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// `(raw − offset) · ((vref / gain) / full_scale)`
    pub fn calibrate(&self, raw: f64, vref_mv: f64, full_scale: f64) -> f64 {
        calibrate_adc(raw, self.offset, vref_mv, self.gain, full_scale)
    }
}

pub fn calibrate_adc(raw: f64, offset: f64, vref_mv: f64, gain: f64, full_scale: f64) -> f64 {
    (raw - offset) * ((vref_mv / gain) / full_scale)
}

/// True when every byte is 0xFF: the device has nothing stored.
pub fn is_unset(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

fn parse_linear_pair(bytes: &[u8]) -> Option<LinearProfile> {
    if bytes.len() < 4 || is_unset(&bytes[..4]) {
        return None;
    }
    let offset = u16::from_be_bytes([bytes[0], bytes[1]]) as f64;
    let gain = u16::from_be_bytes([bytes[2], bytes[3]]) as f64;
    Some(LinearProfile::new(offset, gain))
}

// Default tables. Each call builds a fresh value.

const LEGACY_ACCEL_ALIGNMENT: Matrix3 = Matrix3([[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]]);
const LEGACY_GYRO_ALIGNMENT: Matrix3 = Matrix3([[0.0, -1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]);
const LEGACY_MAG_ALIGNMENT: Matrix3 = Matrix3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]]);
const S3_LN_ACCEL_ALIGNMENT: Matrix3 = Matrix3([[0.0, -1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]);
const S3_WR_ACCEL_ALIGNMENT: Matrix3 = Matrix3([[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]]);
const S3_GYRO_ALIGNMENT: Matrix3 = Matrix3([[0.0, -1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]);
const S3_MAG_ALIGNMENT: Matrix3 = S3_WR_ACCEL_ALIGNMENT;

/// Default primary accelerometer profile for a range setting.
pub fn default_accel(generation: HardwareGeneration, range: u8) -> InertialProfile {
    if generation.is_legacy() {
        let sensitivity = match range {
            0 => 101.0,
            1 => 76.0,
            2 => 38.0,
            _ => 25.0,
        };
        InertialProfile::new(LEGACY_ACCEL_ALIGNMENT, [sensitivity; 3], [2048.0; 3]).as_default()
    } else {
        InertialProfile::new(S3_LN_ACCEL_ALIGNMENT, [83.0; 3], [2047.0; 3]).as_default()
    }
}

/// Default wide-range accelerometer profile (Shimmer3).
pub fn default_wide_range_accel(range: u8) -> InertialProfile {
    let sensitivity = match range {
        0 => 1631.0,
        1 => 815.0,
        2 => 408.0,
        _ => 135.0,
    };
    InertialProfile::new(S3_WR_ACCEL_ALIGNMENT, [sensitivity; 3], [0.0; 3]).as_default()
}

pub fn default_gyro(generation: HardwareGeneration, range: u8) -> InertialProfile {
    if generation.is_legacy() {
        InertialProfile::new(LEGACY_GYRO_ALIGNMENT, [2.73; 3], [1843.0; 3]).as_default()
    } else {
        let sensitivity = match range {
            0 => 131.0,
            1 => 65.5,
            2 => 32.8,
            _ => 16.4,
        };
        InertialProfile::new(S3_GYRO_ALIGNMENT, [sensitivity; 3], [0.0; 3]).as_default()
    }
}

pub fn default_mag(generation: HardwareGeneration, gain: u8) -> InertialProfile {
    if generation.is_legacy() {
        return InertialProfile::new(LEGACY_MAG_ALIGNMENT, [580.0; 3], [0.0; 3]).as_default();
    }
    let sensitivity = match gain {
        0 | 1 => [1100.0, 1100.0, 980.0],
        2 => [855.0, 855.0, 760.0],
        3 => [670.0, 670.0, 600.0],
        4 => [450.0, 450.0, 400.0],
        5 => [400.0, 400.0, 355.0],
        6 => [330.0, 330.0, 295.0],
        _ => [230.0, 230.0, 205.0],
    };
    InertialProfile::new(S3_MAG_ALIGNMENT, sensitivity, [0.0; 3]).as_default()
}

pub fn default_ecg() -> LinearProfile {
    LinearProfile::new(2060.0, 175.0).as_default()
}

pub fn default_emg() -> LinearProfile {
    LinearProfile::new(2060.0, 750.0).as_default()
}

/// GSR reciprocal-linear coefficients `(p1, p2)` per hardware range.
///
/// Auto-range packs the selected range into bits 14-15 of the sample; that
/// layout matches one firmware revision.
pub fn gsr_coefficients(generation: HardwareGeneration, range: u8) -> (f64, f64) {
    const LEGACY: [(f64, f64); 4] = [
        (0.0373, -24.9915),
        (0.0054, -3.5194),
        (0.0015, -1.0163),
        (4.558e-4, -0.3014),
    ];
    const SHIMMER3: [(f64, f64); 4] = [
        (0.0363, -24.8617),
        (0.0051, -3.8357),
        (0.0015, -1.0067),
        (3.5165e-4, -0.2324),
    ];
    let table = if generation.is_legacy() { &LEGACY } else { &SHIMMER3 };
    table[(range as usize).min(3)]
}

/// Range setting meaning "let the hardware pick".
pub const GSR_AUTO_RANGE: u8 = 4;

/// Calibrate one GSR sample to kΩ. Returns the 12-bit data value and the
/// resistance.
pub fn calibrate_gsr(generation: HardwareGeneration, configured_range: u8, raw: u16) -> (f64, f64) {
    let range = if configured_range == GSR_AUTO_RANGE {
        ((raw >> 14) & 0x03) as u8
    } else {
        configured_range.min(3)
    };
    let data = (raw & 0x0FFF) as f64;
    let (p1, p2) = gsr_coefficients(generation, range);
    (data, 1000.0 / (p1 * data + p2))
}

/// Every profile the engine can use.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationProfiles {
    pub accel: InertialProfile,
    pub wide_range_accel: InertialProfile,
    pub gyro: InertialProfile,
    pub mag: InertialProfile,
    pub ecg_la_ll: LinearProfile,
    pub ecg_ra_ll: LinearProfile,
    pub emg: LinearProfile,
}

impl CalibrationProfiles {
    /// Defaults matching the configured ranges.
    pub fn defaults(generation: HardwareGeneration, settings: &DeviceSettings) -> Self {
        Self {
            accel: default_accel(generation, settings.accel_range),
            wide_range_accel: default_wide_range_accel(settings.accel_range),
            gyro: default_gyro(generation, settings.gyro_range),
            mag: default_mag(generation, settings.mag_gain),
            ecg_la_ll: default_ecg(),
            ecg_ra_ll: default_ecg(),
            emg: default_emg(),
        }
    }

    /// Re-pick defaults after a range change. Device-supplied profiles stay.
    pub fn reselect_defaults(&mut self, generation: HardwareGeneration, settings: &DeviceSettings) {
        let fresh = Self::defaults(generation, settings);
        if self.accel.is_default {
            self.accel = fresh.accel;
        }
        if self.wide_range_accel.is_default {
            self.wide_range_accel = fresh.wide_range_accel;
        }
        if self.gyro.is_default {
            self.gyro = fresh.gyro;
        }
        if self.mag.is_default {
            self.mag = fresh.mag;
        }
    }

    /// Apply a calibration response. Blocks carrying the "nothing stored"
    /// sentinel fall back to defaults; their names are returned.
    pub fn apply_payload(
        &mut self,
        generation: HardwareGeneration,
        settings: &DeviceSettings,
        group: CalibrationGroup,
        payload: &[u8],
    ) -> Vec<&'static str> {
        let defaults = Self::defaults(generation, settings);
        let mut unavailable = Vec::new();
        let mut inertial = |slot: &mut InertialProfile, fallback: InertialProfile, bytes: &[u8], scale: f64, name: &'static str| {
            match InertialProfile::from_payload(bytes, scale) {
                Some(profile) => *slot = profile,
                None => {
                    *slot = fallback;
                    unavailable.push(name);
                }
            }
        };
        let block = move |i: usize| {
            let start = i * INERTIAL_CALIBRATION_LEN;
            payload.get(start..start + INERTIAL_CALIBRATION_LEN).unwrap_or(&[])
        };
        match group {
            CalibrationGroup::Accel => {
                inertial(&mut self.accel, defaults.accel, block(0), 1.0, "accelerometer")
            }
            CalibrationGroup::Gyro => inertial(&mut self.gyro, defaults.gyro, block(0), 100.0, "gyroscope"),
            CalibrationGroup::Mag => inertial(&mut self.mag, defaults.mag, block(0), 1.0, "magnetometer"),
            CalibrationGroup::All => {
                inertial(&mut self.accel, defaults.accel, block(0), 1.0, "accelerometer");
                inertial(&mut self.gyro, defaults.gyro, block(1), 100.0, "gyroscope");
                inertial(&mut self.mag, defaults.mag, block(2), 1.0, "magnetometer");
                if !generation.is_legacy() {
                    inertial(
                        &mut self.wide_range_accel,
                        defaults.wide_range_accel,
                        block(3),
                        1.0,
                        "wide range accelerometer",
                    );
                }
            }
            CalibrationGroup::Emg | CalibrationGroup::Ecg => {}
        }

        let linear_start = 3 * INERTIAL_CALIBRATION_LEN;
        let (emg_bytes, ecg_bytes) = match group {
            CalibrationGroup::Emg => (Some(payload), None),
            CalibrationGroup::Ecg => (None, Some(payload)),
            CalibrationGroup::All if generation.is_legacy() => (
                payload.get(linear_start..linear_start + EMG_CALIBRATION_LEN),
                payload.get(
                    linear_start + EMG_CALIBRATION_LEN
                        ..linear_start + EMG_CALIBRATION_LEN + ECG_CALIBRATION_LEN,
                ),
            ),
            _ => (None, None),
        };
        if let Some(bytes) = emg_bytes {
            match parse_linear_pair(bytes) {
                Some(profile) => self.emg = profile,
                None => {
                    self.emg = default_emg();
                    unavailable.push("EMG");
                }
            }
        }
        if let Some(bytes) = ecg_bytes {
            let la = parse_linear_pair(bytes);
            let ra = bytes.get(4..).and_then(parse_linear_pair);
            match (la, ra) {
                (Some(la), Some(ra)) => {
                    self.ecg_la_ll = la;
                    self.ecg_ra_ll = ra;
                }
                _ => {
                    self.ecg_la_ll = default_ecg();
                    self.ecg_ra_ll = default_ecg();
                    unavailable.push("ECG");
                }
            }
        }
        unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Vector3, b: Vector3, tol: f64) {
        for i in 0..3 {
            assert!((a[i] - b[i]).abs() < tol, "{:?} vs {:?}", a, b);
        }
    }

    fn inertial_block(offset: [i16; 3], sensitivity: [i16; 3], alignment: [i8; 9]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in offset.iter().chain(sensitivity.iter()) {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend(alignment.iter().map(|&a| a as u8));
        bytes
    }

    #[test]
    fn test_inverse_identity() {
        let m = Matrix3([[2.0, 1.0, 0.0], [0.0, 3.0, 1.0], [1.0, 0.0, 4.0]]);
        let product = m.mul(&m.inverse().unwrap());
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((product.0[r][c] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_singular_matrix() {
        let m = Matrix3([[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]);
        assert_eq!(m.inverse(), Err(ShimmerError::SingularMatrix));
        let profile = InertialProfile::new(m, [1.0; 3], [0.0; 3]);
        assert!(profile.compile().is_err());
    }

    #[test]
    fn test_calibration_round_trip() {
        let profile = InertialProfile::new(
            Matrix3([[0.0, -1.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 0.0, -1.0]]),
            [83.0, 84.5, 82.0],
            [2047.0, 2050.0, 2040.0],
        );
        for raw in [[2047.0, 2050.0, 2040.0], [3000.0, 1000.0, 2200.0], [0.0, 4095.0, 17.0]] {
            let cal = profile.calibrate(raw).unwrap();
            assert_close(profile.uncalibrate(cal), raw, 1e-9);
        }
    }

    #[test]
    fn test_default_accel_at_rest() {
        let profile = default_accel(HardwareGeneration::Shimmer3, 0);
        assert!(profile.is_default);
        // One g along -Z after alignment.
        let cal = profile.calibrate([2047.0, 2047.0, 2047.0 - 83.0 * 9.81]).unwrap();
        assert_close(cal, [0.0, 0.0, 9.81], 1e-9);
    }

    #[test]
    fn test_parse_inertial_payload() {
        let bytes = inertial_block([10, -20, 30], [8300, 8300, 8300], [0, -100, 0, -100, 0, 0, 0, 0, -100]);
        let gyro = InertialProfile::from_payload(&bytes, 100.0).unwrap();
        assert_eq!(gyro.offset, [10.0, -20.0, 30.0]);
        assert_eq!(gyro.sensitivity, Matrix3::diagonal([83.0; 3]));
        assert_eq!(gyro.alignment, S3_GYRO_ALIGNMENT);
        assert!(!gyro.is_default);
        assert!(InertialProfile::from_payload(&[0xFF; 21], 1.0).is_none());
    }

    #[test]
    fn test_all_calibration_with_sentinels() {
        let settings = DeviceSettings { gyro_range: 1, ..Default::default() };
        let mut profiles = CalibrationProfiles::defaults(HardwareGeneration::Shimmer3, &settings);
        let mut payload = inertial_block([2000, 2000, 2000], [80, 80, 80], [0, -100, 0, -100, 0, 0, 0, 0, -100]);
        payload.extend([0xFF; 21]);
        payload.extend(inertial_block([0, 0, 0], [600, 600, 540], [-100, 0, 0, 0, 100, 0, 0, 0, -100]));
        payload.extend([0xFF; 21]);

        let unavailable = profiles.apply_payload(
            HardwareGeneration::Shimmer3,
            &settings,
            CalibrationGroup::All,
            &payload,
        );
        assert_eq!(unavailable, vec!["gyroscope", "wide range accelerometer"]);
        assert!(!profiles.accel.is_default);
        assert!(!profiles.mag.is_default);
        assert_eq!(profiles.gyro, default_gyro(HardwareGeneration::Shimmer3, 1));
    }

    #[test]
    fn test_legacy_all_calibration_linear_blocks() {
        let settings = DeviceSettings::default();
        let mut profiles = CalibrationProfiles::defaults(HardwareGeneration::Shimmer2r, &settings);
        let mut payload = vec![0xFF; 63];
        payload.extend([0x08, 0x0C, 0x02, 0xEE]); // EMG 2060 / 750
        payload.extend([0x08, 0x00, 0x00, 0xAF, 0x08, 0x10, 0x00, 0xB0]);
        let unavailable = profiles.apply_payload(
            HardwareGeneration::Shimmer2r,
            &settings,
            CalibrationGroup::All,
            &payload,
        );
        assert_eq!(unavailable, vec!["accelerometer", "gyroscope", "magnetometer"]);
        assert_eq!(profiles.emg, LinearProfile::new(2060.0, 750.0));
        assert_eq!(profiles.ecg_la_ll, LinearProfile::new(2048.0, 175.0));
        assert_eq!(profiles.ecg_ra_ll, LinearProfile::new(2064.0, 176.0));
    }

    #[test]
    fn test_reselect_keeps_device_profiles() {
        let mut settings = DeviceSettings::default();
        let mut profiles = CalibrationProfiles::defaults(HardwareGeneration::Shimmer3, &settings);
        profiles.gyro = InertialProfile::new(S3_GYRO_ALIGNMENT, [100.0; 3], [1.0; 3]);
        settings.accel_range = 3;
        settings.gyro_range = 3;
        profiles.reselect_defaults(HardwareGeneration::Shimmer3, &settings);
        assert_eq!(profiles.wide_range_accel.sensitivity, Matrix3::diagonal([135.0; 3]));
        assert_eq!(profiles.gyro.sensitivity, Matrix3::diagonal([100.0; 3]));
    }

    #[test]
    fn test_gsr_auto_range() {
        // Range 1 encoded in the top bits.
        let raw = (1u16 << 14) | 2000;
        let (data, kohm) = calibrate_gsr(HardwareGeneration::Shimmer3, GSR_AUTO_RANGE, raw);
        assert_eq!(data, 2000.0);
        let expected = 1000.0 / (0.0051 * 2000.0 - 3.8357);
        assert!((kohm - expected).abs() < 1e-9);

        // Fixed range ignores the top bits.
        let (_, fixed) = calibrate_gsr(HardwareGeneration::Shimmer2r, 0, raw);
        assert!((fixed - 1000.0 / (0.0373 * 2000.0 - 24.9915)).abs() < 1e-9);
    }

    #[test]
    fn test_linear_adc() {
        let ecg = default_ecg();
        let mv = ecg.calibrate(2060.0 + 4095.0, ADC_VREF_MV, ADC_FULL_SCALE);
        assert!((mv - 3000.0 / 175.0).abs() < 1e-9);
    }
}
