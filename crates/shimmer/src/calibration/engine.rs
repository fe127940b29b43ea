//! Turns decoded frames into calibrated `SampleFrame`s.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use sensor_types::{ChannelValue, FrameMetadata, SampleFrame};

use super::timestamp::TimestampCalibrator;
use super::{
    calibrate_adc, calibrate_gsr, CalibrationProfiles, InertialCalibrator, InertialProfile,
    Vector3, ADC_FULL_SCALE, ADC_VREF_MV, EXG_FULL_SCALE, EXG_GAIN, EXG_VREF_MV,
};
use crate::orientation::{OrientationFilter, QUATERNION_CHANNELS};
use crate::protocol::CalibrationGroup;
use crate::schema::{ChannelRole, PacketSchema, RawFrame};
use crate::types::{DeviceSettings, HardwareGeneration};

const UNIT_ACCEL: &str = "m/(s^2)";
const UNIT_GYRO: &str = "deg/s";
const UNIT_MAG: &str = "local flux";
const UNIT_MV: &str = "mV";
const UNIT_KOHM: &str = "kOhms";
const UNIT_BPM: &str = "BPM";
const UNIT_NONE: &str = "no units";
const UNIT_QUATERNION: &str = "local";

// Strain gauge / bridge amplifier fixed calibration.
const STRAIN_HIGH_OFFSET: f64 = 60.0;
const STRAIN_HIGH_GAIN: f64 = 551.0 * 2.8;
const STRAIN_LOW_OFFSET: f64 = 1950.0;
const STRAIN_LOW_GAIN: f64 = 183.7 * 2.8;

/// Profiles with their inertial matrices already inverted.
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    pub profiles: CalibrationProfiles,
    accel: InertialCalibrator,
    wide_range_accel: InertialCalibrator,
    gyro: InertialCalibrator,
    mag: InertialCalibrator,
}

/// Three-axis sensor groups, in the order used for per-frame scratch arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triad {
    Accel = 0,
    WideRangeAccel = 1,
    Gyro = 2,
    Mag = 3,
}

impl Triad {
    fn of(role: ChannelRole) -> Option<(Triad, usize)> {
        match role {
            ChannelRole::Accel(axis) => Some((Triad::Accel, axis.index())),
            ChannelRole::WideRangeAccel(axis) => Some((Triad::WideRangeAccel, axis.index())),
            ChannelRole::Gyro(axis) => Some((Triad::Gyro, axis.index())),
            ChannelRole::Mag(axis) => Some((Triad::Mag, axis.index())),
            _ => None,
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Triad::Accel | Triad::WideRangeAccel => UNIT_ACCEL,
            Triad::Gyro => UNIT_GYRO,
            Triad::Mag => UNIT_MAG,
        }
    }
}

impl ProfileSnapshot {
    fn calibrator(&self, triad: Triad) -> &InertialCalibrator {
        match triad {
            Triad::Accel => &self.accel,
            Triad::WideRangeAccel => &self.wide_range_accel,
            Triad::Gyro => &self.gyro,
            Triad::Mag => &self.mag,
        }
    }
}

/// Rolling estimate of the gyroscope offset while the device is still.
#[derive(Debug, Clone)]
pub struct GyroOnTheFly {
    window: usize,
    threshold_dps: f64,
    samples: VecDeque<(Vector3, Vector3)>,
}

impl GyroOnTheFly {
    pub fn new(window: usize, threshold_dps: f64) -> Self {
        let window = window.max(2);
        Self {
            window,
            threshold_dps,
            samples: VecDeque::with_capacity(window),
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Feed one sample; returns a new raw offset once a full window stayed
    /// under the threshold on every axis.
    pub fn push(&mut self, raw: Vector3, calibrated: Vector3) -> Option<Vector3> {
        self.samples.push_back((raw, calibrated));
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }
        if self.samples.len() < self.window {
            return None;
        }
        let n = self.samples.len() as f64;
        for axis in 0..3 {
            let mean = self.samples.iter().map(|(_, c)| c[axis]).sum::<f64>() / n;
            let variance = self
                .samples
                .iter()
                .map(|(_, c)| (c[axis] - mean).powi(2))
                .sum::<f64>()
                / n;
            if variance.sqrt() >= self.threshold_dps {
                return None;
            }
        }
        let mut offset = [0.0; 3];
        for (axis, slot) in offset.iter_mut().enumerate() {
            *slot = self.samples.iter().map(|(r, _)| r[axis]).sum::<f64>() / n;
        }
        self.samples.clear();
        Some(offset)
    }
}

pub struct CalibrationEngine {
    generation: HardwareGeneration,
    snapshot: Arc<ProfileSnapshot>,
    timestamps: TimestampCalibrator,
    gyro_on_the_fly: Option<GyroOnTheFly>,
    filter: Option<Box<dyn OrientationFilter>>,
}

impl CalibrationEngine {
    pub fn new(generation: HardwareGeneration, settings: &DeviceSettings) -> Self {
        let profiles = CalibrationProfiles::defaults(generation, settings);
        let (snapshot, _) = compile(generation, settings, profiles);
        Self {
            generation,
            snapshot: Arc::new(snapshot),
            timestamps: TimestampCalibrator::new(generation.tick_frequency_hz(), settings.sampling_rate_hz),
            gyro_on_the_fly: None,
            filter: None,
        }
    }

    pub fn generation(&self) -> HardwareGeneration {
        self.generation
    }

    pub fn profiles(&self) -> &CalibrationProfiles {
        &self.snapshot.profiles
    }

    /// Current snapshot, for callers that need a consistent view.
    pub fn snapshot(&self) -> Arc<ProfileSnapshot> {
        Arc::clone(&self.snapshot)
    }

    /// Swap in a new profile set. Returns a warning per group whose matrix
    /// could not be inverted and was replaced by its default.
    pub fn install(&mut self, settings: &DeviceSettings, profiles: CalibrationProfiles) -> Vec<String> {
        let (snapshot, warnings) = compile(self.generation, settings, profiles);
        self.snapshot = Arc::new(snapshot);
        warnings
    }

    /// The device turned out to be a different generation: start over from
    /// that generation's defaults.
    pub fn set_generation(&mut self, generation: HardwareGeneration, settings: &DeviceSettings) {
        if generation != self.generation {
            info!("Calibration engine switching to {}", generation);
        }
        self.generation = generation;
        self.timestamps.set_tick_frequency(generation.tick_frequency_hz());
        let profiles = CalibrationProfiles::defaults(generation, settings);
        let (snapshot, _) = compile(generation, settings, profiles);
        self.snapshot = Arc::new(snapshot);
    }

    /// Re-pick default profiles after a range change.
    pub fn on_range_change(&mut self, settings: &DeviceSettings) -> Vec<String> {
        let mut profiles = self.snapshot.profiles.clone();
        profiles.reselect_defaults(self.generation, settings);
        self.install(settings, profiles)
    }

    /// Apply a calibration response. Returns the names of groups that are
    /// now on defaults, followed by any singular-matrix warnings.
    pub fn apply_calibration(
        &mut self,
        settings: &DeviceSettings,
        group: CalibrationGroup,
        payload: &[u8],
    ) -> (Vec<&'static str>, Vec<String>) {
        let mut profiles = self.snapshot.profiles.clone();
        let unavailable = profiles.apply_payload(self.generation, settings, group, payload);
        let warnings = self.install(settings, profiles);
        (unavailable, warnings)
    }

    pub fn set_sampling_rate(&mut self, hz: f64) {
        self.timestamps.set_sampling_rate(hz);
    }

    pub fn set_gyro_on_the_fly(&mut self, estimator: Option<GyroOnTheFly>) {
        self.gyro_on_the_fly = estimator;
    }

    pub fn attach_filter(&mut self, filter: Box<dyn OrientationFilter>) {
        self.filter = Some(filter);
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some()
    }

    /// Called when streaming starts.
    pub fn reset_stream(&mut self) {
        self.timestamps.reset();
        if let Some(otf) = self.gyro_on_the_fly.as_mut() {
            otf.clear();
        }
        if let Some(filter) = self.filter.as_mut() {
            filter.reset();
        }
    }

    pub fn packets_lost(&self) -> u64 {
        self.timestamps.packets_lost()
    }

    /// Calibrate one decoded frame.
    pub fn calibrate(
        &mut self,
        schema: &PacketSchema,
        raw: &RawFrame,
        settings: &DeviceSettings,
    ) -> SampleFrame {
        let snapshot = Arc::clone(&self.snapshot);
        let stamp = self.timestamps.calibrate(raw.timestamp);

        // Gather three-axis groups first: each axis needs the other two.
        let mut raw_triads: [[Option<f64>; 3]; 4] = [[None; 3]; 4];
        for (desc, &value) in schema.channels.iter().zip(&raw.values) {
            if let Some((triad, axis)) = Triad::of(desc.role) {
                raw_triads[triad as usize][axis] = Some(value as f64);
            }
        }
        let mut triads: [Option<(Vector3, Vector3)>; 4] = [None; 4];
        for triad in [Triad::Accel, Triad::WideRangeAccel, Triad::Gyro, Triad::Mag] {
            let axes = raw_triads[triad as usize];
            if axes.iter().all(Option::is_none) {
                continue;
            }
            let calibrator = snapshot.calibrator(triad);
            let mut vector = calibrator.offset;
            for (axis, value) in axes.iter().enumerate() {
                if let Some(v) = value {
                    vector[axis] = *v;
                }
            }
            triads[triad as usize] = Some((vector, calibrator.apply(vector)));
        }

        let mut channels = Vec::with_capacity(schema.channels.len() + 4);
        for (desc, &value) in schema.channels.iter().zip(&raw.values) {
            let raw_value = value as f64;
            let (raw_out, calibrated, unit, is_default) = match desc.role {
                ChannelRole::Accel(_) | ChannelRole::WideRangeAccel(_) | ChannelRole::Gyro(_) | ChannelRole::Mag(_) => {
                    let Some((triad, axis)) = Triad::of(desc.role) else {
                        continue;
                    };
                    let cal = triads[triad as usize].map(|(_, c)| c[axis]).unwrap_or(f64::NAN);
                    (raw_value, cal, triad.unit(), snapshot.calibrator(triad).is_default)
                }
                ChannelRole::EcgLaLl => {
                    let p = snapshot.profiles.ecg_la_ll;
                    (raw_value, p.calibrate(raw_value, ADC_VREF_MV, ADC_FULL_SCALE), UNIT_MV, p.is_default)
                }
                ChannelRole::EcgRaLl => {
                    let p = snapshot.profiles.ecg_ra_ll;
                    (raw_value, p.calibrate(raw_value, ADC_VREF_MV, ADC_FULL_SCALE), UNIT_MV, p.is_default)
                }
                ChannelRole::Emg => {
                    let p = snapshot.profiles.emg;
                    (raw_value, p.calibrate(raw_value, ADC_VREF_MV, ADC_FULL_SCALE), UNIT_MV, p.is_default)
                }
                ChannelRole::Gsr => {
                    // Raw keeps the auto-range bits; only the low 12 are resistance.
                    let (_, kohm) = calibrate_gsr(self.generation, settings.gsr_range, value as u16);
                    (raw_value, kohm, UNIT_KOHM, false)
                }
                ChannelRole::Adc { divider } => {
                    let mv = calibrate_adc(raw_value, 0.0, ADC_VREF_MV, 1.0, ADC_FULL_SCALE) * divider;
                    (raw_value, mv, UNIT_MV, false)
                }
                ChannelRole::StrainHigh => {
                    let mv = calibrate_adc(raw_value, STRAIN_HIGH_OFFSET, ADC_VREF_MV, STRAIN_HIGH_GAIN, ADC_FULL_SCALE);
                    (raw_value, mv, UNIT_MV, false)
                }
                ChannelRole::StrainLow => {
                    let mv = calibrate_adc(raw_value, STRAIN_LOW_OFFSET, ADC_VREF_MV, STRAIN_LOW_GAIN, ADC_FULL_SCALE);
                    (raw_value, mv, UNIT_MV, false)
                }
                ChannelRole::Exg16 => {
                    let mv = calibrate_adc(raw_value, 0.0, EXG_VREF_MV, EXG_GAIN, EXG_FULL_SCALE);
                    (raw_value, mv, UNIT_MV, false)
                }
                ChannelRole::HeartRate => (raw_value, raw_value, UNIT_BPM, false),
                ChannelRole::Raw => (raw_value, raw_value, UNIT_NONE, false),
            };
            channels.push(ChannelValue {
                name: desc.name.to_string(),
                raw: raw_out,
                calibrated,
                unit: unit.to_string(),
                default_calibration: is_default,
            });
        }

        let new_gyro_offset = match (self.gyro_on_the_fly.as_mut(), triads[Triad::Gyro as usize]) {
            (Some(otf), Some((gyro_raw, gyro_cal))) => otf.push(gyro_raw, gyro_cal),
            _ => None,
        };
        if let Some(offset) = new_gyro_offset {
            debug!("Gyroscope at rest, new offset {:?}", offset);
            let mut profiles = snapshot.profiles.clone();
            profiles.gyro.offset = offset;
            for warning in self.install(settings, profiles) {
                warn!("{}", warning);
            }
        }

        if settings.orientation_fusion {
            let accel = triads[Triad::Accel as usize].or(triads[Triad::WideRangeAccel as usize]);
            let gyro = triads[Triad::Gyro as usize];
            let mag = triads[Triad::Mag as usize];
            if let (Some(filter), Some((_, a)), Some((_, g)), Some((_, m))) =
                (self.filter.as_mut(), accel, gyro, mag)
            {
                let dt = if settings.sampling_rate_hz > 0.0 {
                    1.0 / settings.sampling_rate_hz
                } else {
                    0.0
                };
                let q = filter.update(a, g, m, dt);
                for (name, value) in QUATERNION_CHANNELS.iter().zip(q.components()) {
                    channels.push(ChannelValue {
                        name: name.to_string(),
                        raw: value,
                        calibrated: value,
                        unit: UNIT_QUATERNION.to_string(),
                        default_calibration: false,
                    });
                }
            }
        }

        let calibration_unavailable = channels.iter().any(|c| c.default_calibration);
        SampleFrame {
            device_timestamp_ms: stamp.milliseconds,
            channels,
            metadata: FrameMetadata {
                packet_loss_count: stamp.packet_loss_count,
                reception_rate: stamp.reception_rate,
                calibration_unavailable,
                raw_timestamp: raw.timestamp,
            },
        }
    }
}

/// Invert every inertial profile, falling back to defaults for singular ones.
fn compile(
    generation: HardwareGeneration,
    settings: &DeviceSettings,
    mut profiles: CalibrationProfiles,
) -> (ProfileSnapshot, Vec<String>) {
    let defaults = CalibrationProfiles::defaults(generation, settings);
    let mut warnings = Vec::new();
    let mut compile_one = |profile: &mut InertialProfile, fallback: InertialProfile, name: &str| {
        match profile.compile() {
            Ok(c) => c,
            Err(e) => {
                warnings.push(format!("{} calibration unusable ({}), using defaults", name, e));
                *profile = fallback;
                fallback.compile().unwrap_or(InertialCalibrator {
                    matrix: super::Matrix3::IDENTITY,
                    offset: fallback.offset,
                    is_default: true,
                })
            }
        }
    };
    let accel = compile_one(&mut profiles.accel, defaults.accel, "Accelerometer");
    let wide_range_accel = compile_one(
        &mut profiles.wide_range_accel,
        defaults.wide_range_accel,
        "Wide range accelerometer",
    );
    let gyro = compile_one(&mut profiles.gyro, defaults.gyro, "Gyroscope");
    let mag = compile_one(&mut profiles.mag, defaults.mag, "Magnetometer");
    (
        ProfileSnapshot {
            profiles,
            accel,
            wide_range_accel,
            gyro,
            mag,
        },
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{default_gyro, Matrix3};
    use crate::orientation::Quaternion;
    use crate::schema::SchemaContext;
    use crate::sensors;

    fn shimmer3_settings() -> DeviceSettings {
        DeviceSettings {
            generation: Some(HardwareGeneration::Shimmer3),
            sampling_rate_hz: 51.2,
            ..Default::default()
        }
    }

    struct FixedFilter;

    impl OrientationFilter for FixedFilter {
        fn update(&mut self, _accel: Vector3, _gyro: Vector3, _mag: Vector3, dt_s: f64) -> Quaternion {
            assert!(dt_s > 0.0);
            Quaternion { w: 0.5, x: 0.5, y: 0.5, z: 0.5 }
        }
    }

    #[test]
    fn test_frame_with_defaults_is_flagged() {
        let settings = shimmer3_settings();
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        let ctx = SchemaContext::new(HardwareGeneration::Shimmer3);
        let schema = PacketSchema::build(ctx, &[0x00, 0x01, 0x02, 0x03]).unwrap();
        let raw = RawFrame { timestamp: 100, values: vec![2047, 2047, 2047 + 83, 2047] };

        let frame = engine.calibrate(&schema, &raw, &settings);
        assert!(frame.metadata.calibration_unavailable);
        assert_eq!(frame.metadata.raw_timestamp, 100);
        let z = frame.calibrated("Low Noise Accelerometer Z").unwrap();
        assert!((z + 1.0).abs() < 1e-9);
        let battery = frame.calibrated("Battery").unwrap();
        assert!((battery - 2047.0 * (3000.0 / 4095.0) * 1.988).abs() < 1e-9);
        assert_eq!(frame.get("Battery").unwrap().unit, "mV");
    }

    #[test]
    fn test_device_calibration_clears_flag() {
        let settings = shimmer3_settings();
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        let mut profiles = engine.profiles().clone();
        profiles.accel.is_default = false;
        assert!(engine.install(&settings, profiles).is_empty());

        let schema = PacketSchema::build(SchemaContext::new(HardwareGeneration::Shimmer3), &[0x00, 0x01, 0x02]).unwrap();
        let frame = engine.calibrate(&schema, &RawFrame { timestamp: 0, values: vec![2047; 3] }, &settings);
        assert!(!frame.metadata.calibration_unavailable);
    }

    #[test]
    fn test_singular_profile_falls_back() {
        let settings = shimmer3_settings();
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        let mut profiles = engine.profiles().clone();
        profiles.gyro = InertialProfile::new(Matrix3([[0.0; 3]; 3]), [1.0; 3], [0.0; 3]);
        let warnings = engine.install(&settings, profiles);
        assert_eq!(warnings.len(), 1);
        assert_eq!(engine.profiles().gyro, default_gyro(HardwareGeneration::Shimmer3, 0));
    }

    #[test]
    fn test_legacy_biopotential_and_strain() {
        let settings = DeviceSettings {
            generation: Some(HardwareGeneration::Shimmer2r),
            gsr_range: 0,
            ..Default::default()
        };
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer2r, &settings);
        let schema = PacketSchema::build(
            SchemaContext::new(HardwareGeneration::Shimmer2r),
            &[0x09, 0x0A, 0x10, 0x11, 0x12],
        )
        .unwrap();
        let raw = RawFrame { timestamp: 0, values: vec![2060, 2235, 60, 1950, 72] };
        let frame = engine.calibrate(&schema, &raw, &settings);
        assert_eq!(frame.calibrated("ECG RA-LL"), Some(0.0));
        let la = frame.calibrated("ECG LA-LL").unwrap();
        assert!((la - 175.0 * (3000.0 / 175.0) / 4095.0).abs() < 1e-9);
        assert_eq!(frame.calibrated("Strain Gauge High"), Some(0.0));
        assert_eq!(frame.calibrated("Strain Gauge Low"), Some(0.0));
        assert_eq!(frame.calibrated("Heart Rate"), Some(72.0));
        assert!(frame.get("ECG RA-LL").unwrap().default_calibration);
    }

    #[test]
    fn test_gsr_raw_keeps_range_bits() {
        let mut settings = shimmer3_settings();
        settings.gsr_range = crate::calibration::GSR_AUTO_RANGE;
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        let schema = PacketSchema::build(SchemaContext::new(HardwareGeneration::Shimmer3), &[0x1C]).unwrap();
        let wire = (2 << 14) | 1500;
        let frame = engine.calibrate(&schema, &RawFrame { timestamp: 0, values: vec![wire] }, &settings);
        let gsr = frame.get("GSR").unwrap();
        assert_eq!(gsr.raw, wire as f64);
        let (_, expected) = calibrate_gsr(HardwareGeneration::Shimmer3, 2, 1500);
        assert!((gsr.calibrated - expected).abs() < 1e-9);
    }

    #[test]
    fn test_exg_scaling() {
        let settings = shimmer3_settings();
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        let schema = PacketSchema::build(SchemaContext::new(HardwareGeneration::Shimmer3), &[0x1D, 0x23]).unwrap();
        let frame = engine.calibrate(&schema, &RawFrame { timestamp: 0, values: vec![0x80, 32767] }, &settings);
        let mv = frame.calibrated("EXG1 CH1 16Bit").unwrap();
        assert!((mv - 2420.0 / 6.0).abs() < 1e-9);
        assert_eq!(frame.calibrated("EXG1 Status"), Some(128.0));
    }

    #[test]
    fn test_gyro_on_the_fly_updates_offset() {
        let settings = shimmer3_settings();
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        engine.set_gyro_on_the_fly(Some(GyroOnTheFly::new(10, 1.2)));
        let ids = crate::schema::channels_for_sensors(SchemaContext::new(HardwareGeneration::Shimmer3), sensors::S3_GYRO);
        let schema = PacketSchema::build(SchemaContext::new(HardwareGeneration::Shimmer3), &ids).unwrap();
        for i in 0..10u16 {
            let jitter = (i % 2) as i32;
            let raw = RawFrame { timestamp: i * 640, values: vec![40 + jitter, -25, 12] };
            engine.calibrate(&schema, &raw, &settings);
        }
        let offset = engine.profiles().gyro.offset;
        assert!((offset[0] - 40.5).abs() < 1e-9);
        assert_eq!(offset[1], -25.0);
        assert_eq!(offset[2], 12.0);
    }

    #[test]
    fn test_fusion_appends_quaternion() {
        let mut settings = shimmer3_settings();
        settings.orientation_fusion = true;
        let mut engine = CalibrationEngine::new(HardwareGeneration::Shimmer3, &settings);
        engine.attach_filter(Box::new(FixedFilter));
        let ctx = SchemaContext::new(HardwareGeneration::Shimmer3);
        let ids = crate::schema::channels_for_sensors(ctx, sensors::S3_LN_ACCEL | sensors::S3_GYRO | sensors::S3_MAG);
        let schema = PacketSchema::build(ctx, &ids).unwrap();
        let raw = RawFrame { timestamp: 0, values: vec![2047, 2047, 2047, 10, 10, 10, 5, 5, 5] };
        let frame = engine.calibrate(&schema, &raw, &settings);
        assert_eq!(frame.channels.len(), 13);
        assert_eq!(frame.calibrated("Quaternion 0"), Some(0.5));

        // Accelerometer and magnetometer only: no gyroscope, no fusion.
        let partial = PacketSchema::build(ctx, &ids[..6]).unwrap();
        let frame = engine.calibrate(&partial, &RawFrame { timestamp: 640, values: vec![2047; 6] }, &settings);
        assert!(frame.get("Quaternion 0").is_none());
    }
}
