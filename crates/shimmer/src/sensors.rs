//! Enabled-sensor bitmaps and the hardware conflict table.
//!
//! Legacy devices share ADC lines between several sensors, so some
//! combinations can't be streamed together. A few pairs are resolved by
//! flipping the PMUX bit instead of rejecting the request.

use log::debug;

use std::ops::RangeInclusive;

use crate::types::{HardwareGeneration, SensorKind, ShimmerError};

// Shimmer2 / Shimmer2r
pub const LEGACY_ACCEL: u32 = 0x80;
pub const LEGACY_GYRO: u32 = 0x40;
pub const LEGACY_MAG: u32 = 0x20;
pub const LEGACY_ECG: u32 = 0x10;
pub const LEGACY_EMG: u32 = 0x08;
pub const LEGACY_GSR: u32 = 0x04;
pub const LEGACY_EXP_A7: u32 = 0x02;
pub const LEGACY_EXP_A0: u32 = 0x01;
pub const LEGACY_STRAIN: u32 = 0x8000;
pub const LEGACY_HEART_RATE: u32 = 0x4000;
pub const LEGACY_BATTERY: u32 = 0x2000;

// Shimmer3
pub const S3_LN_ACCEL: u32 = 0x80;
pub const S3_GYRO: u32 = 0x40;
pub const S3_MAG: u32 = 0x20;
pub const S3_GSR: u32 = 0x04;
pub const S3_EXT_A7: u32 = 0x02;
pub const S3_EXT_A6: u32 = 0x01;
pub const S3_VBATT: u32 = 0x2000;
pub const S3_WR_ACCEL: u32 = 0x1000;
pub const S3_EXT_A15: u32 = 0x0800;
pub const S3_INT_A1: u32 = 0x0400;
pub const S3_INT_A12: u32 = 0x0200;
pub const S3_INT_A13: u32 = 0x0100;
pub const S3_INT_A14: u32 = 0x80_0000;
pub const S3_EXG1_16BIT: u32 = 0x10_0000;
pub const S3_EXG2_16BIT: u32 = 0x08_0000;
pub const S3_BRIDGE_AMP: u32 = 0x8000;

/// Pairs of sensors that cannot be enabled together.
fn conflict_pairs(generation: HardwareGeneration) -> Vec<(u32, u32, &'static str)> {
    if generation.is_legacy() {
        let mut pairs = Vec::new();
        for (sensor, name) in [(LEGACY_GYRO, "gyroscope"), (LEGACY_MAG, "magnetometer")] {
            pairs.push((sensor, LEGACY_EMG, name));
            pairs.push((sensor, LEGACY_ECG, name));
            pairs.push((sensor, LEGACY_GSR, name));
            pairs.push((sensor, LEGACY_STRAIN, name));
        }
        pairs.extend([
            (LEGACY_EMG, LEGACY_ECG, "EMG"),
            (LEGACY_EMG, LEGACY_GSR, "EMG"),
            (LEGACY_EMG, LEGACY_STRAIN, "EMG"),
            (LEGACY_ECG, LEGACY_GSR, "ECG"),
            (LEGACY_ECG, LEGACY_STRAIN, "ECG"),
            (LEGACY_GSR, LEGACY_STRAIN, "GSR"),
            (LEGACY_EXP_A0, LEGACY_BATTERY, "expansion A0"),
        ]);
        pairs
    } else {
        vec![
            (S3_GSR, S3_EXG1_16BIT, "GSR"),
            (S3_GSR, S3_EXG2_16BIT, "GSR"),
            (S3_GSR, S3_BRIDGE_AMP, "GSR"),
            (S3_GSR, S3_INT_A1, "GSR"),
            (S3_BRIDGE_AMP, S3_INT_A12, "bridge amplifier"),
            (S3_BRIDGE_AMP, S3_INT_A13, "bridge amplifier"),
            (S3_BRIDGE_AMP, S3_INT_A14, "bridge amplifier"),
        ]
    }
}

fn sensor_name(generation: HardwareGeneration, bit: u32) -> &'static str {
    let table: &[(u32, &'static str)] = if generation.is_legacy() {
        &[
            (LEGACY_GYRO, "gyroscope"),
            (LEGACY_MAG, "magnetometer"),
            (LEGACY_ECG, "ECG"),
            (LEGACY_EMG, "EMG"),
            (LEGACY_GSR, "GSR"),
            (LEGACY_STRAIN, "strain gauge"),
            (LEGACY_BATTERY, "battery"),
        ]
    } else {
        &[
            (S3_EXG1_16BIT, "EXG1"),
            (S3_EXG2_16BIT, "EXG2"),
            (S3_BRIDGE_AMP, "bridge amplifier"),
            (S3_INT_A1, "internal A1"),
            (S3_INT_A12, "internal A12"),
            (S3_INT_A13, "internal A13"),
            (S3_INT_A14, "internal A14"),
        ]
    };
    table
        .iter()
        .find(|(b, _)| *b == bit)
        .map(|(_, name)| *name)
        .unwrap_or("sensor")
}

/// Outcome of an accepted sensor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorSelection {
    pub bitmap: u32,
    /// PMUX state the selection needs, when it needs a change.
    pub pmux: Option<bool>,
}

/// Validate a requested enabled-sensor bitmap against the conflict table.
///
/// `five_volt_regulator` is the current regulator state: on legacy hardware
/// expansion A7 shares its pin.
pub fn check_sensor_selection(
    generation: HardwareGeneration,
    requested: u32,
    five_volt_regulator: bool,
) -> Result<SensorSelection, ShimmerError> {
    for (a, b, name) in conflict_pairs(generation) {
        if requested & a != 0 && requested & b != 0 {
            return Err(ShimmerError::SensorConflict {
                requested,
                reason: format!(
                    "{} cannot be enabled together with {} on {}",
                    name,
                    sensor_name(generation, b),
                    generation
                ),
            });
        }
    }

    if !generation.is_legacy() {
        return Ok(SensorSelection { bitmap: requested, pmux: None });
    }

    if requested & LEGACY_EXP_A7 != 0 && five_volt_regulator {
        return Err(ShimmerError::SensorConflict {
            requested,
            reason: "expansion A7 shares its pin with the 5V regulator".to_string(),
        });
    }

    let pmux = if requested & LEGACY_BATTERY != 0 {
        debug!("Battery monitoring selected, enabling PMUX");
        Some(true)
    } else if requested & LEGACY_EXP_A0 != 0 {
        debug!("Expansion A0 selected, disabling PMUX");
        Some(false)
    } else {
        None
    };
    Ok(SensorSelection { bitmap: requested, pmux })
}

/// Accepted setting values for a configurable range.
pub fn range_limits(generation: HardwareGeneration, kind: SensorKind) -> Option<RangeInclusive<u8>> {
    match (kind, generation.is_legacy()) {
        (SensorKind::Accel, _) => Some(0..=3),
        (SensorKind::Gyro, false) => Some(0..=3),
        (SensorKind::Gyro, true) => None,
        (SensorKind::Mag, true) => Some(0..=6),
        (SensorKind::Mag, false) => Some(1..=7),
        // 4 is auto-range.
        (SensorKind::Gsr, _) => Some(0..=4),
    }
}

/// Check a range setting before it is sent to the device.
pub fn check_range(generation: HardwareGeneration, kind: SensorKind, value: u8) -> Result<(), ShimmerError> {
    let limits = range_limits(generation, kind).ok_or_else(|| {
        ShimmerError::Configuration(format!("{:?} range is fixed on {}", kind, generation))
    })?;
    if !limits.contains(&value) {
        return Err(ShimmerError::Configuration(format!(
            "{:?} range {} outside {}..={} on {}",
            kind,
            value,
            limits.start(),
            limits.end(),
            generation
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gyro_and_emg_conflict_on_legacy() {
        let err = check_sensor_selection(
            HardwareGeneration::Shimmer2r,
            LEGACY_GYRO | LEGACY_EMG,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ShimmerError::SensorConflict { requested, .. } if requested == 0x48));
    }

    #[test]
    fn test_same_bits_fine_on_shimmer3() {
        // 0x40 | 0x08 on Shimmer3 is gyro plus an unused bit.
        assert!(check_sensor_selection(HardwareGeneration::Shimmer3, 0x48, false).is_ok());
    }

    #[test]
    fn test_shimmer3_conflicts() {
        assert!(check_sensor_selection(HardwareGeneration::Shimmer3, S3_GSR | S3_EXG1_16BIT, false).is_err());
        assert!(check_sensor_selection(HardwareGeneration::Shimmer3, S3_BRIDGE_AMP | S3_INT_A14, false).is_err());
        let ok = check_sensor_selection(
            HardwareGeneration::Shimmer3,
            S3_LN_ACCEL | S3_GYRO | S3_MAG | S3_GSR,
            false,
        )
        .unwrap();
        assert_eq!(ok.pmux, None);
    }

    #[test]
    fn test_pmux_auto_toggle() {
        let battery = check_sensor_selection(
            HardwareGeneration::Shimmer2r,
            LEGACY_ACCEL | LEGACY_BATTERY,
            false,
        )
        .unwrap();
        assert_eq!(battery.pmux, Some(true));

        let a0 = check_sensor_selection(HardwareGeneration::Shimmer2r, LEGACY_EXP_A0, false).unwrap();
        assert_eq!(a0.pmux, Some(false));

        assert!(check_sensor_selection(
            HardwareGeneration::Shimmer2r,
            LEGACY_EXP_A0 | LEGACY_BATTERY,
            false
        )
        .is_err());
    }

    #[test]
    fn test_a7_blocked_by_regulator() {
        assert!(check_sensor_selection(HardwareGeneration::Shimmer2, LEGACY_EXP_A7, true).is_err());
        assert!(check_sensor_selection(HardwareGeneration::Shimmer2, LEGACY_EXP_A7, false).is_ok());
    }

    #[test]
    fn test_range_limits() {
        assert!(check_range(HardwareGeneration::Shimmer3, SensorKind::Gyro, 3).is_ok());
        assert!(check_range(HardwareGeneration::Shimmer2r, SensorKind::Gyro, 0).is_err());
        assert!(check_range(HardwareGeneration::Shimmer3, SensorKind::Mag, 0).is_err());
        assert!(check_range(HardwareGeneration::Shimmer2r, SensorKind::Mag, 0).is_ok());
        assert!(check_range(HardwareGeneration::Shimmer2, SensorKind::Gsr, 4).is_ok());
        assert!(check_range(HardwareGeneration::Shimmer2, SensorKind::Accel, 4).is_err());
    }
}
