//! Call contract for orientation fusion.
//!
//! The engine does no fusion math itself. When fusion is enabled and a filter
//! is attached, every frame that carries a calibrated accelerometer,
//! gyroscope and magnetometer triple is run through the filter and gains four
//! quaternion channels.

use crate::calibration::Vector3;

/// Unit quaternion `w + xi + yj + zk`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn components(&self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An attitude and heading reference filter.
pub trait OrientationFilter: Send {
    /// Advance the filter by one sample.
    ///
    /// `accel` is in m/s², `gyro` in deg/s, `mag` in local flux units, and
    /// `dt_s` is the sampling period in seconds.
    fn update(&mut self, accel: Vector3, gyro: Vector3, mag: Vector3, dt_s: f64) -> Quaternion;

    /// Called when streaming (re)starts.
    fn reset(&mut self) {}
}

/// Names of the channels appended to fused frames.
pub const QUATERNION_CHANNELS: [&str; 4] = ["Quaternion 0", "Quaternion 1", "Quaternion 2", "Quaternion 3"];
