//! Simulated device for tests and the demo binary.

mod data_generator;
mod device;

pub use data_generator::{encode_value, inertial_block, stored_calibration, SignalGenerator};
pub use device::{MockDevice, MockDeviceOptions};
