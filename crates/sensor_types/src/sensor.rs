use serde::{Deserialize, Serialize};

/// Represents errors that can occur within a sensor driver.
///
/// These errors are what crosses the family-agnostic `Sensor` boundary; each
/// driver converts its own error type into one of these.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum SensorError {
    /// The transport failed or was closed underneath the session.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The operation is not valid in the session's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// The requested configuration was rejected.
    #[error("Configuration rejected: {0}")]
    Rejected(String),
    /// The device stopped answering.
    #[error("Device timeout: {0}")]
    Timeout(String),
    /// A driver-level error.
    #[error("Driver error: {0}")]
    DriverError(String),
}

/// What a device family can measure. Used by applications to decide which
/// sensors to offer before connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareCapability {
    Accelerometer,
    Gyroscope,
    Magnetometer,
    Ecg,
    Emg,
    Gsr,
    Battery,
    ExternalAdc,
    StrainGauge,
    HeartRate,
    OrientationFusion,
}

/// Trait that every device family implements.
///
/// Calls are asynchronous in effect: they hand work to the driver's protocol
/// worker and return. Completion is reported through the driver's event
/// channel.
pub trait Sensor: Send {
    /// Open the transport and start bring-up.
    fn connect(&mut self) -> Result<(), SensorError>;

    /// Tear the session down and release the transport.
    fn disconnect(&mut self) -> Result<(), SensorError>;

    /// Ask the device to start streaming frames.
    fn start_streaming(&mut self) -> Result<(), SensorError>;

    /// Ask the device to stop streaming frames.
    fn stop_streaming(&mut self) -> Result<(), SensorError>;

    /// Capabilities of the connected hardware (or of the family, before the
    /// hardware generation is known).
    fn provided_capabilities(&self) -> Vec<HardwareCapability>;
}
