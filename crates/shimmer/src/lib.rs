//! Host-side protocol engine for Shimmer wearable sensors (Shimmer2, 2r and 3).
//!
//! A [`ShimmerSession`] owns one device link. It runs bring-up, mirrors the
//! device configuration, frames the streaming byte stream against the live
//! packet schema and emits calibrated [`SampleFrame`]s through a tokio
//! channel.

pub mod calibration;
pub mod command_queue;
pub mod config;
pub mod listener;
pub mod mock_device;
pub mod orientation;
pub mod protocol;
pub mod schema;
pub mod sensors;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

// Re-export the main types that users need
pub use config::{load_config, load_or_create_config, DeviceSetup, FrameDropPolicy, GyroOnTheFlyConfig, SessionConfig};
pub use listener::{spawn_listener, ShimmerListener};
pub use mock_device::{MockDevice, MockDeviceOptions};
pub use orientation::OrientationFilter;
pub use schema::PacketSchema;
pub use session::ShimmerSession;
pub use transport::Transport;
pub use types::{
    AccelSubMode, DeviceSettings, FirmwareVersion, HardwareGeneration, LowPowerKind, SensorKind,
    SessionState, SessionStats, ShimmerError,
};

pub use sensor_types::{Notification, NotificationKind, SampleFrame, SensorEvent};

#[cfg(feature = "serial")]
pub use transport::SerialTransport;
