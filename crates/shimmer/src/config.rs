use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::types::{AccelSubMode, ShimmerError};

/// What to do with a sample frame when the consumer has fallen behind and
/// the frame backlog is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameDropPolicy {
    /// Discard the oldest queued frame to make room for the new one.
    #[default]
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Configuration pushed to the device at the end of bring-up.
///
/// Fields left as `None` keep whatever the device reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSetup {
    pub sampling_rate_hz: Option<f64>,
    pub enabled_sensors: Option<u32>,
    pub accel_range: Option<u8>,
    pub gyro_range: Option<u8>,
    pub mag_gain: Option<u8>,
    pub gsr_range: Option<u8>,
    pub accel_sub_mode: Option<AccelSubMode>,
}

/// Gyroscope offset re-estimation while the device is at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroOnTheFlyConfig {
    pub enabled: bool,
    /// Samples in the rolling window.
    pub window: usize,
    /// Standard deviation (deg/s) every axis must stay under.
    pub threshold_dps: f64,
}

impl Default for GyroOnTheFlyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 100,
            threshold_dps: 1.2,
        }
    }
}

/// Configuration for one device session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Name reported in `SensorCreated`
    pub device_name: String,
    /// Timeout for a plain ACK (ms)
    pub ack_timeout_ms: u64,
    /// Timeout for commands with long multi-byte responses (ms)
    pub long_command_timeout_ms: u64,
    /// Timeout re-armed after the ACK of a command that expects a response (ms)
    pub response_timeout_ms: u64,
    /// Re-validate frame alignment on every byte
    pub continuous_sync: bool,
    /// Capacity of the event channel handed to the consumer
    pub event_channel_capacity: usize,
    /// Sample frames held for a slow consumer before dropping
    pub frame_backlog: usize,
    pub frame_drop_policy: FrameDropPolicy,
    /// How long the worker blocks for control messages when idle (ms)
    pub poll_interval_ms: u64,
    pub setup: Option<DeviceSetup>,
    pub gyro_on_the_fly: GyroOnTheFlyConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: "Shimmer".to_string(),
            ack_timeout_ms: 2000,
            long_command_timeout_ms: 4000,
            response_timeout_ms: 1000,
            continuous_sync: false,
            event_channel_capacity: 256,
            frame_backlog: 1024,
            frame_drop_policy: FrameDropPolicy::DropOldest,
            poll_interval_ms: 5,
            setup: None,
            gyro_on_the_fly: GyroOnTheFlyConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_millis(self.long_command_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Reject values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ShimmerError> {
        if self.event_channel_capacity == 0 {
            return Err(ShimmerError::Configuration(
                "event_channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.frame_backlog == 0 {
            return Err(ShimmerError::Configuration(
                "frame_backlog must be greater than 0".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(ShimmerError::Configuration(
                "Command timeouts must be greater than 0".to_string(),
            ));
        }
        if let Some(rate) = self.setup.as_ref().and_then(|s| s.sampling_rate_hz) {
            if !(rate > 0.0) {
                return Err(ShimmerError::Configuration(format!(
                    "Sampling rate must be positive, got {}",
                    rate
                )));
            }
        }
        Ok(())
    }
}

/// Load a session configuration from a JSON file
pub fn load_config(path: impl AsRef<Path>) -> Result<SessionConfig, ShimmerError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let config: SessionConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Load configuration from file or create default if not found
pub fn load_or_create_config(path: impl AsRef<Path>) -> Result<SessionConfig, ShimmerError> {
    let path = path.as_ref();
    if path.exists() {
        return load_config(path);
    }
    warn!(
        "No configuration at {}, writing defaults",
        path.display()
    );
    let config = SessionConfig::default();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&config)?)?;
    Ok(config)
}
