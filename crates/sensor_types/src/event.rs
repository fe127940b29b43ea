//! Event types flowing from a sensor's protocol worker to its consumer
//!
//! Large payloads travel in `Arc` so a dispatcher can fan them out without
//! copying.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::SampleFrame;

/// Category of a non-fatal condition reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Informational lifecycle message.
    Info,
    /// A requested sensor combination was rejected.
    SensorConflict,
    /// A frame did not match the live packet schema and was dropped.
    SchemaMismatch,
    /// Defaults are in use because the device reported no calibration.
    CalibrationUnavailable,
    /// A soft-failing probe timed out.
    ProtocolTimeout,
    /// Sample frames were dropped because the consumer fell behind.
    FramesDropped,
}

/// A message for the consumer that does not end the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Main event enum emitted by a sensor session
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// The session object exists; nothing has been opened yet.
    SensorCreated { device_name: String },
    /// Bring-up finished; the device accepts configuration.
    Connected,
    /// The session ended. `reason` is set when it ended because of an error.
    Disconnected { reason: Option<String> },
    StartStreaming,
    StopStreaming,
    /// A calibrated frame.
    Frame(Arc<SampleFrame>),
    /// The device confirmed a new sampling rate (Hz).
    SamplingRateChanged(f64),
    Notification(Notification),
}

impl SensorEvent {
    /// Lifecycle events must reach the consumer; frames may be shed.
    pub fn is_droppable(&self) -> bool {
        matches!(self, SensorEvent::Frame(_))
    }
}
