use serde::{Deserialize, Serialize};

/// One named channel value inside a sample frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    /// Semantic channel name, e.g. "Low Noise Accelerometer X".
    pub name: String,
    /// Value as decoded from the wire.
    pub raw: f64,
    /// Value in physical units.
    pub calibrated: f64,
    /// Unit of `calibrated`.
    pub unit: String,
    /// True when `calibrated` was produced from a default (not device-supplied)
    /// calibration profile.
    #[serde(default)]
    pub default_calibration: bool,
}

/// Per-frame bookkeeping the engine attaches to every frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Packets lost since streaming started, estimated from timestamp gaps.
    pub packet_loss_count: u64,
    /// Estimated percentage of expected frames actually received.
    pub reception_rate: f64,
    /// True when at least one channel used a default calibration profile.
    pub calibration_unavailable: bool,
    /// Raw 16-bit device tick counter carried by the frame.
    pub raw_timestamp: u16,
}

/// A calibrated sample frame.
///
/// Created once per synchronized frame and handed to the consumer wrapped in an
/// `Arc`; the engine keeps no reference to it afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleFrame {
    /// Monotonic device timestamp in milliseconds since the first tick cycle.
    pub device_timestamp_ms: f64,
    /// Channels in wire order.
    pub channels: Vec<ChannelValue>,
    pub metadata: FrameMetadata,
}

impl SampleFrame {
    /// Look up a channel by its semantic name.
    pub fn get(&self, name: &str) -> Option<&ChannelValue> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Calibrated value of a channel, if present.
    pub fn calibrated(&self, name: &str) -> Option<f64> {
        self.get(name).map(|c| c.calibrated)
    }

    /// Channel names in wire order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> SampleFrame {
        SampleFrame {
            device_timestamp_ms: 12.5,
            channels: vec![
                ChannelValue {
                    name: "GSR".to_string(),
                    raw: 1200.0,
                    calibrated: 230.4,
                    unit: "kOhms".to_string(),
                    default_calibration: true,
                },
                ChannelValue {
                    name: "Heart Rate".to_string(),
                    raw: 72.0,
                    calibrated: 72.0,
                    unit: "bpm".to_string(),
                    default_calibration: false,
                },
            ],
            metadata: FrameMetadata::default(),
        }
    }

    #[test]
    fn test_lookup_by_name() {
        let frame = frame();
        assert_eq!(frame.calibrated("GSR"), Some(230.4));
        assert!(frame.get("Missing").is_none());
        assert_eq!(frame.names().collect::<Vec<_>>(), vec!["GSR", "Heart Rate"]);
    }

    #[test]
    fn test_frame_serializes_with_metadata() {
        let json = serde_json::to_string(&frame()).unwrap();
        let back: SampleFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame());
    }
}
