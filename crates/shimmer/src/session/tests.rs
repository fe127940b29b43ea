use std::time::Duration;

use tokio::time::{sleep, timeout};

use super::*;
use crate::mock_device::{MockDevice, MockDeviceOptions};
use crate::protocol::{
    GET_ALL_CALIBRATION_COMMAND, GET_CONFIG_BYTES_COMMAND, GET_FW_VERSION_COMMAND,
    GET_HW_VERSION_COMMAND, GET_MAG_GAIN_COMMAND, GET_SAMPLING_RATE_COMMAND, INQUIRY_COMMAND,
    SET_CONFIG_BYTES_COMMAND, SET_SENSORS_COMMAND, TOGGLE_LED_COMMAND,
};
use crate::sensors::{LEGACY_ACCEL, LEGACY_EMG, LEGACY_GYRO, S3_GSR, S3_LN_ACCEL};

fn test_config() -> SessionConfig {
    SessionConfig {
        device_name: "test-shimmer".to_string(),
        ack_timeout_ms: 300,
        long_command_timeout_ms: 600,
        response_timeout_ms: 300,
        poll_interval_ms: 1,
        ..SessionConfig::default()
    }
}

fn fast_shimmer3() -> MockDeviceOptions {
    MockDeviceOptions {
        sampling_rate_hz: 512.0,
        ..MockDeviceOptions::default()
    }
}

fn open_session(config: SessionConfig, options: MockDeviceOptions) -> (ShimmerSession, mpsc::Receiver<SensorEvent>, MockDevice) {
    let device = MockDevice::new(options);
    let (session, events) = ShimmerSession::new(config, Box::new(device.clone())).unwrap();
    (session, events, device)
}

async fn next_event(events: &mut mpsc::Receiver<SensorEvent>) -> SensorEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
async fn wait_for(
    events: &mut mpsc::Receiver<SensorEvent>,
    done: impl Fn(&SensorEvent) -> bool,
) -> Vec<SensorEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

async fn collect_frames(events: &mut mpsc::Receiver<SensorEvent>, count: usize) -> Vec<Arc<sensor_types::SampleFrame>> {
    let mut frames = Vec::new();
    while frames.len() < count {
        if let SensorEvent::Frame(frame) = next_event(events).await {
            frames.push(frame);
        }
    }
    frames
}

fn is_connected(event: &SensorEvent) -> bool {
    matches!(event, SensorEvent::Connected)
}

fn notifications(events: &[SensorEvent], kind: NotificationKind) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SensorEvent::Notification(n) if n.kind == kind))
        .count()
}

#[tokio::test]
async fn test_full_lifecycle() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    match next_event(&mut events).await {
        SensorEvent::SensorCreated { device_name } => assert_eq!(device_name, "test-shimmer"),
        other => panic!("expected SensorCreated, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);

    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.generation(), Some(HardwareGeneration::Shimmer3));
    assert_eq!(session.firmware().map(|f| f.minor), Some(8));
    assert_eq!(session.schema().channels.len(), 9);
    assert!((session.settings().sampling_rate_hz - 512.0).abs() < 1e-9);

    // Flush and firmware queries, hardware query, then the Shimmer3 reads and the final inquiry.
    let opcodes = device.opcodes_received();
    assert_eq!(
        &opcodes[..3],
        &[GET_SAMPLING_RATE_COMMAND, GET_FW_VERSION_COMMAND, GET_HW_VERSION_COMMAND]
    );
    assert_eq!(opcodes.last(), Some(&INQUIRY_COMMAND));

    session.start_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StartStreaming)).await;
    assert_eq!(session.state(), SessionState::Streaming);

    let frames = collect_frames(&mut events, 30).await;
    for frame in &frames {
        assert_eq!(frame.channels.len(), 9);
        assert!(frame.get("Low Noise Accelerometer X").is_some());
        assert!(frame.get("Gyroscope Z").is_some());
    }
    for pair in frames.windows(2) {
        assert!(pair[1].device_timestamp_ms > pair[0].device_timestamp_ms);
    }

    session.stop_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StopStreaming)).await;
    assert_eq!(session.state(), SessionState::Connected);
    assert!(!device.is_streaming());
    let stats = session.stats();
    assert!(stats.frames_decoded >= 30);
    assert_eq!(stats.resyncs, 0);

    session.disconnect().unwrap();
    let tail = wait_for(&mut events, |e| matches!(e, SensorEvent::Disconnected { .. })).await;
    match tail.last() {
        Some(SensorEvent::Disconnected { reason }) => assert!(reason.is_none()),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!device.is_open());
}

#[tokio::test]
async fn test_old_firmware_falls_back_to_baseline() {
    let options = MockDeviceOptions {
        firmware: None,
        ..MockDeviceOptions::shimmer2r()
    };
    let (session, mut events, device) = open_session(test_config(), options);
    session.connect().unwrap();
    let seen = wait_for(&mut events, is_connected).await;

    assert_eq!(notifications(&seen, NotificationKind::ProtocolTimeout), 1);
    assert_eq!(session.firmware(), Some(FirmwareVersion::legacy_baseline()));
    assert_eq!(session.generation(), Some(HardwareGeneration::Shimmer2r));
    assert_eq!(session.settings().enabled_sensors, LEGACY_ACCEL | LEGACY_GYRO);
    assert_eq!(
        device.opcodes_received(),
        vec![
            GET_SAMPLING_RATE_COMMAND,
            GET_FW_VERSION_COMMAND,
            GET_SAMPLING_RATE_COMMAND,
            GET_MAG_GAIN_COMMAND,
            GET_CONFIG_BYTES_COMMAND,
            GET_ALL_CALIBRATION_COMMAND,
            INQUIRY_COMMAND,
        ]
    );
}

#[tokio::test]
async fn test_silent_device_ends_session_with_reason() {
    let options = MockDeviceOptions {
        silent_after: Some(3),
        ..fast_shimmer3()
    };
    let (session, mut events, device) = open_session(test_config(), options);
    session.connect().unwrap();
    let seen = wait_for(&mut events, |e| matches!(e, SensorEvent::Disconnected { .. })).await;

    assert!(!seen.iter().any(is_connected));
    match seen.last() {
        Some(SensorEvent::Disconnected { reason: Some(reason) }) => {
            assert!(reason.contains("0x03"), "{}", reason)
        }
        other => panic!("expected Disconnected with a reason, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!device.is_open());
}

#[tokio::test]
async fn test_transport_open_failure() {
    let options = MockDeviceOptions {
        fail_open: true,
        ..MockDeviceOptions::default()
    };
    let (session, mut events, _device) = open_session(test_config(), options);
    session.connect().unwrap();
    let seen = wait_for(&mut events, |e| matches!(e, SensorEvent::Disconnected { .. })).await;
    assert!(matches!(seen.last(), Some(SensorEvent::Disconnected { reason: Some(_) })));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_operations_check_state() {
    let (session, _events, _device) = open_session(test_config(), fast_shimmer3());
    assert!(matches!(
        session.start_streaming(),
        Err(ShimmerError::InvalidState { actual: SessionState::Disconnected, .. })
    ));
    assert!(matches!(session.stop_streaming(), Err(ShimmerError::InvalidState { .. })));
    assert!(matches!(session.set_sampling_rate(128.0), Err(ShimmerError::InvalidState { .. })));
    assert!(matches!(session.toggle_led(), Err(ShimmerError::InvalidState { .. })));
    // Nothing to do, nothing to complain about.
    assert!(session.disconnect().is_ok());
}

#[tokio::test]
async fn test_conflicting_sensors_rejected() {
    let options = MockDeviceOptions {
        sampling_rate_hz: 102.4,
        ..MockDeviceOptions::shimmer2r()
    };
    let (session, mut events, device) = open_session(test_config(), options);
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;

    let before = session.settings().enabled_sensors;
    let result = session.set_enabled_sensors(LEGACY_GYRO | LEGACY_EMG);
    assert!(matches!(result, Err(ShimmerError::SensorConflict { .. })));

    let seen = wait_for(&mut events, |e| {
        matches!(e, SensorEvent::Notification(n) if n.kind == NotificationKind::SensorConflict)
    })
    .await;
    assert_eq!(notifications(&seen, NotificationKind::SensorConflict), 1);
    assert_eq!(session.settings().enabled_sensors, before);
    assert_eq!(device.device_settings().enabled_sensors, before);
}

#[tokio::test]
async fn test_enabled_sensors_change_schema() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;

    session.set_enabled_sensors(S3_GSR).unwrap();
    // The confirming inquiry completes last; poll until it lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while session.schema().channels.len() != 1 && tokio::time::Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    let schema = session.schema();
    assert_eq!(schema.channels.len(), 1);
    assert_eq!(schema.channels[0].name, "GSR");
    assert_eq!(session.settings().enabled_sensors, S3_GSR);
    assert_eq!(device.device_settings().enabled_sensors, S3_GSR);
}

#[tokio::test]
async fn test_device_setup_applied_during_bring_up() {
    let config = SessionConfig {
        setup: Some(DeviceSetup {
            sampling_rate_hz: Some(204.8),
            enabled_sensors: Some(S3_LN_ACCEL | S3_GSR),
            gsr_range: Some(2),
            ..DeviceSetup::default()
        }),
        ..test_config()
    };
    let (session, mut events, device) = open_session(config, fast_shimmer3());
    session.connect().unwrap();
    let seen = wait_for(&mut events, is_connected).await;

    assert!(seen
        .iter()
        .any(|e| matches!(e, SensorEvent::SamplingRateChanged(hz) if (hz - 204.8).abs() < 1e-9)));
    let settings = session.settings();
    assert!((settings.sampling_rate_hz - 204.8).abs() < 1e-9);
    assert_eq!(settings.enabled_sensors, S3_LN_ACCEL | S3_GSR);
    assert_eq!(settings.gsr_range, 2);
    assert_eq!(session.schema().channels.len(), 4);

    let on_device = device.device_settings();
    assert_eq!(on_device.enabled_sensors, S3_LN_ACCEL | S3_GSR);
    assert_eq!(on_device.gsr_range, 2);
}

#[tokio::test]
async fn test_invalid_setup_entry_is_reported_and_skipped() {
    let config = SessionConfig {
        setup: Some(DeviceSetup {
            gsr_range: Some(9),
            sampling_rate_hz: Some(128.0),
            ..DeviceSetup::default()
        }),
        ..test_config()
    };
    let (session, mut events, _device) = open_session(config, fast_shimmer3());
    session.connect().unwrap();
    let seen = wait_for(&mut events, is_connected).await;
    assert_eq!(notifications(&seen, NotificationKind::Info), 1);
    assert!((session.settings().sampling_rate_hz - 128.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_commands_interleave_with_streaming() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    session.start_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StartStreaming)).await;
    collect_frames(&mut events, 10).await;

    session.toggle_led().unwrap();
    session.set_sensor_range(SensorKind::Accel, 2).unwrap();
    // Not allowed while streaming.
    assert!(matches!(
        session.set_sensor_range(SensorKind::Mag, 3),
        Err(ShimmerError::InvalidState { .. })
    ));
    assert!(matches!(session.set_sampling_rate(128.0), Err(ShimmerError::InvalidState { .. })));

    collect_frames(&mut events, 50).await;
    assert!(device.opcodes_received().contains(&TOGGLE_LED_COMMAND));
    assert_eq!(device.device_settings().accel_range, 2);
    assert_eq!(session.settings().accel_range, 2);
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.stats().resyncs, 0);

    session.stop_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StopStreaming)).await;
}

#[tokio::test]
async fn test_recovers_from_corrupted_stream() {
    let options = MockDeviceOptions {
        corrupt_at_frame: Some(20),
        ..fast_shimmer3()
    };
    let (session, mut events, _device) = open_session(test_config(), options);
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    session.start_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StartStreaming)).await;

    collect_frames(&mut events, 150).await;
    assert!(session.stats().resyncs >= 1);
    assert_eq!(session.state(), SessionState::Streaming);
}

#[tokio::test]
async fn test_uncalibrated_device_reports_defaults() {
    let options = MockDeviceOptions {
        calibrated: false,
        ..fast_shimmer3()
    };
    let (session, mut events, _device) = open_session(test_config(), options);
    session.connect().unwrap();
    let seen = wait_for(&mut events, is_connected).await;
    assert!(notifications(&seen, NotificationKind::CalibrationUnavailable) >= 1);

    session.start_streaming().unwrap();
    let frames = collect_frames(&mut events, 5).await;
    assert!(frames.iter().all(|f| f.metadata.calibration_unavailable));
}

#[tokio::test]
async fn test_slow_consumer_loses_frames_not_lifecycle() {
    let config = SessionConfig {
        event_channel_capacity: 4,
        frame_backlog: 8,
        ..test_config()
    };
    let options = MockDeviceOptions {
        sampling_rate_hz: 1024.0,
        ..MockDeviceOptions::default()
    };
    let (session, mut events, _device) = open_session(config, options);
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    session.start_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StartStreaming)).await;

    // Stop reading for a while.
    sleep(Duration::from_millis(400)).await;
    wait_for(&mut events, |e| {
        matches!(e, SensorEvent::Notification(n) if n.kind == NotificationKind::FramesDropped)
    })
    .await;
    assert!(session.stats().dropped_frames > 0);

    session.stop_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StopStreaming)).await;
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_drop_ends_worker() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    drop(session);
    wait_for(&mut events, |e| matches!(e, SensorEvent::Disconnected { .. })).await;
    assert!(!device.is_open());
    // Sender went away with the worker.
    assert!(timeout(Duration::from_secs(1), events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_commands_queued_behind_start_are_refused() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    let frame_size = session.schema().frame_size;

    // Both pass the handle's state check before the StartStreaming ACK lands.
    session.start_streaming().unwrap();
    session
        .enqueue(vec![CommandKind::SetSensors(S3_GSR), CommandKind::Inquiry])
        .unwrap();

    let mut seen = wait_for(&mut events, |e| matches!(e, SensorEvent::StartStreaming)).await;
    let mut frames = 0;
    while frames < 50 {
        let event = next_event(&mut events).await;
        if let SensorEvent::Frame(frame) = &event {
            assert_eq!(frame.channels.len(), 9);
            frames += 1;
        }
        seen.push(event);
    }
    assert!(notifications(&seen, NotificationKind::Info) >= 1);
    assert_eq!(notifications(&seen, NotificationKind::SchemaMismatch), 0);
    assert!(!seen.iter().any(|e| matches!(e, SensorEvent::Disconnected { .. })));
    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(session.schema().frame_size, frame_size);
    assert!(!device.opcodes_received().contains(&SET_SENSORS_COMMAND));

    session.stop_streaming().unwrap();
    wait_for(&mut events, |e| matches!(e, SensorEvent::StopStreaming)).await;
}

#[tokio::test]
async fn test_unacknowledged_stop_returns_to_connected() {
    let options = MockDeviceOptions {
        lose_stop_ack: true,
        ..fast_shimmer3()
    };
    let (session, mut events, device) = open_session(test_config(), options);
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    session.start_streaming().unwrap();
    collect_frames(&mut events, 20).await;

    session.stop_streaming().unwrap();
    let seen = wait_for(&mut events, |e| matches!(e, SensorEvent::StopStreaming)).await;
    assert!(!device.is_streaming());
    assert_eq!(notifications(&seen, NotificationKind::ProtocolTimeout), 1);
    assert!(!seen.iter().any(|e| matches!(e, SensorEvent::Disconnected { .. })));
    assert_eq!(session.state(), SessionState::Connected);

    session.toggle_led().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while device.opcodes_received().last() != Some(&TOGGLE_LED_COMMAND) {
        assert!(tokio::time::Instant::now() < deadline, "LED command never sent");
        sleep(Duration::from_millis(5)).await;
    }
    sleep(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_sub_mode_change_keeps_device_rate_bits() {
    let (session, mut events, device) = open_session(test_config(), fast_shimmer3());
    session.connect().unwrap();
    wait_for(&mut events, is_connected).await;
    let reported = session.settings().raw_config;
    assert_eq!(reported.len(), 4);
    assert_eq!(reported[1], 0x9B);

    session.set_accel_sub_mode(AccelSubMode::Smart).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.settings().accel_sub_mode != AccelSubMode::Smart {
        assert!(tokio::time::Instant::now() < deadline, "sub-mode never applied");
        sleep(Duration::from_millis(5)).await;
    }

    let sent = device
        .commands_received()
        .into_iter()
        .rev()
        .find(|c| c.first() == Some(&SET_CONFIG_BYTES_COMMAND))
        .unwrap();
    assert_eq!(sent.len(), 5);
    assert_eq!(sent[1], reported[0]);
    assert_eq!(sent[2], reported[1]);
    assert_eq!(sent[3], reported[2]);
    assert_eq!(sent[4] >> 6, AccelSubMode::Smart.bits());
    assert_eq!(device.device_settings().raw_config[1], 0x9B);
    assert_eq!(session.settings().raw_config[1], 0x9B);
}

#[test]
fn test_sensor_commands_add_pmux_change() {
    use crate::sensors::{LEGACY_BATTERY, LEGACY_EXP_A0};
    let settings = DeviceSettings::default();
    let commands = sensor_commands(HardwareGeneration::Shimmer2r, LEGACY_BATTERY, &settings).unwrap();
    assert_eq!(
        commands,
        vec![
            CommandKind::SetPmux(true),
            CommandKind::SetSensors(LEGACY_BATTERY),
            CommandKind::Inquiry
        ]
    );
    // Already in the right PMUX state.
    let commands = sensor_commands(HardwareGeneration::Shimmer2r, LEGACY_EXP_A0, &settings).unwrap();
    assert_eq!(commands, vec![CommandKind::SetSensors(LEGACY_EXP_A0), CommandKind::Inquiry]);
}

#[test]
fn test_sampling_rate_commands_follow_effective_rate() {
    let settings = DeviceSettings::default();
    let commands = sampling_rate_commands(HardwareGeneration::Shimmer3, 100.0, &settings).unwrap();
    assert_eq!(commands.len(), 3);
    assert!(matches!(commands[1], CommandKind::SetGyroSamplingRate { low_power: false, .. }));
    assert_eq!(
        sampling_rate_commands(HardwareGeneration::Shimmer2r, 100.0, &settings).unwrap(),
        vec![CommandKind::SetSamplingRate(100.0)]
    );
    assert!(sampling_rate_commands(HardwareGeneration::Shimmer3, 0.0, &settings).is_err());
}

#[test]
fn test_setup_commands_order_and_rejections() {
    let setup = DeviceSetup {
        sampling_rate_hz: Some(51.2),
        enabled_sensors: Some(LEGACY_GYRO | LEGACY_EMG),
        accel_range: Some(1),
        gyro_range: Some(2),
        ..DeviceSetup::default()
    };
    let (commands, rejected) =
        setup_commands(HardwareGeneration::Shimmer2r, &setup, &DeviceSettings::default());
    assert_eq!(
        commands,
        vec![CommandKind::SetAccelRange(1), CommandKind::SetSamplingRate(51.2)]
    );
    // No gyro range on legacy hardware, and gyro conflicts with EMG.
    assert_eq!(rejected.len(), 2);
    assert!(matches!(rejected[0], ShimmerError::Configuration(_)));
    assert!(matches!(rejected[1], ShimmerError::SensorConflict { .. }));
}

#[test]
fn test_capabilities_depend_on_generation() {
    let s3 = capabilities_for(Some(HardwareGeneration::Shimmer3));
    assert!(!s3.contains(&HardwareCapability::HeartRate));
    let s2 = capabilities_for(Some(HardwareGeneration::Shimmer2));
    assert!(s2.contains(&HardwareCapability::HeartRate));
    let unknown = capabilities_for(None);
    assert!(unknown.len() >= s3.len());
}
