//! Device session: the public handle for one Shimmer device.
//!
//! The handle validates requests against the session state it can see and
//! hands them to the protocol worker, which owns the transport. Every setter
//! is asynchronous: a returned `Ok` means the commands were queued, and the
//! effect is confirmed through the event channel.

mod worker;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, error, info, warn};
use sensor_types::{
    HardwareCapability, Notification, NotificationKind, Sensor, SensorError, SensorEvent,
};
use tokio::sync::mpsc;

use crate::calibration::GyroOnTheFly;
use crate::config::{DeviceSetup, GyroOnTheFlyConfig, SessionConfig};
use crate::orientation::OrientationFilter;
use crate::protocol::{effective_sampling_rate, gyro_rate_setting, mag_rate_setting, CommandKind};
use crate::schema::{self, PacketSchema, SchemaContext};
use crate::sensors::{self, check_range, check_sensor_selection};
use crate::transport::Transport;
use crate::types::{
    AccelSubMode, DeviceSettings, FirmwareVersion, HardwareGeneration, LowPowerKind, SensorKind,
    SessionState, SessionStats, ShimmerError,
};

use worker::Worker;

/// State the worker publishes for the handle to read.
#[derive(Debug, Clone)]
pub(crate) struct SessionShared {
    pub state: SessionState,
    pub settings: DeviceSettings,
    pub schema: PacketSchema,
    pub stats: SessionStats,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            settings: DeviceSettings::default(),
            schema: PacketSchema::empty(SchemaContext::new(HardwareGeneration::Shimmer2r)),
            stats: SessionStats::default(),
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<SessionShared>>;

pub(crate) fn lock(shared: &SharedState) -> MutexGuard<'_, SessionShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messages from the handle to the protocol worker.
pub(crate) enum Control {
    Connect,
    Disconnect,
    Enqueue(Vec<CommandKind>),
    SetOrientationFusion(bool),
    AttachFilter(Box<dyn OrientationFilter>),
    SetGyroOnTheFly(Option<GyroOnTheFly>),
    Notify(Notification),
    Shutdown,
}

/// Handle to one device session.
pub struct ShimmerSession {
    config: SessionConfig,
    shared: SharedState,
    control: flume::Sender<Control>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ShimmerSession {
    /// Create a session around `transport`. Nothing is opened until
    /// [`connect`](Self::connect). The receiver gets `SensorCreated` first.
    pub fn new(
        config: SessionConfig,
        transport: Box<dyn Transport>,
    ) -> Result<(Self, mpsc::Receiver<SensorEvent>), ShimmerError> {
        config.validate()?;
        schema::validate_channel_table()?;

        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        event_tx
            .try_send(SensorEvent::SensorCreated {
                device_name: config.device_name.clone(),
            })
            .map_err(|e| ShimmerError::Configuration(format!("Event channel unusable: {}", e)))?;

        let shared = Arc::new(Mutex::new(SessionShared::new()));
        let (control_tx, control_rx) = flume::unbounded();
        let worker = Worker::new(config.clone(), transport, Arc::clone(&shared), control_rx, event_tx);
        let handle = thread::Builder::new()
            .name("shimmer-worker".to_string())
            .spawn(move || worker.run())?;

        info!("Session '{}' created", config.device_name);
        Ok((
            Self {
                config,
                shared,
                control: control_tx,
                worker: Some(handle),
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared).state
    }

    /// The last device-confirmed settings.
    pub fn settings(&self) -> DeviceSettings {
        lock(&self.shared).settings.clone()
    }

    pub fn firmware(&self) -> Option<FirmwareVersion> {
        lock(&self.shared).settings.firmware
    }

    pub fn generation(&self) -> Option<HardwareGeneration> {
        lock(&self.shared).settings.generation
    }

    /// The live packet schema.
    pub fn schema(&self) -> PacketSchema {
        lock(&self.shared).schema.clone()
    }

    pub fn stats(&self) -> SessionStats {
        lock(&self.shared).stats.clone()
    }

    fn send(&self, message: Control) -> Result<(), ShimmerError> {
        self.control
            .send(message)
            .map_err(|_| ShimmerError::Transport("Protocol worker has stopped".to_string()))
    }

    fn enqueue(&self, commands: Vec<CommandKind>) -> Result<(), ShimmerError> {
        debug!("Queueing {:?}", commands);
        self.send(Control::Enqueue(commands))
    }

    fn require_state(&self, allowed: &[SessionState], expected: &'static str) -> Result<(), ShimmerError> {
        let actual = self.state();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(ShimmerError::InvalidState { expected, actual })
        }
    }

    fn require_connected(&self) -> Result<(DeviceSettings, HardwareGeneration), ShimmerError> {
        let guard = lock(&self.shared);
        if guard.state != SessionState::Connected {
            return Err(ShimmerError::InvalidState {
                expected: "Connected",
                actual: guard.state,
            });
        }
        let generation = known_generation(&guard.settings, guard.state)?;
        Ok((guard.settings.clone(), generation))
    }

    fn require_active(&self) -> Result<(DeviceSettings, HardwareGeneration), ShimmerError> {
        let guard = lock(&self.shared);
        if !matches!(guard.state, SessionState::Connected | SessionState::Streaming) {
            return Err(ShimmerError::InvalidState {
                expected: "Connected or Streaming",
                actual: guard.state,
            });
        }
        let generation = known_generation(&guard.settings, guard.state)?;
        Ok((guard.settings.clone(), generation))
    }

    /// Open the transport and run bring-up.
    pub fn connect(&self) -> Result<(), ShimmerError> {
        self.require_state(&[SessionState::Disconnected], "Disconnected")?;
        self.send(Control::Connect)
    }

    /// Cancel anything in flight and close the transport.
    pub fn disconnect(&self) -> Result<(), ShimmerError> {
        if self.state() == SessionState::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return Ok(());
        }
        self.send(Control::Disconnect)
    }

    pub fn start_streaming(&self) -> Result<(), ShimmerError> {
        self.require_connected()?;
        if lock(&self.shared).schema.channels.is_empty() {
            warn!("Starting to stream with no channels enabled");
        }
        self.enqueue(vec![CommandKind::StartStreaming])
    }

    pub fn stop_streaming(&self) -> Result<(), ShimmerError> {
        self.require_state(&[SessionState::Streaming], "Streaming")?;
        self.enqueue(vec![CommandKind::StopStreaming])
    }

    /// Set a measurement range. Accelerometer, gyroscope and GSR ranges may
    /// change while streaming; the magnetometer gain needs streaming stopped.
    pub fn set_sensor_range(&self, kind: SensorKind, value: u8) -> Result<(), ShimmerError> {
        let (_, generation) = match kind {
            SensorKind::Mag => self.require_connected()?,
            _ => self.require_active()?,
        };
        self.enqueue(range_commands(generation, kind, value)?)
    }

    /// Replace the enabled-sensor bitmap. A conflicting combination is
    /// rejected and the current selection stays as it is.
    pub fn set_enabled_sensors(&self, bitmap: u32) -> Result<(), ShimmerError> {
        let (settings, generation) = self.require_connected()?;
        match sensor_commands(generation, bitmap, &settings) {
            Ok(commands) => self.enqueue(commands),
            Err(e) => {
                warn!("Rejected sensor selection: {}", e);
                self.send(Control::Notify(Notification::new(
                    NotificationKind::SensorConflict,
                    e.to_string(),
                )))?;
                Err(e)
            }
        }
    }

    pub fn set_sampling_rate(&self, hz: f64) -> Result<(), ShimmerError> {
        let (settings, generation) = self.require_connected()?;
        self.enqueue(sampling_rate_commands(generation, hz, &settings)?)
    }

    pub fn set_low_power_mode(&self, kind: LowPowerKind, enabled: bool) -> Result<(), ShimmerError> {
        let (settings, generation) = self.require_active()?;
        let command = match kind {
            LowPowerKind::Accel if !generation.is_legacy() => CommandKind::SetAccelLowPower(enabled),
            LowPowerKind::Gyro if !generation.is_legacy() => CommandKind::SetGyroSamplingRate {
                setting: gyro_rate_setting(settings.sampling_rate_hz, enabled),
                low_power: enabled,
            },
            LowPowerKind::Mag => CommandKind::SetMagSamplingRate {
                setting: mag_rate_setting(generation, settings.sampling_rate_hz, enabled),
                low_power: enabled,
            },
            _ => {
                return Err(ShimmerError::Configuration(format!(
                    "{:?} low-power mode is not available on {}",
                    kind, generation
                )))
            }
        };
        self.enqueue(vec![command])
    }

    /// Turn quaternion output on or off. Takes effect once a filter is
    /// attached.
    pub fn enable_orientation_fusion(&self, enabled: bool) -> Result<(), ShimmerError> {
        self.send(Control::SetOrientationFusion(enabled))
    }

    pub fn attach_orientation_filter(&self, filter: Box<dyn OrientationFilter>) -> Result<(), ShimmerError> {
        self.send(Control::AttachFilter(filter))
    }

    /// Re-estimate the gyroscope offset whenever the device is at rest.
    pub fn enable_gyro_on_the_fly_calibration(&self, config: &GyroOnTheFlyConfig) -> Result<(), ShimmerError> {
        let estimator = config
            .enabled
            .then(|| GyroOnTheFly::new(config.window, config.threshold_dps));
        self.send(Control::SetGyroOnTheFly(estimator))
    }

    /// Shimmer3 only: select the accelerometer sub-mode.
    pub fn set_accel_sub_mode(&self, mode: AccelSubMode) -> Result<(), ShimmerError> {
        let (settings, generation) = self.require_connected()?;
        self.enqueue(sub_mode_commands(generation, mode, &settings)?)
    }

    pub fn toggle_led(&self) -> Result<(), ShimmerError> {
        self.require_active()?;
        self.enqueue(vec![CommandKind::ToggleLed])
    }

    /// Shimmer2/2r only. Expansion A7 shares the regulator's pin.
    pub fn set_5v_regulator(&self, enabled: bool) -> Result<(), ShimmerError> {
        let (settings, generation) = self.require_connected()?;
        if !generation.is_legacy() {
            return Err(ShimmerError::Configuration(format!(
                "{} has no switchable 5V regulator",
                generation
            )));
        }
        if enabled && settings.enabled_sensors & sensors::LEGACY_EXP_A7 != 0 {
            return Err(ShimmerError::SensorConflict {
                requested: settings.enabled_sensors,
                reason: "expansion A7 is enabled and shares its pin with the 5V regulator".to_string(),
            });
        }
        self.enqueue(vec![CommandKind::SetFiveVoltRegulator(enabled)])
    }

    /// Shimmer3 only.
    pub fn set_internal_exp_power(&self, enabled: bool) -> Result<(), ShimmerError> {
        let (_, generation) = self.require_connected()?;
        if generation.is_legacy() {
            return Err(ShimmerError::Configuration(format!(
                "{} has no internal expansion power switch",
                generation
            )));
        }
        self.enqueue(vec![CommandKind::SetInternalExpPower(enabled)])
    }

    pub fn set_blink_led(&self, value: u8) -> Result<(), ShimmerError> {
        self.require_connected()?;
        self.enqueue(vec![CommandKind::SetBlinkLed(value)])
    }

    /// Number of samples the device packs before sending.
    pub fn set_buffer_size(&self, samples: u8) -> Result<(), ShimmerError> {
        self.require_connected()?;
        if samples == 0 {
            return Err(ShimmerError::Configuration("Buffer size must be at least 1".to_string()));
        }
        self.enqueue(vec![CommandKind::SetBufferSize(samples)])
    }

    /// Re-read the device's configuration into the settings mirror.
    pub fn refresh_settings(&self) -> Result<(), ShimmerError> {
        let (_, generation) = self.require_connected()?;
        self.enqueue(refresh_commands(generation))
    }

    /// Capabilities of the connected generation, or of the whole family
    /// before bring-up has identified the hardware.
    pub fn capabilities(&self) -> Vec<HardwareCapability> {
        capabilities_for(self.generation())
    }
}

impl Sensor for ShimmerSession {
    fn connect(&mut self) -> Result<(), SensorError> {
        ShimmerSession::connect(self).map_err(Into::into)
    }

    fn disconnect(&mut self) -> Result<(), SensorError> {
        ShimmerSession::disconnect(self).map_err(Into::into)
    }

    fn start_streaming(&mut self) -> Result<(), SensorError> {
        ShimmerSession::start_streaming(self).map_err(Into::into)
    }

    fn stop_streaming(&mut self) -> Result<(), SensorError> {
        ShimmerSession::stop_streaming(self).map_err(Into::into)
    }

    fn provided_capabilities(&self) -> Vec<HardwareCapability> {
        self.capabilities()
    }
}

impl Drop for ShimmerSession {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("Protocol worker panicked");
            }
        }
        debug!("Session '{}' dropped", self.config.device_name);
    }
}

fn known_generation(settings: &DeviceSettings, state: SessionState) -> Result<HardwareGeneration, ShimmerError> {
    settings.generation.ok_or(ShimmerError::InvalidState {
        expected: "identified hardware",
        actual: state,
    })
}

pub(crate) fn range_commands(
    generation: HardwareGeneration,
    kind: SensorKind,
    value: u8,
) -> Result<Vec<CommandKind>, ShimmerError> {
    check_range(generation, kind, value)?;
    Ok(vec![match kind {
        SensorKind::Accel => CommandKind::SetAccelRange(value),
        SensorKind::Gyro => CommandKind::SetGyroRange(value),
        SensorKind::Mag => CommandKind::SetMagGain(value),
        SensorKind::Gsr => CommandKind::SetGsrRange(value),
    }])
}

/// Conflict-check a selection and build the commands that apply it: a PMUX
/// change when the selection needs one, the sensor bitmap, then an inquiry
/// so the device confirms the new channel list.
pub(crate) fn sensor_commands(
    generation: HardwareGeneration,
    bitmap: u32,
    settings: &DeviceSettings,
) -> Result<Vec<CommandKind>, ShimmerError> {
    let selection = check_sensor_selection(generation, bitmap, settings.five_volt_regulator)?;
    let mut commands = Vec::with_capacity(3);
    if let Some(pmux) = selection.pmux {
        if pmux != settings.pmux {
            commands.push(CommandKind::SetPmux(pmux));
        }
    }
    commands.push(CommandKind::SetSensors(selection.bitmap));
    commands.push(CommandKind::Inquiry);
    Ok(commands)
}

/// Sampling-rate change. On Shimmer3 the gyroscope and magnetometer internal
/// rates follow the new rate.
pub(crate) fn sampling_rate_commands(
    generation: HardwareGeneration,
    hz: f64,
    settings: &DeviceSettings,
) -> Result<Vec<CommandKind>, ShimmerError> {
    if !(hz.is_finite() && hz > 0.0) {
        return Err(ShimmerError::Configuration(format!(
            "Sampling rate must be positive, got {}",
            hz
        )));
    }
    let mut commands = vec![CommandKind::SetSamplingRate(hz)];
    if !generation.is_legacy() {
        let effective = effective_sampling_rate(generation, hz);
        commands.push(CommandKind::SetGyroSamplingRate {
            setting: gyro_rate_setting(effective, settings.gyro_low_power),
            low_power: settings.gyro_low_power,
        });
        commands.push(CommandKind::SetMagSamplingRate {
            setting: mag_rate_setting(generation, effective, settings.mag_low_power),
            low_power: settings.mag_low_power,
        });
    }
    Ok(commands)
}

pub(crate) fn sub_mode_commands(
    generation: HardwareGeneration,
    mode: AccelSubMode,
    settings: &DeviceSettings,
) -> Result<Vec<CommandKind>, ShimmerError> {
    if generation.is_legacy() {
        return Err(ShimmerError::Configuration(format!(
            "Accelerometer sub-modes are not available on {}",
            generation
        )));
    }
    let mut updated = settings.clone();
    updated.accel_sub_mode = mode;
    Ok(vec![
        CommandKind::SetConfigBytes(updated.config_bytes(generation)),
        CommandKind::Inquiry,
    ])
}

pub(crate) fn refresh_commands(generation: HardwareGeneration) -> Vec<CommandKind> {
    let mut commands = vec![
        CommandKind::ReadSamplingRate,
        CommandKind::ReadConfigBytes,
        CommandKind::ReadGsrRange,
        CommandKind::ReadBufferSize,
        CommandKind::ReadBlinkLed,
    ];
    if generation != HardwareGeneration::Shimmer2 {
        commands.extend([CommandKind::ReadMagGain, CommandKind::ReadMagSamplingRate]);
    }
    if generation == HardwareGeneration::Shimmer3 {
        commands.extend([CommandKind::ReadAccelRange, CommandKind::ReadGyroRange]);
    }
    commands
}

/// Configuration pushed at the end of bring-up, in dependency order.
/// Entries that fail validation are skipped and returned as errors.
pub(crate) fn setup_commands(
    generation: HardwareGeneration,
    setup: &DeviceSetup,
    settings: &DeviceSettings,
) -> (Vec<CommandKind>, Vec<ShimmerError>) {
    let mut commands = Vec::new();
    let mut rejected = Vec::new();
    let mut push = |result: Result<Vec<CommandKind>, ShimmerError>| match result {
        Ok(cmds) => commands.extend(cmds),
        Err(e) => rejected.push(e),
    };

    let ranges = [
        (SensorKind::Accel, setup.accel_range),
        (SensorKind::Gyro, setup.gyro_range),
        (SensorKind::Mag, setup.mag_gain),
        (SensorKind::Gsr, setup.gsr_range),
    ];
    for (kind, value) in ranges {
        if let Some(value) = value {
            push(range_commands(generation, kind, value));
        }
    }
    if let Some(mode) = setup.accel_sub_mode {
        let mut staged = settings.clone();
        for (kind, value) in ranges {
            match (kind, value) {
                (SensorKind::Accel, Some(v)) => staged.accel_range = v,
                (SensorKind::Gyro, Some(v)) => staged.gyro_range = v,
                (SensorKind::Mag, Some(v)) => staged.mag_gain = v,
                (SensorKind::Gsr, Some(v)) => staged.gsr_range = v,
                _ => {}
            }
        }
        // The trailing inquiry is added once at the end of bring-up.
        push(sub_mode_commands(generation, mode, &staged).map(|mut cmds| {
            cmds.retain(|c| *c != CommandKind::Inquiry);
            cmds
        }));
    }
    if let Some(bitmap) = setup.enabled_sensors {
        push(sensor_commands(generation, bitmap, settings).map(|mut cmds| {
            cmds.retain(|c| *c != CommandKind::Inquiry);
            cmds
        }));
    }
    if let Some(hz) = setup.sampling_rate_hz {
        push(sampling_rate_commands(generation, hz, settings));
    }
    (commands, rejected)
}

pub(crate) fn capabilities_for(generation: Option<HardwareGeneration>) -> Vec<HardwareCapability> {
    use HardwareCapability as C;
    let mut caps = vec![C::Accelerometer, C::Gyroscope, C::Magnetometer, C::Gsr, C::ExternalAdc];
    match generation {
        Some(HardwareGeneration::Shimmer2) => {
            caps.extend([C::Ecg, C::Emg, C::StrainGauge, C::HeartRate]);
        }
        Some(HardwareGeneration::Shimmer2r) => {
            caps.extend([C::Ecg, C::Emg, C::StrainGauge, C::HeartRate, C::Battery]);
        }
        Some(HardwareGeneration::Shimmer3) => {
            caps.extend([C::Ecg, C::Emg, C::StrainGauge, C::Battery, C::OrientationFusion]);
        }
        None => {
            caps.extend([
                C::Ecg,
                C::Emg,
                C::StrainGauge,
                C::HeartRate,
                C::Battery,
                C::OrientationFusion,
            ]);
        }
    }
    caps
}
