use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use log::{debug, info, trace, warn};

use super::data_generator::{stored_calibration, SignalGenerator};
use crate::protocol::*;
use crate::schema::{self, ChannelDescriptor, SchemaContext, TIMESTAMP_BYTES};
use crate::sensors;
use crate::transport::Transport;
use crate::types::{DeviceSettings, FirmwareVersion, HardwareGeneration, ShimmerError};

/// How the simulated device behaves.
#[derive(Debug, Clone)]
pub struct MockDeviceOptions {
    pub generation: HardwareGeneration,
    /// `None` simulates firmware too old to answer the version query.
    pub firmware: Option<FirmwareVersion>,
    /// Report stored calibration; otherwise every block reads as unset.
    pub calibrated: bool,
    pub enabled_sensors: u32,
    pub sampling_rate_hz: f64,
    /// Stop answering after this many commands.
    pub silent_after: Option<usize>,
    /// Insert one stray byte in front of this frame.
    pub corrupt_at_frame: Option<u64>,
    /// Refuse to open.
    pub fail_open: bool,
    /// Answer STOP_STREAMING by cutting the last frame short and never
    /// sending the ACK.
    pub lose_stop_ack: bool,
    /// Most frames produced by one read, so a stalled reader cannot flood.
    pub max_burst: u64,
    pub seed: u64,
}

impl Default for MockDeviceOptions {
    fn default() -> Self {
        Self {
            generation: HardwareGeneration::Shimmer3,
            firmware: Some(FirmwareVersion {
                identifier: 3,
                major: 0,
                minor: 8,
                internal: 0,
            }),
            calibrated: true,
            enabled_sensors: sensors::S3_LN_ACCEL | sensors::S3_GYRO | sensors::S3_MAG,
            sampling_rate_hz: 51.2,
            silent_after: None,
            corrupt_at_frame: None,
            fail_open: false,
            lose_stop_ack: false,
            max_burst: 64,
            seed: 42,
        }
    }
}

impl MockDeviceOptions {
    /// A Shimmer2r with the firmware of its era.
    pub fn shimmer2r() -> Self {
        Self {
            generation: HardwareGeneration::Shimmer2r,
            firmware: Some(FirmwareVersion {
                identifier: 1,
                major: 1,
                minor: 2,
                internal: 0,
            }),
            enabled_sensors: sensors::LEGACY_ACCEL | sensors::LEGACY_GYRO,
            ..Self::default()
        }
    }
}

struct StreamClock {
    started: Instant,
    frames_sent: u64,
    channels: Vec<ChannelDescriptor>,
}

struct MockInner {
    options: MockDeviceOptions,
    settings: DeviceSettings,
    mag_rate: u8,
    open: bool,
    output: VecDeque<u8>,
    commands: Vec<Vec<u8>>,
    stream: Option<StreamClock>,
    corrupted: bool,
    generator: SignalGenerator,
}

/// A simulated Shimmer on the far side of a [`Transport`].
///
/// Every `write` is taken as one complete command and answered the way the
/// firmware would: an ACK, then the response if the command has one. While
/// streaming, frames are produced on `read_available` at the configured rate.
/// Clones share the same device, so a test can keep one to inspect.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<MockInner>>,
}

impl MockDevice {
    pub fn new(options: MockDeviceOptions) -> Self {
        let generation = options.generation;
        let settings = DeviceSettings {
            generation: Some(generation),
            firmware: options.firmware,
            sampling_rate_hz: effective_sampling_rate(generation, options.sampling_rate_hz),
            enabled_sensors: options.enabled_sensors,
            // Internal sensor rates the session only carries through.
            raw_config: match generation {
                HardwareGeneration::Shimmer3 => vec![0x40, 0x9B, 0x10, 0x00],
                _ => Vec::new(),
            },
            ..DeviceSettings::default()
        };
        let inner = MockInner {
            generator: SignalGenerator::new(generation, options.seed),
            options,
            settings,
            mag_rate: 4,
            open: false,
            output: VecDeque::new(),
            commands: Vec::new(),
            stream: None,
            corrupted: false,
        };
        info!("MockDevice created: {}", generation);
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command written so far, in order.
    pub fn commands_received(&self) -> Vec<Vec<u8>> {
        self.lock().commands.clone()
    }

    pub fn opcodes_received(&self) -> Vec<u8> {
        self.lock().commands.iter().filter_map(|c| c.first().copied()).collect()
    }

    /// The device's own view of its configuration.
    pub fn device_settings(&self) -> DeviceSettings {
        self.lock().settings.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().stream.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new(MockDeviceOptions::default())
    }
}

impl MockInner {
    fn generation(&self) -> HardwareGeneration {
        self.options.generation
    }

    fn context(&self) -> SchemaContext {
        SchemaContext {
            generation: self.generation(),
            accel_mode: self.settings.accel_sub_mode,
            pmux: self.settings.pmux,
        }
    }

    fn channel_ids(&self) -> Vec<u8> {
        schema::channels_for_sensors(self.context(), self.settings.enabled_sensors)
    }

    fn hardware_id(&self) -> u8 {
        match self.generation() {
            HardwareGeneration::Shimmer2 => 1,
            HardwareGeneration::Shimmer2r => 2,
            HardwareGeneration::Shimmer3 => 3,
        }
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.output.extend(bytes.iter().copied());
    }

    fn ack(&mut self) {
        self.output.push_back(ACK);
    }

    fn respond(&mut self, response: &[u8]) {
        self.ack();
        self.reply(response);
    }

    fn calibration_payload(&self, group: CalibrationGroup) -> Vec<u8> {
        let generation = self.generation();
        let len = group.payload_len(generation);
        if !self.options.calibrated {
            return vec![0xFF; len];
        }
        let stored = stored_calibration(generation);
        let start = match group {
            CalibrationGroup::All | CalibrationGroup::Accel => 0,
            CalibrationGroup::Gyro => INERTIAL_CALIBRATION_LEN,
            CalibrationGroup::Mag => 2 * INERTIAL_CALIBRATION_LEN,
            CalibrationGroup::Emg if generation.is_legacy() => 3 * INERTIAL_CALIBRATION_LEN,
            CalibrationGroup::Ecg if generation.is_legacy() => 3 * INERTIAL_CALIBRATION_LEN + EMG_CALIBRATION_LEN,
            CalibrationGroup::Emg | CalibrationGroup::Ecg => return vec![0xFF; len],
        };
        stored
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0xFF; len])
    }

    fn inquiry(&self) -> Vec<u8> {
        let generation = self.generation();
        let ids = self.channel_ids();
        let mut bytes = vec![INQUIRY_RESPONSE];
        bytes.extend(encode_sampling_rate(generation, self.settings.sampling_rate_hz));
        if generation.is_legacy() {
            bytes.push(self.settings.accel_range);
        }
        bytes.extend(self.settings.config_bytes(generation));
        bytes.push(ids.len() as u8);
        bytes.push(self.settings.buffer_size);
        bytes.extend(ids);
        bytes
    }

    fn handle_command(&mut self, command: &[u8]) {
        let Some((&opcode, payload)) = command.split_first() else {
            return;
        };
        let generation = self.generation();
        let arg = payload.first().copied().unwrap_or(0);
        let flag = arg != 0;

        // Calibration reads share one shape.
        let groups = [
            CalibrationGroup::Accel,
            CalibrationGroup::Gyro,
            CalibrationGroup::Mag,
            CalibrationGroup::Emg,
            CalibrationGroup::Ecg,
            CalibrationGroup::All,
        ];
        if let Some(group) = groups.into_iter().find(|g| g.command() == opcode) {
            let mut response = vec![group.response()];
            response.extend(self.calibration_payload(group));
            self.respond(&response);
            return;
        }

        match opcode {
            GET_SAMPLING_RATE_COMMAND => {
                let mut response = vec![SAMPLING_RATE_RESPONSE];
                response.extend(encode_sampling_rate(generation, self.settings.sampling_rate_hz));
                self.respond(&response);
            }
            GET_FW_VERSION_COMMAND => match self.options.firmware {
                Some(fw) => {
                    let mut response = vec![FW_VERSION_RESPONSE];
                    response.extend(fw.identifier.to_le_bytes());
                    response.extend(fw.major.to_le_bytes());
                    response.push(fw.minor);
                    response.push(fw.internal);
                    self.respond(&response);
                }
                None => debug!("MockDevice: firmware too old to report its version"),
            },
            GET_HW_VERSION_COMMAND => {
                let id = self.hardware_id();
                self.respond(&[HW_VERSION_RESPONSE, id]);
            }
            GET_ACCEL_RANGE_COMMAND => self.respond(&[ACCEL_RANGE_RESPONSE, self.settings.accel_range]),
            GET_GYRO_RANGE_COMMAND => self.respond(&[GYRO_RANGE_RESPONSE, self.settings.gyro_range]),
            GET_MAG_GAIN_COMMAND => self.respond(&[MAG_GAIN_RESPONSE, self.settings.mag_gain]),
            GET_GSR_RANGE_COMMAND => self.respond(&[GSR_RANGE_RESPONSE, self.settings.gsr_range]),
            GET_BUFFER_SIZE_COMMAND => self.respond(&[BUFFER_SIZE_RESPONSE, self.settings.buffer_size]),
            GET_BLINK_LED_COMMAND => self.respond(&[BLINK_LED_RESPONSE, self.settings.blink_led]),
            GET_MAG_SAMPLING_RATE_COMMAND => self.respond(&[MAG_SAMPLING_RATE_RESPONSE, self.mag_rate]),
            GET_CONFIG_BYTES_COMMAND => {
                let mut response = vec![CONFIG_BYTES_RESPONSE];
                response.extend(self.settings.config_bytes(generation));
                self.respond(&response);
            }
            INQUIRY_COMMAND => {
                let response = self.inquiry();
                self.respond(&response);
            }
            SET_SAMPLING_RATE_COMMAND => {
                self.settings.sampling_rate_hz = decode_sampling_rate(generation, payload);
                self.ack();
            }
            SET_SENSORS_COMMAND => {
                let mut le = [0u8; 4];
                for (dst, src) in le.iter_mut().zip(payload) {
                    *dst = *src;
                }
                self.settings.enabled_sensors = u32::from_le_bytes(le);
                self.ack();
            }
            SET_ACCEL_RANGE_COMMAND => {
                self.settings.accel_range = arg;
                self.ack();
            }
            SET_GYRO_RANGE_COMMAND => {
                self.settings.gyro_range = arg;
                self.ack();
            }
            SET_MAG_GAIN_COMMAND => {
                self.settings.mag_gain = arg;
                self.ack();
            }
            SET_GSR_RANGE_COMMAND => {
                self.settings.gsr_range = arg;
                self.ack();
            }
            SET_CONFIG_BYTES_COMMAND => {
                self.settings.apply_config_bytes(generation, payload);
                self.ack();
            }
            SET_ACCEL_LOW_POWER_COMMAND => {
                self.settings.accel_low_power = flag;
                self.ack();
            }
            SET_GYRO_SAMPLING_RATE_COMMAND => {
                self.settings.gyro_low_power = arg == 0xFF;
                self.ack();
            }
            SET_MAG_SAMPLING_RATE_COMMAND => {
                self.mag_rate = arg;
                self.ack();
            }
            SET_5V_REGULATOR_COMMAND => {
                self.settings.five_volt_regulator = flag;
                self.ack();
            }
            SET_PMUX_COMMAND => {
                self.settings.pmux = flag;
                self.ack();
            }
            SET_INTERNAL_EXP_POWER_COMMAND => {
                self.settings.internal_exp_power = flag;
                self.ack();
            }
            SET_BLINK_LED_COMMAND => {
                self.settings.blink_led = arg;
                self.ack();
            }
            SET_BUFFER_SIZE_COMMAND => {
                self.settings.buffer_size = arg;
                self.ack();
            }
            TOGGLE_LED_COMMAND => self.ack(),
            START_STREAMING_COMMAND => {
                self.ack();
                self.start_stream();
            }
            STOP_STREAMING_COMMAND => {
                let Some(clock) = self.stream.take() else {
                    self.ack();
                    return;
                };
                debug!("MockDevice: stopped after {} frames", clock.frames_sent);
                if self.options.lose_stop_ack {
                    self.reply(&[DATA_PACKET, 0x5A, 0x01, 0x7F]);
                    debug!("MockDevice: stop ACK lost");
                } else {
                    self.ack();
                }
            }
            other => warn!("MockDevice: ignoring unknown opcode 0x{:02X}", other),
        }
    }

    fn start_stream(&mut self) {
        let ctx = self.context();
        let channels: Vec<ChannelDescriptor> = self
            .channel_ids()
            .into_iter()
            .filter_map(|id| match schema::descriptor(ctx, id) {
                Ok(desc) => Some(desc),
                Err(e) => {
                    warn!("MockDevice: {}", e);
                    None
                }
            })
            .collect();
        let frame_len: usize = TIMESTAMP_BYTES + channels.iter().map(|c| c.encoding.width).sum::<usize>();
        debug!(
            "MockDevice: streaming {} channels, {} byte frames at {:.2} Hz",
            channels.len(),
            frame_len,
            self.settings.sampling_rate_hz
        );
        self.stream = Some(StreamClock {
            started: Instant::now(),
            frames_sent: 0,
            channels,
        });
    }

    /// Produce every frame due by `now`, capped at `max_burst`.
    fn produce_frames(&mut self, now: Instant) {
        let rate = self.settings.sampling_rate_hz;
        let tick_hz = self.generation().tick_frequency_hz();
        let max_burst = self.options.max_burst;
        let corrupt_at = self.options.corrupt_at_frame;
        let Some(clock) = self.stream.as_mut() else {
            return;
        };
        if rate <= 0.0 {
            return;
        }
        let due = (now.duration_since(clock.started).as_secs_f64() * rate).floor() as u64;
        let target = due.min(clock.frames_sent + max_burst);
        let mut bytes = Vec::new();
        for index in clock.frames_sent..target {
            if corrupt_at == Some(index) && !self.corrupted {
                trace!("MockDevice: corrupting stream before frame {}", index);
                bytes.push(0x5A);
                self.corrupted = true;
            }
            bytes.push(DATA_PACKET);
            let ticks = (index as f64 * tick_hz / rate).round() as u64;
            let timestamp = (ticks & 0xFFFF) as u16;
            self.generator
                .frame_payload(&clock.channels, timestamp, index as f64 / rate, &mut bytes);
        }
        clock.frames_sent = clock.frames_sent.max(target);
        self.output.extend(bytes);
    }
}

impl Transport for MockDevice {
    fn open(&mut self) -> Result<(), ShimmerError> {
        let mut inner = self.lock();
        if inner.options.fail_open {
            return Err(ShimmerError::Transport("MockDevice refused to open".to_string()));
        }
        inner.open = true;
        inner.output.clear();
        debug!("MockDevice opened");
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ShimmerError> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(ShimmerError::Transport("MockDevice is closed".to_string()));
        }
        inner.commands.push(bytes.to_vec());
        if let Some(limit) = inner.options.silent_after {
            if inner.commands.len() > limit {
                trace!("MockDevice: silent, ignoring {:02X?}", bytes);
                return Ok(());
            }
        }
        // Anything already due goes out first so replies land on a frame
        // boundary.
        inner.produce_frames(Instant::now());
        inner.handle_command(bytes);
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ShimmerError> {
        let mut inner = self.lock();
        if !inner.open {
            return Err(ShimmerError::Transport("MockDevice is closed".to_string()));
        }
        let silent = inner
            .options
            .silent_after
            .map_or(false, |limit| inner.commands.len() > limit);
        if !silent {
            inner.produce_frames(Instant::now());
        }
        let n = buf.len().min(inner.output.len());
        for (dst, src) in buf.iter_mut().zip(inner.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<(), ShimmerError> {
        let mut inner = self.lock();
        inner.open = false;
        inner.stream = None;
        inner.output.clear();
        debug!("MockDevice closed");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock {}", self.lock().options.generation)
    }
}
