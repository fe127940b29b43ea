//! The protocol worker: one thread per session that owns the transport, the
//! instruction queue, the stream synchronizer and the calibration engine.
//!
//! Events leave through a bounded channel with `try_send` so a slow consumer
//! never blocks the byte stream. What the consumer has not taken yet waits in
//! a backlog; lifecycle events always stay there, sample frames are shed
//! once the backlog holds `frame_backlog` of them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, error, info, trace, warn};
use sensor_types::{Notification, NotificationKind, SensorEvent};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::{lock, setup_commands, Control, SharedState};
use crate::calibration::{CalibrationEngine, GyroOnTheFly};
use crate::command_queue::{Completion, InstructionQueue};
use crate::config::{FrameDropPolicy, SessionConfig};
use crate::protocol::{
    effective_sampling_rate, CalibrationGroup, CommandKind, InquiryResponse, PendingCommand,
    Response,
};
use crate::schema::{channels_for_sensors, PacketSchema, SchemaContext};
use crate::sync::{StreamSynchronizer, SyncEvent};
use crate::transport::Transport;
use crate::types::{
    DeviceSettings, FirmwareVersion, HardwareGeneration, SessionState, SessionStats, ShimmerError,
};

const READ_CHUNK: usize = 512;

/// Generation assumed until the device identifies itself. Probe responses
/// are parsed with its field widths.
const ASSUMED_GENERATION: HardwareGeneration = HardwareGeneration::Shimmer2r;

enum Flow {
    Continue,
    Exit,
}

pub(super) struct Worker {
    config: SessionConfig,
    transport: Box<dyn Transport>,
    open: bool,
    shared: SharedState,
    control: Receiver<Control>,
    events: mpsc::Sender<SensorEvent>,
    backlog: VecDeque<SensorEvent>,
    backlog_frames: usize,
    dropping: bool,
    state: SessionState,
    generation: HardwareGeneration,
    settings: DeviceSettings,
    schema: PacketSchema,
    stats: SessionStats,
    queue: InstructionQueue,
    sync: StreamSynchronizer,
    engine: CalibrationEngine,
}

impl Worker {
    pub(super) fn new(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        shared: SharedState,
        control: Receiver<Control>,
        events: mpsc::Sender<SensorEvent>,
    ) -> Self {
        let settings = DeviceSettings::default();
        let mut engine = CalibrationEngine::new(ASSUMED_GENERATION, &settings);
        if config.gyro_on_the_fly.enabled {
            engine.set_gyro_on_the_fly(Some(GyroOnTheFly::new(
                config.gyro_on_the_fly.window,
                config.gyro_on_the_fly.threshold_dps,
            )));
        }
        Self {
            queue: InstructionQueue::new(config.response_timeout()),
            sync: StreamSynchronizer::new(0, config.continuous_sync),
            schema: PacketSchema::empty(SchemaContext::new(ASSUMED_GENERATION)),
            config,
            transport,
            open: false,
            shared,
            control,
            events,
            backlog: VecDeque::new(),
            backlog_frames: 0,
            dropping: false,
            state: SessionState::Disconnected,
            generation: ASSUMED_GENERATION,
            settings,
            stats: SessionStats::default(),
            engine,
        }
    }

    pub(super) fn run(mut self) {
        debug!("Protocol worker started for {}", self.transport.describe());
        let mut buf = [0u8; READ_CHUNK];
        'run: loop {
            self.flush_backlog();

            if !self.open {
                // Nothing to poll: sleep until the handle says something.
                let message = if self.backlog.is_empty() {
                    self.control.recv().map_err(|_| RecvTimeoutError::Disconnected)
                } else {
                    self.control.recv_timeout(self.config.poll_interval())
                };
                match message {
                    Ok(message) => {
                        if let Flow::Exit = self.handle_control(message) {
                            break 'run;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'run,
                }
                continue;
            }

            loop {
                match self.control.try_recv() {
                    Ok(message) => {
                        if let Flow::Exit = self.handle_control(message) {
                            break 'run;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            }
            if !self.open {
                continue;
            }

            if self.service(&mut buf) == 0 {
                match self.control.recv_timeout(self.config.poll_interval()) {
                    Ok(message) => {
                        if let Flow::Exit = self.handle_control(message) {
                            break 'run;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'run,
                }
            }
        }
        self.disconnect(None);
        self.flush_backlog();
        debug!("Protocol worker exiting");
    }

    /// One pass over the open link: send the next command, take what arrived,
    /// then check the response timer. Returns the number of bytes read.
    fn service(&mut self, buf: &mut [u8]) -> usize {
        self.dispatch();
        if !self.open {
            return 0;
        }
        let received = match self.transport.read_available(buf) {
            Ok(n) => n,
            Err(e) => {
                self.fail(e.to_string());
                return 0;
            }
        };
        if received > 0 {
            self.on_bytes(&buf[..received]);
            self.publish_stats();
        }
        self.check_timeout();
        received
    }

    fn handle_control(&mut self, message: Control) -> Flow {
        match message {
            Control::Connect => self.connect(),
            Control::Disconnect => self.disconnect(None),
            Control::Enqueue(commands) => self.enqueue_all(commands),
            Control::SetOrientationFusion(enabled) => {
                if enabled && !self.engine.has_filter() {
                    warn!("Orientation fusion enabled but no filter is attached");
                }
                self.settings.orientation_fusion = enabled;
                self.publish();
            }
            Control::AttachFilter(filter) => {
                info!("Orientation filter attached");
                self.engine.attach_filter(filter);
            }
            Control::SetGyroOnTheFly(estimator) => {
                info!(
                    "Gyroscope on-the-fly calibration {}",
                    if estimator.is_some() { "enabled" } else { "disabled" }
                );
                self.engine.set_gyro_on_the_fly(estimator);
            }
            Control::Notify(notification) => self.emit(SensorEvent::Notification(notification)),
            Control::Shutdown => return Flow::Exit,
        }
        Flow::Continue
    }

    // Lifecycle

    fn connect(&mut self) {
        if self.state != SessionState::Disconnected {
            debug!("Connect ignored while {:?}", self.state);
            return;
        }
        self.set_state(SessionState::Connecting);
        if let Err(e) = self.transport.open() {
            error!("Failed to open {}: {}", self.transport.describe(), e);
            self.set_state(SessionState::Disconnected);
            self.emit(SensorEvent::Disconnected {
                reason: Some(e.to_string()),
            });
            return;
        }
        self.open = true;
        info!("Opened {}, starting bring-up", self.transport.describe());

        self.generation = ASSUMED_GENERATION;
        self.settings = DeviceSettings {
            orientation_fusion: self.settings.orientation_fusion,
            ..DeviceSettings::default()
        };
        self.schema = PacketSchema::empty(self.context());
        self.stats = SessionStats::default();
        self.queue.clear();
        self.sync.reset();
        self.engine.set_generation(self.generation, &self.settings);

        self.push(CommandKind::FlushProbe);
        self.push(CommandKind::FirmwareProbe);
        self.publish();
    }

    /// End the session. `reason` is set when an error ended it.
    fn disconnect(&mut self, reason: Option<String>) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("Discarded {} pending commands", dropped);
        }
        self.sync.reset();
        self.close_transport();
        self.set_state(SessionState::Disconnected);
        match &reason {
            Some(r) => error!("Session ended: {}", r),
            None => info!("Disconnected from {}", self.transport.describe()),
        }
        self.emit(SensorEvent::Disconnected { reason });
    }

    fn fail(&mut self, reason: String) {
        self.disconnect(Some(reason));
    }

    fn close_transport(&mut self) {
        if !self.open {
            return;
        }
        if let Err(e) = self.transport.close() {
            warn!("Error closing {}: {}", self.transport.describe(), e);
        }
        self.open = false;
    }

    /// Probes answered: run the generation-specific reads.
    fn begin_bring_up(&mut self, generation: HardwareGeneration) {
        info!("Bringing up {}", generation);
        self.generation = generation;
        self.settings.generation = Some(generation);
        self.engine.set_generation(generation, &self.settings);
        self.schema = PacketSchema::empty(self.context());

        let reads = match generation {
            HardwareGeneration::Shimmer2 => vec![
                CommandKind::ReadSamplingRate,
                CommandKind::ReadConfigBytes,
                CommandKind::ReadCalibration(CalibrationGroup::All),
            ],
            HardwareGeneration::Shimmer2r => vec![
                CommandKind::ReadSamplingRate,
                CommandKind::ReadMagGain,
                CommandKind::ReadConfigBytes,
                CommandKind::ReadCalibration(CalibrationGroup::All),
            ],
            HardwareGeneration::Shimmer3 => vec![
                CommandKind::ReadSamplingRate,
                CommandKind::ReadAccelRange,
                CommandKind::ReadGyroRange,
                CommandKind::ReadMagGain,
                CommandKind::ReadConfigBytes,
                CommandKind::ReadCalibration(CalibrationGroup::All),
            ],
        };
        for kind in reads {
            self.push(kind);
        }
    }

    /// Device state is known: push the configured setup, then let an inquiry
    /// confirm the channel list and finish bring-up.
    fn finish_bring_up(&mut self) {
        if let Some(setup) = self.config.setup.clone() {
            let (commands, rejected) = setup_commands(self.generation, &setup, &self.settings);
            for e in rejected {
                warn!("Skipping setup entry: {}", e);
                let kind = match e {
                    ShimmerError::SensorConflict { .. } => NotificationKind::SensorConflict,
                    _ => NotificationKind::Info,
                };
                self.notify(kind, e.to_string());
            }
            for kind in commands {
                self.push(kind);
            }
        }
        let inquiry = self.pending(CommandKind::Inquiry).completing_bring_up();
        self.queue.enqueue(inquiry);
    }

    fn begin_streaming(&mut self) {
        self.sync.set_continuous(self.config.continuous_sync);
        self.sync.set_frame_size(self.schema.frame_size);
        self.engine.set_sampling_rate(self.settings.sampling_rate_hz);
        self.engine.reset_stream();
        self.stats.packets_lost = 0;
        self.stats.reception_rate = 100.0;
        self.set_state(SessionState::Streaming);
        info!(
            "Streaming {} channels at {:.2} Hz ({} byte frames)",
            self.schema.channels.len(),
            self.settings.sampling_rate_hz,
            self.schema.frame_size
        );
        self.emit(SensorEvent::StartStreaming);
    }

    fn finish_streaming(&mut self) {
        self.sync.reset();
        self.set_state(SessionState::Connected);
        info!(
            "Streaming stopped after {} frames ({} lost, {} resyncs)",
            self.stats.frames_decoded, self.stats.packets_lost, self.stats.resyncs
        );
        self.emit(SensorEvent::StopStreaming);
    }

    // Commands

    fn pending(&self, kind: CommandKind) -> PendingCommand {
        PendingCommand::new(
            kind,
            self.generation,
            self.config.ack_timeout(),
            self.config.long_command_timeout(),
        )
    }

    fn push(&mut self, kind: CommandKind) {
        let command = self.pending(kind);
        self.queue.enqueue(command);
    }

    fn enqueue_all(&mut self, commands: Vec<CommandKind>) {
        if !matches!(self.state, SessionState::Connected | SessionState::Streaming) {
            warn!("Dropping {} commands while {:?}", commands.len(), self.state);
            self.notify(
                NotificationKind::Info,
                format!("Commands ignored while {:?}", self.state),
            );
            return;
        }
        if self.state == SessionState::Streaming {
            if let Some(kind) = commands.iter().find(|k| !k.allowed_while_streaming()) {
                warn!("{:?} needs streaming stopped", kind);
                self.notify(
                    NotificationKind::Info,
                    format!("{:?} rejected while streaming", kind),
                );
                return;
            }
        }
        for kind in commands {
            self.push(kind);
        }
    }

    fn dispatch(&mut self) {
        // Queued while Connected but behind StartStreaming.
        if self.state == SessionState::Streaming {
            while let Some(command) = self.queue.take_next_if(|c| !c.kind.allowed_while_streaming()) {
                warn!("Not sending {:?}: streaming started first", command.kind);
                self.notify(
                    NotificationKind::Info,
                    format!("{:?} rejected while streaming", command.kind),
                );
            }
        }
        if let Some(bytes) = self.queue.dispatch_next(Instant::now()) {
            if let Err(e) = self.transport.write(&bytes) {
                self.fail(e.to_string());
                return;
            }
            self.sync.set_ack_expected(self.queue.awaiting_ack());
        }
    }

    fn check_timeout(&mut self) {
        let Some(command) = self.queue.check_timeout(Instant::now()) else {
            return;
        };
        self.sync.set_ack_expected(false);
        match command.kind {
            CommandKind::FlushProbe => {
                warn!("Flush probe unanswered, continuing bring-up");
                self.notify(NotificationKind::ProtocolTimeout, "Flush probe unanswered");
            }
            CommandKind::FirmwareProbe => {
                let baseline = FirmwareVersion::legacy_baseline();
                warn!(
                    "Firmware version query unanswered, assuming firmware {} on {}",
                    baseline, ASSUMED_GENERATION
                );
                self.notify(
                    NotificationKind::ProtocolTimeout,
                    format!(
                        "Firmware version query unanswered; assuming firmware {} on {}",
                        baseline, ASSUMED_GENERATION
                    ),
                );
                self.settings.firmware = Some(baseline);
                self.begin_bring_up(ASSUMED_GENERATION);
                self.publish();
            }
            CommandKind::StopStreaming => {
                warn!("Stop streaming was not acknowledged, forcing Connected");
                self.notify(
                    NotificationKind::ProtocolTimeout,
                    "Stop streaming was not acknowledged",
                );
                self.finish_streaming();
            }
            _ => {
                let error = ShimmerError::ProtocolTimeout {
                    opcode: command.opcode(),
                };
                self.fail(error.to_string());
            }
        }
    }

    fn complete(&mut self, done: Completion) {
        self.sync.set_ack_expected(false);
        let Completion { command, response } = done;
        let completes_bring_up = command.completes_bring_up;
        trace!("Applying {:?}", command.kind);

        match (command.kind, response) {
            (CommandKind::FlushProbe, _) => debug!("Link flushed"),
            (CommandKind::FirmwareProbe, Some(Response::FirmwareVersion(firmware))) => {
                self.on_firmware(firmware)
            }
            (CommandKind::ReadHardwareVersion, Some(Response::HardwareVersion(id))) => {
                match HardwareGeneration::from_hardware_id(id) {
                    Some(generation) => self.begin_bring_up(generation),
                    None => self.fail(format!("Unsupported hardware version {}", id)),
                }
            }
            (_, Some(Response::SamplingRate(hz))) => self.apply_sampling_rate(hz, false),
            (_, Some(Response::AccelRange(range))) => {
                self.settings.accel_range = range;
                self.ranges_changed();
            }
            (_, Some(Response::GyroRange(range))) => {
                self.settings.gyro_range = range;
                self.ranges_changed();
            }
            (_, Some(Response::MagGain(gain))) => {
                self.settings.mag_gain = gain;
                self.ranges_changed();
            }
            (_, Some(Response::GsrRange(range))) => self.settings.gsr_range = range,
            (_, Some(Response::ConfigBytes(bytes))) => self.apply_config_bytes(&bytes),
            (_, Some(Response::BufferSize(samples))) => self.settings.buffer_size = samples,
            (_, Some(Response::BlinkLed(value))) => self.settings.blink_led = value,
            (_, Some(Response::MagSamplingRate(setting))) => {
                debug!("Magnetometer rate setting is {}", setting)
            }
            (_, Some(Response::Calibration { group, payload })) => self.on_calibration(group, &payload),
            (_, Some(Response::Inquiry(inquiry))) => self.on_inquiry(inquiry),
            (CommandKind::SetSamplingRate(hz), None) => {
                let effective = effective_sampling_rate(self.generation, hz);
                self.apply_sampling_rate(effective, true);
            }
            (CommandKind::SetSensors(bitmap), None) => {
                self.settings.enabled_sensors = bitmap;
                let ids = channels_for_sensors(self.context(), bitmap);
                self.install_schema(&ids);
            }
            (CommandKind::SetAccelRange(range), None) => {
                self.settings.accel_range = range;
                self.ranges_changed();
            }
            (CommandKind::SetGyroRange(range), None) => {
                self.settings.gyro_range = range;
                self.ranges_changed();
            }
            (CommandKind::SetMagGain(gain), None) => {
                self.settings.mag_gain = gain;
                self.ranges_changed();
            }
            (CommandKind::SetGsrRange(range), None) => self.settings.gsr_range = range,
            (CommandKind::SetConfigBytes(bytes), None) => self.apply_config_bytes(&bytes),
            (CommandKind::SetAccelLowPower(on), None) => self.settings.accel_low_power = on,
            (CommandKind::SetGyroSamplingRate { low_power, .. }, None) => {
                self.settings.gyro_low_power = low_power
            }
            (CommandKind::SetMagSamplingRate { low_power, .. }, None) => {
                self.settings.mag_low_power = low_power
            }
            (CommandKind::ToggleLed, None) => debug!("LED toggled"),
            (CommandKind::SetFiveVoltRegulator(on), None) => self.settings.five_volt_regulator = on,
            (CommandKind::SetPmux(on), None) => {
                self.settings.pmux = on;
                self.rebuild_schema();
            }
            (CommandKind::SetInternalExpPower(on), None) => self.settings.internal_exp_power = on,
            (CommandKind::SetBlinkLed(value), None) => self.settings.blink_led = value,
            (CommandKind::SetBufferSize(samples), None) => self.settings.buffer_size = samples,
            (CommandKind::StartStreaming, None) => self.begin_streaming(),
            (CommandKind::StopStreaming, None) => self.finish_streaming(),
            (kind, response) => warn!("Unexpected completion of {:?} with {:?}", kind, response),
        }

        if completes_bring_up && self.open && self.state == SessionState::Connecting {
            self.set_state(SessionState::Connected);
            info!(
                "Connected: {} with firmware {}",
                self.generation,
                self.settings
                    .firmware
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            self.emit(SensorEvent::Connected);
        } else {
            self.publish();
        }
    }

    fn on_firmware(&mut self, firmware: FirmwareVersion) {
        info!("Firmware {}", firmware);
        self.settings.firmware = Some(firmware);
        if firmware.supports_hardware_query() {
            self.push(CommandKind::ReadHardwareVersion);
        } else {
            info!("Firmware cannot report its hardware, assuming {}", ASSUMED_GENERATION);
            self.begin_bring_up(ASSUMED_GENERATION);
        }
    }

    fn on_calibration(&mut self, group: CalibrationGroup, payload: &[u8]) {
        let (unavailable, warnings) = self.engine.apply_calibration(&self.settings, group, payload);
        if !unavailable.is_empty() {
            let message = format!("No stored calibration for {}; using defaults", unavailable.join(", "));
            info!("{}", message);
            self.notify(NotificationKind::CalibrationUnavailable, message);
        }
        for warning in warnings {
            warn!("{}", warning);
            self.notify(NotificationKind::CalibrationUnavailable, warning);
        }
        if group == CalibrationGroup::All && self.state == SessionState::Connecting {
            self.finish_bring_up();
        }
    }

    fn on_inquiry(&mut self, inquiry: InquiryResponse) {
        let InquiryResponse {
            sampling_rate_hz,
            accel_range,
            config_bytes,
            buffer_size,
            channel_ids,
        } = inquiry;
        if let Some(range) = accel_range {
            self.settings.accel_range = range;
        }
        self.settings.apply_config_bytes(self.generation, &config_bytes);
        self.settings.buffer_size = buffer_size;
        let changed = (sampling_rate_hz - self.settings.sampling_rate_hz).abs() > 1e-6;
        self.apply_sampling_rate(sampling_rate_hz, changed && self.state != SessionState::Connecting);
        self.ranges_changed();
        if self.install_schema(&channel_ids) {
            self.settings.enabled_sensors = self.schema.sensor_bitmap();
        }
    }

    fn apply_sampling_rate(&mut self, hz: f64, announce: bool) {
        self.settings.sampling_rate_hz = hz;
        self.engine.set_sampling_rate(hz);
        if announce {
            info!("Sampling rate is now {:.3} Hz", hz);
            self.emit(SensorEvent::SamplingRateChanged(hz));
        }
    }

    fn apply_config_bytes(&mut self, bytes: &[u8]) {
        let before = self.context();
        self.settings.apply_config_bytes(self.generation, bytes);
        self.ranges_changed();
        if self.context() != before {
            self.rebuild_schema();
        }
    }

    /// Range and default-profile selection change together.
    fn ranges_changed(&mut self) {
        for warning in self.engine.on_range_change(&self.settings) {
            warn!("{}", warning);
            self.notify(NotificationKind::CalibrationUnavailable, warning);
        }
    }

    fn context(&self) -> SchemaContext {
        SchemaContext {
            generation: self.generation,
            accel_mode: self.settings.accel_sub_mode,
            pmux: self.settings.pmux,
        }
    }

    /// Replace the live schema. A channel list that cannot be described ends
    /// the session: the stream could not be framed.
    fn install_schema(&mut self, ids: &[u8]) -> bool {
        if self.state == SessionState::Streaming {
            warn!("Refusing to change the packet schema while streaming");
            self.notify(
                NotificationKind::SchemaMismatch,
                "Channel layout cannot change while streaming",
            );
            return false;
        }
        match PacketSchema::build(self.context(), ids) {
            Ok(schema) => {
                debug!(
                    "Packet schema: {} channels, {} byte frames",
                    schema.channels.len(),
                    schema.frame_size
                );
                self.schema = schema;
                true
            }
            Err(e) => {
                self.fail(format!("Cannot derive packet schema: {}", e));
                false
            }
        }
    }

    /// Same channel ids, new meaning (PMUX or sub-mode changed).
    fn rebuild_schema(&mut self) {
        let ids = self.schema.channel_ids();
        self.install_schema(&ids);
    }

    // Incoming bytes

    fn on_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if !self.open {
                return;
            }
            if self.state == SessionState::Streaming {
                if let Some(event) = self.sync.push(byte) {
                    self.on_sync_event(event);
                }
            } else if let Some(done) = self.queue.on_byte(byte, self.generation, Instant::now()) {
                self.complete(done);
            }
        }
    }

    fn on_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Frame(bytes) => self.on_frame(&bytes),
            SyncEvent::Ack => {
                if let Some(done) = self.queue.on_ack(Instant::now()) {
                    self.complete(done);
                }
                self.sync.set_ack_expected(self.queue.awaiting_ack());
            }
            SyncEvent::Desync(byte) => {
                self.stats.resyncs = self.sync.resync_count();
                debug!("Resynchronising after unexpected 0x{:02X}", byte);
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        match self.schema.decode(bytes) {
            Ok(raw) => {
                let frame = self.engine.calibrate(&self.schema, &raw, &self.settings);
                self.stats.frames_decoded += 1;
                self.stats.packets_lost = frame.metadata.packet_loss_count;
                self.stats.reception_rate = frame.metadata.reception_rate;
                self.emit(SensorEvent::Frame(Arc::new(frame)));
            }
            Err(e) => {
                self.stats.schema_mismatches += 1;
                warn!("Dropping frame: {}", e);
                self.notify(NotificationKind::SchemaMismatch, e.to_string());
            }
        }
    }

    // Outgoing events

    fn set_state(&mut self, state: SessionState) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
        lock(&self.shared).state = state;
    }

    fn publish(&self) {
        let mut shared = lock(&self.shared);
        shared.state = self.state;
        shared.settings = self.settings.clone();
        shared.schema = self.schema.clone();
        shared.stats = self.stats.clone();
    }

    fn publish_stats(&self) {
        lock(&self.shared).stats = self.stats.clone();
    }

    fn notify(&mut self, kind: NotificationKind, message: impl Into<String>) {
        self.emit(SensorEvent::Notification(Notification::new(kind, message)));
    }

    fn emit(&mut self, event: SensorEvent) {
        if !event.is_droppable() {
            self.publish();
        }
        if !self.backlog.is_empty() {
            self.queue_event(event);
            return;
        }
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => self.queue_event(event),
            Err(TrySendError::Closed(_)) => trace!("Event receiver dropped"),
        }
    }

    fn queue_event(&mut self, event: SensorEvent) {
        if event.is_droppable() {
            if self.backlog_frames >= self.config.frame_backlog {
                self.stats.dropped_frames += 1;
                if !self.dropping {
                    self.dropping = true;
                    warn!(
                        "Consumer is behind, dropping sample frames ({:?})",
                        self.config.frame_drop_policy
                    );
                    self.backlog.push_back(SensorEvent::Notification(Notification::new(
                        NotificationKind::FramesDropped,
                        format!(
                            "Consumer is behind; sample frames are being dropped ({:?})",
                            self.config.frame_drop_policy
                        ),
                    )));
                }
                match self.config.frame_drop_policy {
                    FrameDropPolicy::DropNewest => return,
                    FrameDropPolicy::DropOldest => {
                        if let Some(index) = self.backlog.iter().position(SensorEvent::is_droppable) {
                            self.backlog.remove(index);
                            self.backlog_frames -= 1;
                        }
                    }
                }
            }
            self.backlog_frames += 1;
        }
        self.backlog.push_back(event);
    }

    fn flush_backlog(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            let is_frame = event.is_droppable();
            match self.events.try_send(event) {
                Ok(()) => {
                    if is_frame {
                        self.backlog_frames -= 1;
                    }
                }
                Err(TrySendError::Full(event)) => {
                    self.backlog.push_front(event);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    trace!("Event receiver dropped, discarding backlog");
                    self.backlog.clear();
                    self.backlog_frames = 0;
                    break;
                }
            }
        }
        if self.dropping && self.backlog_frames == 0 {
            info!("Consumer caught up; {} frames dropped so far", self.stats.dropped_frames);
            self.dropping = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread::sleep;
    use std::time::Duration;

    use super::*;
    use crate::mock_device::{MockDevice, MockDeviceOptions};
    use crate::protocol::{INQUIRY_COMMAND, SET_SENSORS_COMMAND, TOGGLE_LED_COMMAND};
    use crate::sensors::S3_GSR;
    use crate::session::SessionShared;

    fn worker(options: MockDeviceOptions) -> (Worker, mpsc::Receiver<SensorEvent>, MockDevice) {
        let config = SessionConfig {
            ack_timeout_ms: 300,
            long_command_timeout_ms: 600,
            response_timeout_ms: 300,
            event_channel_capacity: 8192,
            ..SessionConfig::default()
        };
        let device = MockDevice::new(MockDeviceOptions {
            sampling_rate_hz: 512.0,
            ..options
        });
        let (_control, control_rx) = flume::unbounded();
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity);
        let shared = Arc::new(Mutex::new(SessionShared::new()));
        let worker = Worker::new(config, Box::new(device.clone()), shared, control_rx, event_tx);
        (worker, event_rx, device)
    }

    /// Service the link until `done` holds.
    fn pump(worker: &mut Worker, done: impl Fn(&Worker) -> bool) {
        let mut buf = [0u8; READ_CHUNK];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(worker) {
            assert!(Instant::now() < deadline, "worker stuck while {:?}", worker.state);
            if worker.service(&mut buf) == 0 {
                sleep(Duration::from_millis(1));
            }
        }
    }

    fn connected(options: MockDeviceOptions) -> (Worker, mpsc::Receiver<SensorEvent>, MockDevice) {
        let (mut worker, events, device) = worker(options);
        worker.connect();
        pump(&mut worker, |w| w.state == SessionState::Connected);
        (worker, events, device)
    }

    fn drain(events: &mut mpsc::Receiver<SensorEvent>) -> Vec<SensorEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn count(events: &[SensorEvent], kind: NotificationKind) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SensorEvent::Notification(n) if n.kind == kind))
            .count()
    }

    fn disconnected(events: &[SensorEvent]) -> bool {
        events.iter().any(|e| matches!(e, SensorEvent::Disconnected { .. }))
    }

    #[test]
    fn test_commands_behind_start_streaming_are_not_sent() {
        let (mut w, mut events, device) = connected(MockDeviceOptions::default());
        let frame_size = w.schema.frame_size;

        // Both batches arrive while still Connected.
        w.enqueue_all(vec![CommandKind::StartStreaming]);
        w.enqueue_all(vec![CommandKind::SetSensors(S3_GSR), CommandKind::Inquiry]);
        pump(&mut w, |w| w.stats.frames_decoded >= 50);

        assert_eq!(w.state, SessionState::Streaming);
        assert_eq!(w.schema.frame_size, frame_size);
        assert_eq!(w.stats.schema_mismatches, 0);
        assert!(w.queue.is_empty());
        let sent = device.opcodes_received();
        assert!(!sent.contains(&SET_SENSORS_COMMAND));
        // Only the bring-up inquiry.
        assert_eq!(sent.iter().filter(|&&op| op == INQUIRY_COMMAND).count(), 1);

        let seen = drain(&mut events);
        assert_eq!(count(&seen, NotificationKind::Info), 2);
        assert_eq!(count(&seen, NotificationKind::SchemaMismatch), 0);
        assert!(!disconnected(&seen));
    }

    #[test]
    fn test_idle_only_command_refused_once_streaming() {
        let (mut w, mut events, device) = connected(MockDeviceOptions::default());
        w.enqueue_all(vec![CommandKind::StartStreaming]);
        pump(&mut w, |w| w.state == SessionState::Streaming);
        drain(&mut events);

        w.enqueue_all(vec![CommandKind::ToggleLed, CommandKind::SetPmux(true)]);
        assert!(w.queue.is_empty());
        let seen = drain(&mut events);
        assert_eq!(count(&seen, NotificationKind::Info), 1);

        w.enqueue_all(vec![CommandKind::ToggleLed]);
        pump(&mut w, |w| w.queue.is_empty());
        assert_eq!(device.opcodes_received().last(), Some(&TOGGLE_LED_COMMAND));
    }

    #[test]
    fn test_schema_kept_while_streaming() {
        let (mut w, mut events, _device) = connected(MockDeviceOptions::default());
        w.enqueue_all(vec![CommandKind::StartStreaming]);
        pump(&mut w, |w| w.state == SessionState::Streaming);
        let frame_size = w.schema.frame_size;

        assert!(!w.install_schema(&[]));
        assert_eq!(w.schema.frame_size, frame_size);
        let seen = drain(&mut events);
        assert_eq!(count(&seen, NotificationKind::SchemaMismatch), 1);
    }

    #[test]
    fn test_lost_stop_ack_forces_connected() {
        let (mut w, mut events, device) = connected(MockDeviceOptions {
            lose_stop_ack: true,
            ..MockDeviceOptions::default()
        });
        w.enqueue_all(vec![CommandKind::StartStreaming]);
        pump(&mut w, |w| w.stats.frames_decoded >= 10);

        w.enqueue_all(vec![CommandKind::StopStreaming]);
        // The device stops mid-frame and the ACK never comes.
        pump(&mut w, |w| !device.is_streaming() && w.sync.buffered() > 0);
        assert_eq!(w.state, SessionState::Streaming);

        pump(&mut w, |w| w.state == SessionState::Connected);
        assert!(w.open);
        assert_eq!(w.sync.buffered(), 0);
        assert!(w.queue.is_empty());
        let seen = drain(&mut events);
        assert_eq!(count(&seen, NotificationKind::ProtocolTimeout), 1);
        assert!(seen.iter().any(|e| matches!(e, SensorEvent::StopStreaming)));
        assert!(!disconnected(&seen));

        // The link is still usable.
        w.enqueue_all(vec![CommandKind::ToggleLed]);
        pump(&mut w, |w| w.queue.is_empty());
        assert_eq!(w.state, SessionState::Connected);
        assert!(!disconnected(&drain(&mut events)));
    }
}
