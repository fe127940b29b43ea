//! Callback-style consumption of session events.
//!
//! The event channel is the primary interface; this adapts it for code that
//! prefers one method per event kind.

use std::sync::Arc;

use log::{debug, info};
use sensor_types::{Notification, SampleFrame, SensorEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Receives session events. Every method defaults to doing nothing.
pub trait ShimmerListener: Send + 'static {
    fn on_sensor_created(&mut self, _device_name: &str) {}
    fn on_connected(&mut self) {}
    fn on_disconnected(&mut self, _reason: Option<&str>) {}
    fn on_start_streaming(&mut self) {}
    fn on_stop_streaming(&mut self) {}
    fn on_new_sample_frame(&mut self, _frame: Arc<SampleFrame>) {}
    fn on_sampling_rate_changed(&mut self, _hz: f64) {}
    fn on_notification(&mut self, _notification: &Notification) {}
}

/// Route one event to the matching callback.
pub fn dispatch<L: ShimmerListener + ?Sized>(listener: &mut L, event: SensorEvent) {
    match event {
        SensorEvent::SensorCreated { device_name } => listener.on_sensor_created(&device_name),
        SensorEvent::Connected => listener.on_connected(),
        SensorEvent::Disconnected { reason } => listener.on_disconnected(reason.as_deref()),
        SensorEvent::StartStreaming => listener.on_start_streaming(),
        SensorEvent::StopStreaming => listener.on_stop_streaming(),
        SensorEvent::Frame(frame) => listener.on_new_sample_frame(frame),
        SensorEvent::SamplingRateChanged(hz) => listener.on_sampling_rate_changed(hz),
        SensorEvent::Notification(notification) => listener.on_notification(&notification),
    }
}

/// Drive `listener` from `events` on a tokio task until the session is
/// dropped. The task hands the listener back when it finishes.
pub fn spawn_listener<L: ShimmerListener>(
    mut events: mpsc::Receiver<SensorEvent>,
    mut listener: L,
) -> JoinHandle<L> {
    tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(event) = events.recv().await {
            dispatch(&mut listener, event);
            delivered += 1;
        }
        debug!("Event channel closed after {} events", delivered);
        info!("Listener task finished");
        listener
    })
}
