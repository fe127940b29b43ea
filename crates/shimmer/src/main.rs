use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use shimmer::{
    load_config, DeviceSetup, HardwareGeneration, MockDevice, MockDeviceOptions, SensorEvent,
    SessionConfig, ShimmerSession, Transport,
};
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    Shimmer2,
    Shimmer2r,
    Shimmer3,
}

impl From<Device> for HardwareGeneration {
    fn from(device: Device) -> Self {
        match device {
            Device::Shimmer2 => HardwareGeneration::Shimmer2,
            Device::Shimmer2r => HardwareGeneration::Shimmer2r,
            Device::Shimmer3 => HardwareGeneration::Shimmer3,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream calibrated frames from a Shimmer", long_about = None)]
struct Args {
    /// Session configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the simulated device even when a port is given
    #[arg(long)]
    mock: bool,

    /// Serial or RFCOMM port; a simulated device is used when absent
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200)]
    baud: u32,

    /// Simulated hardware generation
    #[arg(long, value_enum, default_value_t = Device::Shimmer3)]
    device: Device,

    /// Sampling rate to configure, in Hz
    #[arg(long)]
    sampling_rate: Option<f64>,

    /// Enabled-sensor bitmap to configure (hex accepted with 0x)
    #[arg(long, value_parser = parse_bitmap)]
    sensors: Option<u32>,

    /// How long to stream, in seconds
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Print every Nth frame
    #[arg(long, default_value_t = 50)]
    every: u64,

    /// Re-validate frame alignment on every byte
    #[arg(long)]
    continuous_sync: bool,
}

fn parse_bitmap(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid sensor bitmap '{}': {}", s, e))
}

fn transport_for(args: &Args) -> Result<Box<dyn Transport>, Box<dyn Error>> {
    let port = if args.mock { None } else { args.port.as_ref() };
    match port {
        #[cfg(feature = "serial")]
        Some(port) => Ok(Box::new(shimmer::SerialTransport::new(port.clone(), args.baud))),
        #[cfg(not(feature = "serial"))]
        Some(port) => Err(format!(
            "Serial support is not compiled in; cannot open {} at {} baud",
            port, args.baud
        )
        .into()),
        None => {
            let generation = HardwareGeneration::from(args.device);
            let base = match generation {
                HardwareGeneration::Shimmer3 => MockDeviceOptions::default(),
                _ => MockDeviceOptions::shimmer2r(),
            };
            info!("No port given, simulating a {}", generation);
            Ok(Box::new(MockDevice::new(MockDeviceOptions { generation, ..base })))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    config.continuous_sync |= args.continuous_sync;
    if args.sampling_rate.is_some() || args.sensors.is_some() {
        let setup = config.setup.get_or_insert_with(DeviceSetup::default);
        if args.sampling_rate.is_some() {
            setup.sampling_rate_hz = args.sampling_rate;
        }
        if args.sensors.is_some() {
            setup.enabled_sensors = args.sensors;
        }
    }

    let (session, mut events) = ShimmerSession::new(config, transport_for(&args)?)?;
    session.connect()?;

    let stream_for = Duration::from_secs(args.seconds);
    let mut streaming_since: Option<Instant> = None;
    let mut frames = 0u64;

    loop {
        let event = match timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                if let Some(since) = streaming_since {
                    if since.elapsed() >= stream_for {
                        streaming_since = None;
                        session.stop_streaming()?;
                    }
                }
                continue;
            }
        };

        match event {
            SensorEvent::SensorCreated { device_name } => info!("Session '{}' ready", device_name),
            SensorEvent::Connected => {
                let settings = session.settings();
                println!(
                    "Connected: {:?}, firmware {}, {:.2} Hz, sensors 0x{:06X}",
                    settings.generation,
                    settings.firmware.map(|f| f.to_string()).unwrap_or_default(),
                    settings.sampling_rate_hz,
                    settings.enabled_sensors
                );
                session.start_streaming()?;
            }
            SensorEvent::StartStreaming => {
                let names: Vec<_> = session.schema().channels.iter().map(|c| c.name).collect();
                println!("Streaming: {}", names.join(", "));
                streaming_since = Some(Instant::now());
            }
            SensorEvent::Frame(frame) => {
                frames += 1;
                if args.every > 0 && frames % args.every == 0 {
                    let values = frame
                        .channels
                        .iter()
                        .map(|c| format!("{}={:.2}{}", c.name, c.calibrated, c.unit))
                        .collect::<Vec<_>>()
                        .join("  ");
                    println!("[{:>10.1} ms] {}", frame.device_timestamp_ms, values);
                }
                if let Some(since) = streaming_since {
                    if since.elapsed() >= stream_for {
                        streaming_since = None;
                        session.stop_streaming()?;
                    }
                }
            }
            SensorEvent::SamplingRateChanged(hz) => println!("Sampling rate: {:.3} Hz", hz),
            SensorEvent::Notification(n) => warn!("{:?}: {}", n.kind, n.message),
            SensorEvent::StopStreaming => {
                let stats = session.stats();
                println!(
                    "Stopped: {} frames, {} lost, {:.1}% reception, {} resyncs, {} dropped",
                    stats.frames_decoded,
                    stats.packets_lost,
                    stats.reception_rate,
                    stats.resyncs,
                    stats.dropped_frames
                );
                session.disconnect()?;
            }
            SensorEvent::Disconnected { reason } => {
                match reason {
                    Some(reason) => error!("Disconnected: {}", reason),
                    None => info!("Disconnected"),
                }
                break;
            }
        }
    }

    Ok(())
}
