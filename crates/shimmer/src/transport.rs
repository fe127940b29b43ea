//! Duplex byte-stream abstraction the protocol worker talks to.

use crate::types::ShimmerError;

/// A reliable-order, unreliable-latency byte stream to one device.
///
/// All calls happen on the protocol worker thread.
pub trait Transport: Send {
    /// Open the underlying link.
    fn open(&mut self) -> Result<(), ShimmerError>;

    /// Write a full command.
    fn write(&mut self, bytes: &[u8]) -> Result<(), ShimmerError>;

    /// Read whatever has arrived, blocking at most for the transport's own
    /// poll interval. Returns 0 when nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ShimmerError>;

    /// Close the link. Closing twice is not an error.
    fn close(&mut self) -> Result<(), ShimmerError>;

    /// Human readable endpoint, for logs.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

#[cfg(feature = "serial")]
pub use serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use std::io::{ErrorKind, Read, Write};
    use std::time::Duration;

    use log::debug;
    use serialport::SerialPort;

    use super::Transport;
    use crate::types::ShimmerError;

    /// Serial (or RFCOMM serial) port transport
    pub struct SerialTransport {
        /// Port name (e.g., "/dev/rfcomm0", "COM5")
        port_name: String,
        baud_rate: u32,
        read_timeout: Duration,
        port: Option<Box<dyn SerialPort>>,
    }

    impl SerialTransport {
        pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                read_timeout: Duration::from_millis(5),
                port: None,
            }
        }

        pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
            self.read_timeout = timeout;
            self
        }

        fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, ShimmerError> {
            self.port
                .as_mut()
                .ok_or_else(|| ShimmerError::Transport(format!("{} is not open", self.port_name)))
        }
    }

    impl Transport for SerialTransport {
        fn open(&mut self) -> Result<(), ShimmerError> {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.read_timeout)
                .open()
                .map_err(|e| {
                    ShimmerError::Transport(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        self.port_name, self.baud_rate, e
                    ))
                })?;
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            self.port = Some(port);
            Ok(())
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), ShimmerError> {
            let port = self.port()?;
            port.write_all(bytes)
                .and_then(|_| port.flush())
                .map_err(|e| ShimmerError::Transport(e.to_string()))
        }

        fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, ShimmerError> {
            let port = self.port()?;
            match port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    Ok(0)
                }
                Err(e) => Err(ShimmerError::Transport(e.to_string())),
            }
        }

        fn close(&mut self) -> Result<(), ShimmerError> {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
            Ok(())
        }

        fn describe(&self) -> String {
            format!("{}@{}", self.port_name, self.baud_rate)
        }
    }
}
