//! The seam between the session manager and the OS serial interface.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::PortError;
use crate::port::PortConfig;

/// Blocking stream halves for one opened device.
///
/// A reader that returns `TimedOut` or `WouldBlock` has no data yet; `Ok(0)`
/// means the device went away.
pub struct SerialStreams {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Something that can open serial devices.
pub trait SerialTransport: Send + Sync {
    fn open(&self, config: &PortConfig) -> Result<SerialStreams, PortError>;
}

#[cfg(feature = "serial")]
pub use self::os::{SerialPortTransport, available_ports};

#[cfg(feature = "serial")]
mod os {
    use std::time::Duration;

    use serialport::{DataBits, Parity, StopBits};
    use tracing::{debug, info};

    use super::{SerialStreams, SerialTransport};
    use crate::error::PortError;
    use crate::port::PortConfig;

    /// Opens real devices through the `serialport` crate (8N1).
    pub struct SerialPortTransport {
        read_timeout: Duration,
    }

    impl SerialPortTransport {
        pub fn new(read_timeout: Duration) -> Self {
            Self { read_timeout }
        }
    }

    impl Default for SerialPortTransport {
        fn default() -> Self {
            Self::new(Duration::from_millis(100))
        }
    }

    impl SerialTransport for SerialPortTransport {
        fn open(&self, config: &PortConfig) -> Result<SerialStreams, PortError> {
            info!(path = %config.path, baud = config.baud_rate, "Opening serial port");

            let open_failure = |e: serialport::Error| PortError::TransportOpenFailure {
                path: config.path.clone(),
                reason: e.to_string(),
            };

            let mut port = serialport::new(config.path.as_str(), config.baud_rate)
                .timeout(self.read_timeout)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .open()
                .map_err(open_failure)?;

            // Many USB adapters hold the device in reset until DTR/RTS are asserted
            let _ = port.write_data_terminal_ready(true);
            let _ = port.write_request_to_send(true);

            let reader = port.try_clone().map_err(open_failure)?;
            debug!(path = %config.path, "Serial port opened");

            Ok(SerialStreams {
                reader: Box::new(reader),
                writer: Box::new(port),
            })
        }
    }

    /// Device paths the OS currently reports.
    pub fn available_ports() -> Result<Vec<String>, PortError> {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .map_err(|e| PortError::TransportOpenFailure {
                path: String::new(),
                reason: e.to_string(),
            })
    }
}

// =============================================================================
// In-memory devices
// =============================================================================

const LOOPBACK_POLL: Duration = Duration::from_millis(20);

enum Feed {
    Data(Vec<u8>),
    Eof,
    Fail(String),
}

#[derive(Default)]
struct DeviceState {
    feed: Option<Sender<Feed>>,
    written: Vec<u8>,
    write_failure: Option<String>,
    opened_at: Option<u32>,
}

/// Test side of an in-memory serial device.
#[derive(Clone, Default)]
pub struct LoopbackDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl LoopbackDevice {
    /// Deliver bytes to the open port. Returns false if nothing has it open.
    pub fn push(&self, bytes: impl AsRef<[u8]>) -> bool {
        self.send(Feed::Data(bytes.as_ref().to_vec()))
    }

    /// Signal end-of-stream, as if the cable was pulled.
    pub fn end(&self) -> bool {
        self.send(Feed::Eof)
    }

    /// Make the next read fail.
    pub fn fail_read(&self, reason: &str) -> bool {
        self.send(Feed::Fail(reason.to_string()))
    }

    /// Make every write fail until reset with `None`.
    pub fn fail_writes(&self, reason: Option<&str>) {
        self.lock().write_failure = reason.map(str::to_string);
    }

    /// Everything written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Baud rate of the most recent open.
    pub fn opened_at(&self) -> Option<u32> {
        self.lock().opened_at
    }

    fn send(&self, feed: Feed) -> bool {
        match &self.lock().feed {
            Some(tx) => tx.send(feed).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A transport backed by [`LoopbackDevice`]s, keyed by path.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    devices: Arc<Mutex<HashMap<String, LoopbackDevice>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or fetch) the device at `path`.
    pub fn device(&self, path: &str) -> LoopbackDevice {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_string())
            .or_default()
            .clone()
    }
}

impl SerialTransport for LoopbackTransport {
    fn open(&self, config: &PortConfig) -> Result<SerialStreams, PortError> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&config.path)
            .cloned()
            .ok_or_else(|| PortError::TransportOpenFailure {
                path: config.path.clone(),
                reason: "no such device".to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        {
            let mut state = device.lock();
            state.feed = Some(tx);
            state.opened_at = Some(config.baud_rate);
        }

        Ok(SerialStreams {
            reader: Box::new(LoopbackReader {
                feed: rx,
                pending: Vec::new(),
            }),
            writer: Box::new(LoopbackWriter { device }),
        })
    }
}

struct LoopbackReader {
    feed: Receiver<Feed>,
    pending: Vec<u8>,
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.feed.recv_timeout(LOOPBACK_POLL) {
                Ok(Feed::Data(bytes)) => self.pending = bytes,
                Ok(Feed::Eof) | Err(RecvTimeoutError::Disconnected) => return Ok(0),
                Ok(Feed::Fail(reason)) => return Err(io::Error::other(reason)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct LoopbackWriter {
    device: LoopbackDevice,
}

impl Write for LoopbackWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if let Some(reason) = &state.write_failure {
            return Err(io::Error::other(reason.clone()));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
