use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::PortError;
use crate::framer::LineFramer;
use crate::manager::PortId;
use crate::transport::SerialStreams;

const READ_CHUNK: usize = 4096;

/// Configuration for opening a serial port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConfig {
    pub path: String,
    pub baud_rate: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: 9600,
        }
    }
}

/// Activity state of one connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Active,
    Closing,
    Closed,
}

impl PortState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PortState::Active,
            1 => PortState::Closing,
            _ => PortState::Closed,
        }
    }
}

/// Shared, lock-free view of a port's `PortState`.
#[derive(Clone, Debug)]
pub(crate) struct StateFlag(Arc<AtomicU8>);

impl StateFlag {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(PortState::Active as u8)))
    }

    pub(crate) fn get(&self) -> PortState {
        PortState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: PortState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Active -> Closing. False if someone else already started closing.
    fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                PortState::Active as u8,
                PortState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// What the reader thread reports, in stream order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortOutput {
    Line { text: String, timestamp: i64 },
    Eof,
    ReadFailed(String),
}

/// Messages that can be sent to the port actor
pub(crate) enum PortMessage {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PortError>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to communicate with a port actor
#[derive(Clone)]
pub struct PortHandle {
    id: PortId,
    config: PortConfig,
    sender: mpsc::Sender<PortMessage>,
    state: StateFlag,
}

impl PortHandle {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    pub fn state(&self) -> PortState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state() == PortState::Active
    }

    /// Write raw bytes to the device
    pub async fn write(&self, data: &[u8]) -> Result<usize, PortError> {
        if !self.is_active() {
            return Err(PortError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PortMessage::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PortError::ChannelError("Failed to send write message".into()))?;
        rx.await
            .map_err(|_| PortError::ChannelError("Failed to receive write response".into()))?
    }

    /// Release the stream handles. Closing a closed port does nothing.
    pub async fn close(&self) {
        if !self.state.begin_close() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(PortMessage::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        self.state.set(PortState::Closed);
    }
}

/// The actor that owns one open serial connection
pub struct PortActor {
    id: PortId,
    writer: Option<Box<dyn Write + Send>>,
    state: StateFlag,
    receiver: mpsc::Receiver<PortMessage>,
}

impl PortActor {
    /// Start the reader thread and actor task for an opened device.
    ///
    /// Framed lines, end-of-stream, and read failures are delivered on `output`.
    pub fn spawn(
        id: PortId,
        config: PortConfig,
        streams: SerialStreams,
        output: mpsc::UnboundedSender<PortOutput>,
    ) -> Result<PortHandle, PortError> {
        let state = StateFlag::new();
        let (msg_tx, msg_rx) = mpsc::channel(32);

        let reader_state = state.clone();
        let reader = streams.reader;
        std::thread::Builder::new()
            .name(format!("{id}-reader"))
            .spawn(move || read_loop(id, reader, reader_state, output))
            .map_err(|e| PortError::ChannelError(format!("Failed to start reader: {e}")))?;

        let mut actor = Self {
            id,
            writer: Some(streams.writer),
            state: state.clone(),
            receiver: msg_rx,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        info!(%id, path = %config.path, baud = config.baud_rate, "Port opened");

        Ok(PortHandle {
            id,
            config,
            sender: msg_tx,
            state,
        })
    }

    async fn run(&mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                PortMessage::Write { data, respond_to } => {
                    let result = self.handle_write(&data);
                    let _ = respond_to.send(result);
                }
                PortMessage::Close { respond_to } => {
                    self.writer = None;
                    self.state.set(PortState::Closed);
                    let _ = respond_to.send(());
                    break;
                }
            }
        }
        debug!(id = %self.id, "Port actor shutting down");
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let writer = self.writer.as_mut().ok_or(PortError::Closed)?;

        writer.write_all(data).map_err(|e| {
            error!(id = %self.id, "Write failed: {}", e);
            PortError::TransportWriteFailure(e.to_string())
        })?;
        writer
            .flush()
            .map_err(|e| PortError::TransportWriteFailure(e.to_string()))?;

        Ok(data.len())
    }
}

fn read_loop(
    id: PortId,
    mut reader: Box<dyn Read + Send>,
    state: StateFlag,
    output: mpsc::UnboundedSender<PortOutput>,
) {
    let mut framer = LineFramer::new();
    let mut buffer = vec![0u8; READ_CHUNK];

    while state.get() == PortState::Active {
        match reader.read(&mut buffer) {
            Ok(0) => {
                info!(%id, "End of stream");
                let _ = output.send(PortOutput::Eof);
                break;
            }
            Ok(n) => {
                // Data that lands after close was requested is dropped
                if state.get() != PortState::Active {
                    break;
                }
                for text in framer.feed(&buffer[..n]) {
                    let line = PortOutput::Line {
                        text,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if output.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(%id, "Error reading serial port: {}", e);
                let _ = output.send(PortOutput::ReadFailed(e.to_string()));
                break;
            }
        }
    }
    debug!(%id, "Reader thread exiting");
}
