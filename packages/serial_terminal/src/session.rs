//! One terminal session: the open ports, the optional relay connection, and
//! the message log that ties them together.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use port_manager::{PortConfig, PortEvent, PortId, PortInfo, PortManager};
use relay_protocol::RelayMessage;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::messages::{LoggedMessage, MessageKind, MessageLog, MessageSource, parse_export};
use crate::relay_client::{RelayClient, RelayEvent};

pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// What a display should show
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Message(LoggedMessage),
    /// Something the user should be told about, e.g. a forced disconnect
    Notice(String),
}

pub struct TerminalSession {
    ports: Arc<PortManager>,
    relay: Option<RelayClient>,
    log: Mutex<MessageLog>,
    baud_rate: AtomicU32,
    events: broadcast::Sender<SessionEvent>,
}

impl TerminalSession {
    pub fn new(ports: Arc<PortManager>, relay: Option<RelayClient>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            ports,
            relay,
            log: Mutex::new(MessageLog::new()),
            baud_rate: AtomicU32::new(DEFAULT_BAUD_RATE),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    pub fn relay(&self) -> Option<&RelayClient> {
        self.relay.as_ref()
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    /// Rate used for the next `connect`; also declared to the relay.
    ///
    /// Open ports keep their rate. A relay that can't be reached is reported as a
    /// notice; the local rate still changes.
    pub fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
        info!(baud_rate, "Baud rate set");
        self.declare_rate(baud_rate);
    }

    /// Open a device at the session baud rate
    pub async fn connect(&self, path: &str) -> Result<PortId, SessionError> {
        let baud_rate = self.baud_rate();
        let id = self
            .ports
            .open(PortConfig {
                path: path.to_string(),
                baud_rate,
            })
            .await
            .inspect_err(|e| error!("Error connecting to serial port: {}", e))?;
        info!(%id, path, baud_rate, "Connected");

        // A relay reset forgets every declared rate, so declare again on each connect
        self.declare_rate(baud_rate);
        Ok(id)
    }

    fn declare_rate(&self, baud_rate: u32) {
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.publish_baud_rate(baud_rate) {
                warn!(baud_rate, "Could not declare baud rate to relay: {}", e);
                self.notify(format!("Relay did not receive baud rate {}: {}", baud_rate, e));
            }
        }
    }

    pub async fn close(&self, id: PortId) -> bool {
        self.ports.close(id).await
    }

    pub async fn close_all(&self) -> usize {
        self.ports.close_all().await
    }

    pub async fn list_ports(&self) -> Vec<PortInfo> {
        self.ports.list().await
    }

    /// Write `text` and a newline to every open port
    pub async fn send(&self, text: &str) -> Result<LoggedMessage, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if !self.ports.is_connected().await {
            warn!("No connected serial ports available to send the message.");
            return Err(SessionError::NotConnected);
        }
        self.ports.write_line(text).await?;
        self.record(MessageKind::Sent, MessageSource::Local, text)
            .await
            .ok_or(SessionError::EmptyMessage)
    }

    pub async fn messages(&self) -> Vec<LoggedMessage> {
        self.log.lock().await.entries().to_vec()
    }

    /// Write sent messages to `path` as JSON. Returns how many were written.
    pub async fn export_to(&self, path: &Path) -> Result<usize, SessionError> {
        let (json, count) = {
            let log = self.log.lock().await;
            (log.export_json()?, log.sent().count())
        };
        tokio::fs::write(path, json)
            .await
            .map_err(|e| SessionError::io(path, e))?;
        info!(count, "Exported messages to {:?}", path);
        Ok(count)
    }

    /// Load an export file into the log. Nothing is sent to the ports or the relay.
    pub async fn import_from(&self, path: &Path) -> Result<usize, SessionError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SessionError::io(path, e))?;
        let imported = self.log.lock().await.import(parse_export(&text)?);
        let count = imported.len();
        for message in imported {
            let _ = self.events.send(SessionEvent::Message(message));
        }
        info!(count, "Imported messages from {:?}", path);
        Ok(count)
    }

    /// Pump port and relay events until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut port_rx = self.ports.subscribe();
        let mut relay_rx = self.relay.as_ref().map(RelayClient::subscribe);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = port_rx.recv() => match event {
                    Ok(event) => self.handle_port_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Port events lagged, {} skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                event = recv_relay(&mut relay_rx) => match event {
                    Ok(event) => self.handle_relay_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Relay events lagged, {} skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.notify("Relay connection closed".to_string());
                        relay_rx = None;
                    }
                },
            }
        }
        debug!("Session pump stopped");
    }

    async fn handle_port_event(&self, event: PortEvent) {
        match event {
            PortEvent::Line {
                id,
                text,
                timestamp,
            } => {
                debug!(%id, "Data received: {}", text);
                if let Some(relay) = &self.relay {
                    let baud_rate = self.ports.baud_rate().await.unwrap_or(self.baud_rate());
                    let message = RelayMessage::new(text.clone())
                        .with_port(id.to_string())
                        .with_baud_rate(baud_rate);
                    match relay.publish(message).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(%id, "Already shown, not displaying again: {}", text);
                            return;
                        }
                        Err(e) => warn!(%id, "Relay publish failed: {}", e),
                    }
                }
                let logged = {
                    let mut log = self.log.lock().await;
                    log.push_at(MessageKind::Received, MessageSource::Port(id), &text, timestamp)
                };
                if let Some(message) = logged {
                    let _ = self.events.send(SessionEvent::Message(message));
                }
            }
            PortEvent::Opened {
                id,
                path,
                baud_rate,
            } => {
                self.notify(format!("Connected to {} ({}) at {} baud", path, id, baud_rate));
            }
            PortEvent::Closed { id, reason } => {
                info!(%id, ?reason, "Port closed");
                self.notify(format!("{} closed: {:?}", id, reason));
            }
            PortEvent::RateMismatch { reason } => {
                self.notify(reason);
            }
        }
    }

    async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Message(message) => {
                self.record(MessageKind::Received, MessageSource::Relay, &message.message)
                    .await;
            }
            RelayEvent::RandomNumber(sample) => {
                self.record(MessageKind::Received, MessageSource::Relay, &sample)
                    .await;
            }
            RelayEvent::DisconnectAll(reason) => {
                warn!("Relay requested disconnect: {}", reason);
                // Emits PortEvent::RateMismatch, which carries the notice
                self.ports.disconnect_all(&reason).await;
            }
        }
    }

    async fn record(
        &self,
        kind: MessageKind,
        source: MessageSource,
        body: &str,
    ) -> Option<LoggedMessage> {
        let message = self.log.lock().await.push(kind, source, body)?;
        let _ = self.events.send(SessionEvent::Message(message.clone()));
        Some(message)
    }

    fn notify(&self, text: String) {
        let _ = self.events.send(SessionEvent::Notice(text));
    }
}

async fn recv_relay(
    rx: &mut Option<broadcast::Receiver<RelayEvent>>,
) -> Result<RelayEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
