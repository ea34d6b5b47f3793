//! WebSocket client for the relay server.
//!
//! Outgoing events are queued and written by a background task, so `publish`
//! never waits on the network. Incoming `message` events pass through the
//! shared [`DedupCache`] first; a body this terminal already displayed or
//! published is dropped instead of being shown twice.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ClientEvent, DedupCache, RelayMessage, ServerEvent, encode, parse_server_event};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayClientError;

/// Something the relay told this participant
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    /// A message another participant published, not seen here before
    Message(RelayMessage),
    /// Every participant must drop its ports
    DisconnectAll(String),
    RandomNumber(String),
}

pub struct RelayClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: broadcast::Sender<RelayEvent>,
    dedup: Arc<Mutex<DedupCache>>,
    cancel: CancellationToken,
}

impl RelayClient {
    /// Connect to a relay at a `ws://` URL.
    ///
    /// `dedup` is shared with whatever else decides what has been displayed.
    pub async fn connect(
        url: &str,
        dedup: Arc<Mutex<DedupCache>>,
    ) -> Result<Self, RelayClientError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RelayClientError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        info!(url, "Connected to relay");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (events, _) = broadcast::channel(256);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    event = outbound_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let json = match encode(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode relay event: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(json.into())).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
            debug!("Relay writer stopped");
        });

        let reader_cancel = cancel.clone();
        let reader_events = events.clone();
        let reader_dedup = dedup.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = ws_read.next() => frame,
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match parse_server_event(text.as_str()) {
                        Ok(event) => {
                            if let Some(event) = filter_incoming(&reader_dedup, event).await {
                                let _ = reader_events.send(event);
                            }
                        }
                        Err(e) => warn!("Ignoring relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            // Stop the writer too
            reader_cancel.cancel();
        });

        Ok(Self {
            outbound,
            events,
            dedup,
            cancel,
        })
    }

    /// Publish a message unless its body has already been seen.
    ///
    /// Returns `Ok(false)` when the message was skipped.
    pub async fn publish(&self, message: RelayMessage) -> Result<bool, RelayClientError> {
        if !self.dedup.lock().await.check_and_remember(&message.message) {
            debug!("Already seen, not publishing: {}", message.message);
            return Ok(false);
        }
        self.send(ClientEvent::Message(message))?;
        Ok(true)
    }

    /// Declare this participant's baud rate
    pub fn publish_baud_rate(&self, baud_rate: u32) -> Result<(), RelayClientError> {
        self.send(ClientEvent::SetBaudRate(baud_rate))
    }

    pub fn start_random_numbers(&self) -> Result<(), RelayClientError> {
        self.send(ClientEvent::StartRandomNumbers)
    }

    pub fn stop_random_numbers(&self) -> Result<(), RelayClientError> {
        self.send(ClientEvent::StopRandomNumbers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Call `handler` for every message forwarded from another participant.
    pub fn on_broadcast<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(RelayMessage) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RelayEvent::Message(message)) => handler(message),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Broadcast handler lagged, {} events skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Shut the connection down. Queued events may be dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn send(&self, event: ClientEvent) -> Result<(), RelayClientError> {
        if self.cancel.is_cancelled() {
            return Err(RelayClientError::Closed);
        }
        self.outbound
            .send(event)
            .map_err(|_| RelayClientError::Closed)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn filter_incoming(dedup: &Mutex<DedupCache>, event: ServerEvent) -> Option<RelayEvent> {
    match event {
        ServerEvent::Message(message) => {
            if dedup.lock().await.check_and_remember(&message.message) {
                Some(RelayEvent::Message(message))
            } else {
                debug!("Echo suppressed: {}", message.message);
                None
            }
        }
        ServerEvent::DisconnectAll(reason) => Some(RelayEvent::DisconnectAll(reason)),
        ServerEvent::RandomNumber(sample) => Some(RelayEvent::RandomNumber(sample)),
    }
}
