use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ClientEvent, encode, parse_client_event};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hub::{ParticipantId, PublishOutcome, RateOutcome, RelayHub};
use crate::metrics::RelayMetrics;

/// Run one participant until its socket closes
pub async fn handle_websocket(socket: WebSocket, hub: Arc<RelayHub>, metrics: Arc<RelayMetrics>) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut outbound) = hub.connect().await;

    loop {
        tokio::select! {
            Some(event) = outbound.recv() => {
                let json = match encode(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(%id, "Failed to encode {}: {}", event.name(), e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match parse_client_event(text.as_str()) {
                        Ok(event) => dispatch(&hub, id, event).await,
                        Err(e) => {
                            metrics.malformed_frame();
                            warn!(%id, "Ignoring frame: {}", e);
                        }
                    },
                    Some(Ok(Message::Binary(_))) => {
                        debug!(%id, "Binary messages not supported");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(%id, "WebSocket connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%id, "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(id).await;
}

async fn dispatch(hub: &RelayHub, id: ParticipantId, event: ClientEvent) {
    match event {
        ClientEvent::SetBaudRate(baud_rate) => {
            if hub.declare_rate(id, baud_rate).await == RateOutcome::Mismatch {
                info!(%id, baud_rate, "Declared rate triggered a reset");
            }
        }
        ClientEvent::Message(message) => {
            debug!(%id, "Message received: {}", message.message);
            if let PublishOutcome::RateMismatch = hub.publish(id, message).await {
                info!(%id, "Message rejected, rates disagree");
            }
        }
        ClientEvent::StartRandomNumbers => hub.start_random_numbers(id).await,
        ClientEvent::StopRandomNumbers => hub.stop_random_numbers(id).await,
    }
}
