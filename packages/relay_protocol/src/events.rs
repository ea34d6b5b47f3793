//! JSON events exchanged over the relay WebSocket.
//!
//! Every text frame carries one event: `{ "event": "<name>", "data": <payload> }`.
//! Events without a payload omit `data`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Reason attached to `disconnectAll` when participants disagree on baud rate.
pub const RATE_MISMATCH_REASON: &str = "Baud rates do not match across all connected ports.";

/// One published line, as relayed between participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "MessagePayload")]
pub struct RelayMessage {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
}

impl RelayMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            port: None,
            baud_rate: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = Some(baud_rate);
        self
    }
}

/// Accepted shapes for a `message` payload: the full object, or a bare string
/// from older clients.
#[derive(Deserialize)]
#[serde(untagged)]
enum MessagePayload {
    Text(String),
    #[serde(rename_all = "camelCase")]
    Full {
        message: String,
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        baud_rate: Option<u32>,
    },
}

impl From<MessagePayload> for RelayMessage {
    fn from(payload: MessagePayload) -> Self {
        match payload {
            MessagePayload::Text(message) => RelayMessage::new(message),
            MessagePayload::Full {
                message,
                port,
                baud_rate,
            } => RelayMessage {
                message,
                port,
                baud_rate,
            },
        }
    }
}

/// Events a participant sends to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    SetBaudRate(u32),
    Message(RelayMessage),
    StartRandomNumbers,
    StopRandomNumbers,
}

/// Events the relay sends to participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Message(RelayMessage),
    DisconnectAll(String),
    /// `"<index>,<bits>"`
    RandomNumber(String),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => "message",
            ServerEvent::DisconnectAll(_) => "disconnectAll",
            ServerEvent::RandomNumber(_) => "randomNumber",
        }
    }
}

pub fn parse_client_event(text: &str) -> Result<ClientEvent, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}

pub fn parse_server_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::from)
}

/// Serialize an event into one text frame.
pub fn encode<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(ProtocolError::from)
}
