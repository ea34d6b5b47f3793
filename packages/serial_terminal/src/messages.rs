//! Display-ordered record of every message a session has shown, plus the
//! JSON export/import format for sent messages.

use port_manager::PortId;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Received,
    Sent,
}

/// Where a logged message came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageSource {
    Port(PortId),
    Relay,
    /// Typed by the local user
    Local,
    /// Loaded from an export file
    Import,
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageSource::Port(id) => write!(f, "{}", id),
            MessageSource::Relay => write!(f, "relay"),
            MessageSource::Local => write!(f, "local"),
            MessageSource::Import => write!(f, "import"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoggedMessage {
    pub seq: u64,
    pub kind: MessageKind,
    pub source: MessageSource,
    pub body: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// One entry of an export file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedMessage {
    pub number: u64,
    pub message: String,
}

#[derive(Debug)]
pub struct MessageLog {
    entries: Vec<LoggedMessage>,
    next_seq: u64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
        }
    }
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message stamped with the current time. Blank bodies are not
    /// stored and yield `None`.
    pub fn push(
        &mut self,
        kind: MessageKind,
        source: MessageSource,
        body: &str,
    ) -> Option<LoggedMessage> {
        self.push_at(kind, source, body, chrono::Utc::now().timestamp_millis())
    }

    pub fn push_at(
        &mut self,
        kind: MessageKind,
        source: MessageSource,
        body: &str,
        timestamp: i64,
    ) -> Option<LoggedMessage> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        let message = LoggedMessage {
            seq: self.next_seq,
            kind,
            source,
            body: body.to_string(),
            timestamp,
        };
        self.next_seq += 1;
        self.entries.push(message.clone());
        Some(message)
    }

    pub fn entries(&self) -> &[LoggedMessage] {
        &self.entries
    }

    pub fn sent(&self) -> impl Iterator<Item = &LoggedMessage> {
        self.entries.iter().filter(|m| m.kind == MessageKind::Sent)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sent messages numbered from 1 in send order
    pub fn export(&self) -> Vec<ExportedMessage> {
        self.sent()
            .zip(1..)
            .map(|(m, number)| ExportedMessage {
                number,
                message: m.body.clone(),
            })
            .collect()
    }

    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.export())
    }

    /// Append exported messages as sent, ordered by `number`. Nothing is
    /// transmitted. Returns the newly logged entries.
    pub fn import(&mut self, mut messages: Vec<ExportedMessage>) -> Vec<LoggedMessage> {
        messages.sort_by_key(|m| m.number);
        messages
            .iter()
            .filter_map(|m| self.push(MessageKind::Sent, MessageSource::Import, &m.message))
            .collect()
    }
}

pub fn parse_export(text: &str) -> Result<Vec<ExportedMessage>, serde_json::Error> {
    serde_json::from_str(text)
}
