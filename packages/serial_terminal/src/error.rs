use std::path::PathBuf;

use port_manager::PortError;
use relay_protocol::ProtocolError;

/// Errors talking to the relay server
#[derive(Debug, thiserror::Error)]
pub enum RelayClientError {
    #[error("Failed to connect to relay at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The connection to the relay has ended
    #[error("Relay connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors surfaced to the user by a terminal session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No serial port is connected")]
    NotConnected,

    #[error("Message is empty")]
    EmptyMessage,

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid message file: {0}")]
    Format(#[from] serde_json::Error),
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            path: path.into(),
            source,
        }
    }
}
