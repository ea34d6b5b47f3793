/// Errors that can occur during serial port operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// The device could not be selected or opened
    #[error("Failed to open serial port {path}: {reason}")]
    TransportOpenFailure { path: String, reason: String },

    /// Active ports (or the relay) disagree about the baud rate
    #[error("Baud rate mismatch: {0}")]
    RateMismatch(String),

    /// Reading from the device failed; the read loop for that port has ended
    #[error("Failed to read from serial port: {0}")]
    TransportReadFailure(String),

    /// Writing to the device failed; the port stays open
    #[error("Failed to write to serial port: {0}")]
    TransportWriteFailure(String),

    /// Port not found
    #[error("Port not found: {0}")]
    NotFound(u64),

    /// No port is open to write to
    #[error("No serial port is connected")]
    NoActivePorts,

    /// The port has already been closed
    #[error("Port is closed")]
    Closed,

    /// Channel communication error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl PortError {
    /// Whether this error should reset every connection rather than just one.
    pub fn is_session_wide(&self) -> bool {
        matches!(self, PortError::RateMismatch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_mismatch_is_session_wide() {
        assert!(PortError::RateMismatch("9600 vs 115200".into()).is_session_wide());
        assert!(!PortError::TransportWriteFailure("broken pipe".into()).is_session_wide());
        assert!(!PortError::Closed.is_session_wide());
    }

    #[test]
    fn open_failure_names_the_device() {
        let err = PortError::TransportOpenFailure {
            path: "/dev/ttyUSB0".into(),
            reason: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open serial port /dev/ttyUSB0: permission denied"
        );
    }
}
