#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed relay event: {0}")]
    Malformed(#[from] serde_json::Error),
}
