use thiserror::Error;

/// Errors raised while encoding, decoding or exchanging protocol messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame body larger than [`crate::MAX_MESSAGE_SIZE`]
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Body could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally invalid message
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Handshake protocol violation
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Server rejected the credentials
    #[error("Authentication error: {0}")]
    Auth(String),
}
