use thiserror::Error;

/// Errors raised while decoding or interpreting wire frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unknown message status: {0}")]
    UnknownStatus(i64),

    #[error("Invalid receiver id: {0:?}")]
    InvalidReceiver(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),
}
