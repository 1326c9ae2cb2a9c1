use thiserror::Error;

/// Failures of the chat store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the store directory failed.
    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),

    /// No row for the requested id.
    #[error("record not found")]
    NotFound,

    #[error("migration failed: {0}")]
    Migration(String),

    /// A stored message type or status has no wire equivalent.
    #[error("stored value out of range: {0}")]
    Protocol(#[from] gogo_shared::ProtocolError),

    /// The group member list column is not a JSON string array.
    #[error("member list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad timestamp: {0}")]
    ChronoParse(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
