use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        ServerError::Unavailable(err.to_string())
    }
}

impl From<gogo_store::StoreError> for ServerError {
    fn from(err: gogo_store::StoreError) -> Self {
        ServerError::Internal(err.to_string())
    }
}

/// The hub's event loop is gone (shutdown or crash).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is shut down")]
    Closed,
}

/// Failure of a single connection's transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,
}

impl From<axum::Error> for ConnectionError {
    fn from(err: axum::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}

/// Failure of the durable broker behind the queued transport.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis broker error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "kafka")]
    #[error("kafka broker error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("malformed broker record: {0}")]
    Malformed(String),
}

/// Failure of the message cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis cache error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cached value is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Failure of the durable store as seen from async code.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] gogo_store::StoreError),

    #[error("store worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("store lock poisoned")]
    Poisoned,
}

impl From<PersistenceError> for ServerError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Store(gogo_store::StoreError::NotFound) => {
                ServerError::NotFound("record not found".into())
            }
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        ServerError::Unavailable(err.to_string())
    }
}

/// Failure of an external collaborator call.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator call timed out")]
    Timeout,

    #[error("collaborator unreachable: {0}")]
    Unavailable(String),

    #[error("collaborator reported failure: {0}")]
    Failed(String),

    #[error("collaborator rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CollaboratorError::Timeout
        } else {
            CollaboratorError::Unavailable(err.to_string())
        }
    }
}
