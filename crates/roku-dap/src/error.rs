//! DAP transport error type.

/// Errors on the DAP stream itself. Handler-level failures never reach
/// this type; they become error responses to the IDE.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("I/O error on DAP stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON in DAP message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing Content-Length header in DAP message")]
    MissingContentLength,

    #[error("bad Content-Length header in DAP message: {0:?}")]
    BadContentLength(String),
}
