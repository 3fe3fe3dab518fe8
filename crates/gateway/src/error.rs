//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Asset resolution or order validation failure.
    #[error(transparent)]
    Exchange(#[from] exchange::ExchangeError),

    /// Command received while the upstream link is not Ready.
    #[error("upstream session is not ready")]
    NotReady,

    /// Command received before `authenticate`.
    #[error("no active session, authenticate first")]
    NoSession,

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
