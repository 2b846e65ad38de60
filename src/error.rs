//! Unified client error types.

use thiserror::Error;

/// Top-level client error.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// WebSocket errors.
///
/// None of these reach consumers of [`WsClient`](crate::ws::native::WsClient)
/// as `Err` values: transport failures are recovered by reconnecting and
/// decoding failures discard the offending frame.
#[derive(Error, Debug)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout after {0}ms")]
    ConnectTimeout(u64),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection closed: code={code:?} reason={reason}")]
    Closed {
        code: Option<u16>,
        reason: String,
    },
}

#[cfg(feature = "ws-native")]
impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed | Error::AlreadyClosed => WsError::Closed {
                code: None,
                reason: "Connection closed".to_string(),
            },
            Error::Url(e) => WsError::ConnectionFailed(format!("invalid url: {}", e)),
            Error::Http(resp) => {
                WsError::ConnectionFailed(format!("HTTP error: {}", resp.status()))
            }
            Error::Io(e) => WsError::ConnectionFailed(e.to_string()),
            other => WsError::ProtocolError(other.to_string()),
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),

    #[error("max_reconnect_attempts must be at least 1")]
    ZeroReconnectAttempts,

    #[error("pong_timeout_ms must be at least 1")]
    ZeroPongTimeout,

    #[error("reconnect backoff factor must be >= 1.0, got {0}")]
    InvalidBackoffFactor(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}
