//! Error types for the depth synchronization engine

use thiserror::Error;

/// Market data errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Malformed depth update: {0}")]
    MalformedEvent(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Snapshot request for {symbol} failed with HTTP {status}")]
    SnapshotStatus { symbol: String, status: u16 },

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        MarketDataError::IpcError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
