//! Depth stream socket
//!
//! A connected combined-stream socket for one symbol that yields
//! [`FeedEvent`]s instead of raw frames.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::error::{MarketDataError, Result};
use crate::parser::ParsedMessage;
use crate::subscription::FeedEvent;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Combined-stream URL for the 100ms diff depth stream of `symbol`
pub fn depth_stream_url(endpoint: &str, symbol: &str) -> String {
    format!(
        "{}/stream?streams={}@depth@100ms",
        endpoint.trim_end_matches('/'),
        symbol.to_lowercase()
    )
}

/// Live diff depth socket
pub struct DepthSocket {
    stream: WsStream,
}

impl DepthSocket {
    /// Open the socket; the stream starts flowing immediately
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to depth stream");

        let (stream, response) = connect_async(url).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");
        Ok(Self { stream })
    }

    /// Next feed event
    ///
    /// `Ok(None)` means a frame arrived that carries no depth data (control
    /// frames, acks, other streams). Errors mean the socket is unusable.
    pub async fn next_event(&mut self) -> Result<Option<FeedEvent>> {
        let frame = match self.stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(MarketDataError::WebSocketMessage(e.to_string())),
            None => {
                return Err(MarketDataError::WebSocketConnection(
                    "Stream ended".to_string(),
                ))
            }
        };

        match frame {
            Message::Text(text) => Ok(classify(&text)),
            Message::Binary(data) => Ok(classify(&String::from_utf8_lossy(&data))),
            Message::Ping(data) => {
                debug!("Received ping, sending pong");
                self.stream
                    .send(Message::Pong(data))
                    .await
                    .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))?;
                Ok(None)
            }
            Message::Close(frame) => {
                warn!(frame = ?frame, "Received close frame");
                Err(MarketDataError::WebSocketConnection(
                    "Connection closed".to_string(),
                ))
            }
            Message::Pong(_) | Message::Frame(_) => Ok(None),
        }
    }

    /// Send a keepalive ping
    pub async fn ping(&mut self) -> Result<()> {
        self.stream
            .send(Message::Ping(vec![]))
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Map a text frame to a feed event; payloads that are not depth updates
/// are skipped
pub fn classify(raw: &str) -> Option<FeedEvent> {
    match ParsedMessage::parse(raw) {
        Ok(ParsedMessage::DepthUpdate(update)) => Some(FeedEvent::Depth(update)),
        Ok(ParsedMessage::Unknown(msg)) => {
            trace!(msg = %msg, "Skipping non-depth message");
            None
        }
        Err(e) => Some(FeedEvent::Malformed(e.to_string())),
    }
}
