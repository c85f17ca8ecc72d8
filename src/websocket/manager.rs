//! WebSocket connection manager
//!
//! Runs one reconnecting depth stream per subscribed symbol and turns raw
//! frames into [`FeedEvent`]s.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::{depth_stream_url, DepthSocket};
use crate::error::{MarketDataError, Result};
use crate::subscription::{FeedConnector, FeedEvent};

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;
/// Send a keepalive ping after this much silence
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Treat the connection as stale after this much silence
const RECV_TIMEOUT: Duration = Duration::from_secs(45);
/// Events queued between the socket reader and the subscription
const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Opens reconnecting depth streams against a WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WebSocketManager {
    endpoint: String,
    reconnect_delay_ms: u64,
}

impl WebSocketManager {
    /// Create a new WebSocket manager
    pub fn new(endpoint: &str, reconnect_delay_ms: u64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            reconnect_delay_ms,
        }
    }
}

impl FeedConnector for WebSocketManager {
    fn connect(&self, symbol: &str) -> mpsc::Receiver<FeedEvent> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let stream = DepthStream::new(&self.endpoint, symbol, self.reconnect_delay_ms, tx);
        tokio::spawn(stream.run());
        rx
    }
}

/// Reconnect loop for a single symbol
struct DepthStream {
    symbol: String,
    url: String,
    socket: Option<DepthSocket>,
    tx: mpsc::Sender<FeedEvent>,
    reconnect_delay_ms: u64,
    reconnect_attempts: u32,
    last_successful_connection: Option<Instant>,
}

impl DepthStream {
    fn new(endpoint: &str, symbol: &str, reconnect_delay_ms: u64, tx: mpsc::Sender<FeedEvent>) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            url: depth_stream_url(endpoint, symbol),
            socket: None,
            tx,
            reconnect_delay_ms,
            reconnect_attempts: 0,
            last_successful_connection: None,
        }
    }

    /// Runs until the subscriber drops its receiver
    async fn run(mut self) {
        info!(symbol = %self.symbol, "Starting depth stream with infinite retry");

        loop {
            if self.tx.is_closed() {
                info!(symbol = %self.symbol, "Subscriber gone, depth stream stopped");
                return;
            }

            // Reset reconnect attempts if we've been stable for a while
            if let Some(last_success) = self.last_successful_connection {
                if last_success.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                    && self.reconnect_attempts > 0
                {
                    info!(
                        symbol = %self.symbol,
                        previous_attempts = self.reconnect_attempts,
                        "Resetting reconnect counter after cooldown period"
                    );
                    self.reconnect_attempts = 0;
                }
            }

            match self.connect_and_process().await {
                Ok(()) => {
                    self.close().await;
                    info!(symbol = %self.symbol, "Subscriber gone, depth stream stopped");
                    return;
                }
                Err(e) => {
                    error!(symbol = %self.symbol, error = %e, "Depth stream error");
                    self.close().await;
                    self.reconnect_attempts += 1;

                    if self
                        .tx
                        .send(FeedEvent::Disconnected(e.to_string()))
                        .await
                        .is_err()
                    {
                        return;
                    }

                    let delay = reconnect_delay(self.reconnect_delay_ms, self.reconnect_attempts);
                    warn!(
                        symbol = %self.symbol,
                        attempt = self.reconnect_attempts,
                        delay_secs = delay.as_secs(),
                        "Reconnecting after error..."
                    );

                    tokio::select! {
                        _ = self.tx.closed() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect and forward messages; `Ok` means the subscriber went away
    async fn connect_and_process(&mut self) -> Result<()> {
        let socket = tokio::select! {
            _ = self.tx.closed() => return Ok(()),
            socket = DepthSocket::connect(&self.url) => socket?,
        };
        let socket = self.socket.insert(socket);

        self.last_successful_connection = Some(Instant::now());
        self.reconnect_attempts = 0;

        if self.tx.send(FeedEvent::Connected).await.is_err() {
            return Ok(());
        }

        let mut last_message = Instant::now();

        loop {
            let received = tokio::select! {
                _ = self.tx.closed() => return Ok(()),
                received = timeout(RECV_TIMEOUT, socket.next_event()) => received,
            };

            match received {
                Ok(Ok(Some(event))) => {
                    last_message = Instant::now();
                    if self.tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(Ok(None)) => {
                    if last_message.elapsed() > KEEPALIVE_TIMEOUT {
                        if let Err(e) = socket.ping().await {
                            warn!(error = %e, "Failed to send keepalive ping");
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        symbol = %self.symbol,
                        last_message_secs = last_message.elapsed().as_secs(),
                        "No message received within timeout, sending keepalive"
                    );
                    if let Err(e) = socket.ping().await {
                        warn!(error = %e, "Failed to send keepalive ping, reconnecting");
                        return Err(MarketDataError::ConnectionTimeout);
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close().await;
        }
    }
}

/// Exponential backoff, capped at [`MAX_BACKOFF_MS`]
fn reconnect_delay(base_ms: u64, attempts: u32) -> Duration {
    let base_delay = base_ms.saturating_mul(2u64.pow(attempts.min(6)));
    Duration::from_millis(base_delay.min(MAX_BACKOFF_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        assert_eq!(reconnect_delay(1000, 1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(1000, 3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(1000, 6), Duration::from_secs(60));
        assert_eq!(reconnect_delay(1000, 30), Duration::from_secs(60));
    }

    #[test]
    fn test_stream_targets_symbol_depth_url() {
        let (tx, _rx) = mpsc::channel(1);
        let stream = DepthStream::new("wss://fstream.binance.com", "ethusdt", 1000, tx);
        assert_eq!(stream.symbol, "ETHUSDT");
        assert_eq!(
            stream.url,
            "wss://fstream.binance.com/stream?streams=ethusdt@depth@100ms"
        );
    }

    #[tokio::test]
    async fn test_stream_stops_when_subscriber_drops() {
        let (tx, rx) = mpsc::channel(1);
        let stream = DepthStream::new("ws://127.0.0.1:9", "BTCUSDT", 10, tx);
        drop(rx);

        let finished = timeout(Duration::from_secs(5), tokio::spawn(stream.run())).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }
}
