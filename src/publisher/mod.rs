//! Publisher module for IPC communication
//!
//! Publishes derived depth views to other system components.

use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{MarketDataError, Result};
use crate::orderbook::DerivedBookView;

/// Publisher for sending depth views via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl Publisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Result<Self> {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // Consumer may not be listening yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        Ok(publisher)
    }

    /// Connect to the Unix socket
    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(MarketDataError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            MarketDataError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        *self.stream.lock().await = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Check if the socket is currently connected
    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    /// Publish a derived view
    ///
    /// Frames are a 4-byte big-endian length followed by the MessagePack
    /// body. Delivery is best effort; a missing consumer is not an error.
    pub async fn publish(&self, view: &DerivedBookView) -> Result<()> {
        let message = encode_frame(view)?;

        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&message).await {
                Ok(_) => {
                    debug!(
                        symbol = %view.symbol,
                        update_id = view.last_update_id,
                        "Published depth view"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }
}

/// Length-prefixed MessagePack frame
fn encode_frame(view: &DerivedBookView) -> Result<Vec<u8>> {
    let data = rmp_serde::to_vec_named(view).map_err(|e| {
        MarketDataError::SerializationError(format!("Failed to serialize: {}", e))
    })?;

    let len = (data.len() as u32).to_be_bytes();
    let mut message = Vec::with_capacity(4 + data.len());
    message.extend_from_slice(&len);
    message.extend_from_slice(&data);
    Ok(message)
}
