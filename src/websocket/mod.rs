//! WebSocket module for Binance depth streams

mod client;
mod manager;

pub use client::{classify, depth_stream_url, DepthSocket};
pub use manager::WebSocketManager;
