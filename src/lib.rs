//! Depth Sync - Local Order Book Reconstruction
//!
//! This crate keeps a local copy of an exchange order book in sync from a
//! REST snapshot and the futures diff depth stream, and derives cumulative
//! depth views with budget-based sizing from it.

use std::sync::Arc;
use tokio::sync::RwLock;

pub mod config;
pub mod error;
pub mod orderbook;
pub mod parser;
pub mod publisher;
pub mod subscription;
pub mod telemetry;
pub mod websocket;

pub use config::Config;
pub use error::{MarketDataError, Result};
pub use orderbook::{
    BookLevels, Budget, DepthLevel, DerivedBookView, OrderBook, OrderBookManager,
    OrderBookMetrics,
};
pub use parser::{DepthSnapshot, DepthUpdate, ParsedMessage, PriceLevel};
pub use publisher::Publisher;
pub use subscription::{
    FeedConnector, FeedEvent, RestSnapshotClient, SnapshotSource, SubscriptionHandle,
    SyncStatus,
};
pub use websocket::WebSocketManager;

/// Application state shared across components
pub struct AppState {
    pub manager: Arc<RwLock<OrderBookManager>>,
    pub publisher: Arc<Publisher>,
    pub config: Arc<Config>,
}
