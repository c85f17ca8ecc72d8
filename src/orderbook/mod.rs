//! Order book module
//!
//! Maintains a synchronized local order book from a REST snapshot and the
//! futures diff depth stream, and derives depth views from it.

mod book;
mod buffer;
mod manager;
mod metrics;
mod projector;
mod sync;

pub use book::OrderBook;
pub use buffer::{DepthUpdateBuffer, Subscription};
pub use manager::OrderBookManager;
pub use metrics::OrderBookMetrics;
pub use projector::{Budget, DepthProjector};
pub use sync::{DepthSync, Gap, SyncOutcome, SyncState};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Point-in-time copy of both sides, best price first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevels {
    pub symbol: String,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
}

impl BookLevels {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }
}

/// A level in a derived view with the running quantity from the touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_quantity: Decimal,
}

/// Sorted, cumulative depth for both sides plus sizing estimates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedBookView {
    pub symbol: String,
    pub timestamp: u64,
    pub last_update_id: u64,
    /// Top bids, highest price first
    pub bids: Vec<DepthLevel>,
    /// Top asks, lowest price first
    pub asks: Vec<DepthLevel>,
    /// Cumulative quantity at the deepest displayed bid
    pub bid_depth: Decimal,
    /// Cumulative quantity at the deepest displayed ask
    pub ask_depth: Decimal,
    /// Largest size buyable with the budget, walking the asks
    pub max_buy_size: Decimal,
    /// Largest size sellable with the budget, walking the bids
    pub max_sell_size: Decimal,
    pub metrics: OrderBookMetrics,
}
