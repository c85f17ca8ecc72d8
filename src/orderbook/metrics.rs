//! Order book metrics calculation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::DepthLevel;

/// Levels per side used for the top-of-book imbalance
const IMBALANCE_LEVELS: usize = 5;

/// Computed metrics for an order book
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Simple imbalance over the top levels: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Total bid quantity across the whole book
    pub bid_volume: Decimal,

    /// Total ask quantity across the whole book
    pub ask_volume: Decimal,

    /// Number of bid levels
    pub bid_levels: usize,

    /// Number of ask levels
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Compute from full, sorted, cumulative sides (best price first)
    pub fn from_levels(bids: &[DepthLevel], asks: &[DepthLevel]) -> Self {
        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);

        let mid_price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        };

        let spread_bps = match (best_bid, best_ask, mid_price) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        };

        Self {
            mid_price,
            spread_bps,
            imbalance: imbalance(bids, asks, IMBALANCE_LEVELS),
            bid_volume: total(bids),
            ask_volume: total(asks),
            bid_levels: bids.len(),
            ask_levels: asks.len(),
        }
    }

    /// Check if the order book is healthy (has valid data)
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some()
            && self.spread_bps.is_some()
            && self.bid_levels > 0
            && self.ask_levels > 0
    }
}

fn total(levels: &[DepthLevel]) -> Decimal {
    levels
        .last()
        .map(|l| l.cumulative_quantity)
        .unwrap_or(Decimal::ZERO)
}

fn imbalance(bids: &[DepthLevel], asks: &[DepthLevel], levels: usize) -> Option<Decimal> {
    let bid_volume: Decimal = bids.iter().take(levels).map(|l| l.quantity).sum();
    let ask_volume: Decimal = asks.iter().take(levels).map(|l| l.quantity).sum();

    let total = bid_volume + ask_volume;
    if total > Decimal::ZERO {
        Some((bid_volume - ask_volume) / total)
    } else {
        None
    }
}
