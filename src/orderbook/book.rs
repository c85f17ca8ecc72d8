//! Core order book implementation
//!
//! Price levels live in hash maps so point updates stay O(1); ordering is
//! only materialized when a sorted view is requested.

use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{BookLevels, Level, Side};
use crate::parser::{DepthSnapshot, DepthUpdate, PriceLevel};

/// Order book for a single symbol
#[derive(Debug, Clone)]
pub struct OrderBook {
    symbol: String,
    /// Bid price -> quantity, every quantity strictly positive
    bids: HashMap<Decimal, Decimal>,
    /// Ask price -> quantity, every quantity strictly positive
    asks: HashMap<Decimal, Decimal>,
    /// Final update ID of the last snapshot or update folded in
    last_update_id: u64,
    /// Event time of the last applied update
    last_update_time: u64,
    /// Bumped on every seed and applied update
    version: u64,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: HashMap::new(),
            asks: HashMap::new(),
            last_update_id: 0,
            last_update_time: 0,
            version: 0,
        }
    }

    /// Replace both sides with a REST snapshot
    pub fn reset(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();

        for level in &snapshot.bids {
            if level.price > Decimal::ZERO && level.quantity > Decimal::ZERO {
                self.bids.insert(level.price, level.quantity);
            }
        }

        for level in &snapshot.asks {
            if level.price > Decimal::ZERO && level.quantity > Decimal::ZERO {
                self.asks.insert(level.price, level.quantity);
            }
        }

        self.last_update_id = snapshot.last_update_id;
        self.version += 1;
    }

    /// Fold a depth update into the book
    ///
    /// Sequence checks are the caller's job; this only mutates levels.
    pub fn apply_update(&mut self, update: &DepthUpdate) {
        for level in &update.bids {
            self.apply_level(Side::Bid, level);
        }

        for level in &update.asks {
            self.apply_level(Side::Ask, level);
        }

        self.last_update_id = update.final_update_id;
        self.last_update_time = update.event_time;
        self.version += 1;
    }

    /// Set a single price level; zero quantity removes it
    pub fn apply_level(&mut self, side: Side, level: &PriceLevel) {
        let levels = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };

        if level.quantity.is_zero() {
            // Removals for levels we never saw are legitimate
            levels.remove(&level.price);
        } else {
            levels.insert(level.price, level.quantity);
        }
    }

    /// Raw price -> quantity map for one side
    pub fn side(&self, side: Side) -> &HashMap<Decimal, Decimal> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Quantity resting at a price, if the level exists
    pub fn quantity_at(&self, side: Side, price: Decimal) -> Option<Decimal> {
        self.side(side).get(&price).copied()
    }

    /// Levels of one side sorted best price first
    pub fn sorted_levels(&self, side: Side) -> Vec<Level> {
        let mut levels: Vec<Level> = self
            .side(side)
            .iter()
            .map(|(p, q)| Level {
                price: *p,
                quantity: *q,
            })
            .collect();

        match side {
            Side::Bid => levels.sort_unstable_by(|a, b| b.price.cmp(&a.price)),
            Side::Ask => levels.sort_unstable_by(|a, b| a.price.cmp(&b.price)),
        }
        levels
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().max().copied()
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().min().copied()
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Number of bid and ask levels
    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get last update ID
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn last_update_time(&self) -> u64 {
        self.last_update_time
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy of both sides for synchronous readers
    pub fn levels(&self) -> BookLevels {
        BookLevels {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id,
            bids: self.sorted_levels(Side::Bid),
            asks: self.sorted_levels(Side::Ask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn create_test_book() -> OrderBook {
        let mut book = OrderBook::new("BTCUSDT");
        let snapshot = DepthSnapshot {
            last_update_id: 100,
            bids: vec![
                PriceLevel::new(dec!(50000), dec!(1.0)),
                PriceLevel::new(dec!(49999), dec!(2.0)),
                PriceLevel::new(dec!(49998), dec!(0)),
            ],
            asks: vec![
                PriceLevel::new(dec!(50001), dec!(1.5)),
                PriceLevel::new(dec!(50002), dec!(2.5)),
            ],
        };
        book.reset(&snapshot);
        book
    }

    fn update(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>) -> DepthUpdate {
        DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: 1000,
            transaction_time: 999,
            symbol: "BTCUSDT".to_string(),
            first_update_id: 101,
            final_update_id: 102,
            previous_final_update_id: Some(100),
            bids,
            asks,
        }
    }

    #[test]
    fn test_reset_skips_empty_levels() {
        let book = create_test_book();
        assert_eq!(book.depth(), (2, 2));
        assert_eq!(book.quantity_at(Side::Bid, dec!(49998)), None);
        assert_eq!(book.last_update_id(), 100);
    }

    #[test]
    fn test_best_bid_ask() {
        let book = create_test_book();
        assert_eq!(book.best_bid(), Some(dec!(50000)));
        assert_eq!(book.best_ask(), Some(dec!(50001)));
        assert_eq!(book.mid_price(), Some(dec!(50000.5)));
    }

    #[test]
    fn test_apply_update_overwrites_and_removes() {
        let mut book = create_test_book();
        let version = book.version();

        book.apply_update(&update(
            vec![
                PriceLevel::new(dec!(50000), dec!(0.000)),
                PriceLevel::new(dec!(49999), dec!(3)),
            ],
            vec![PriceLevel::new(dec!(50003), dec!(4))],
        ));

        assert_eq!(book.best_bid(), Some(dec!(49999)));
        assert_eq!(book.quantity_at(Side::Bid, dec!(49999)), Some(dec!(3)));
        assert_eq!(book.quantity_at(Side::Ask, dec!(50003)), Some(dec!(4)));
        assert_eq!(book.last_update_id(), 102);
        assert_eq!(book.version(), version + 1);
    }

    #[test]
    fn test_removing_unknown_level_is_noop() {
        let mut book = create_test_book();
        let before = book.levels();

        book.apply_update(&update(
            vec![PriceLevel::new(dec!(12345), dec!(0))],
            vec![PriceLevel::new(dec!(60000), dec!(0))],
        ));

        let after = book.levels();
        assert_eq!(before.bids, after.bids);
        assert_eq!(before.asks, after.asks);
    }

    #[test]
    fn test_decimal_keys_ignore_scale() {
        let mut book = create_test_book();
        book.apply_level(Side::Ask, &PriceLevel::new(dec!(50001.00), dec!(0)));
        assert_eq!(book.quantity_at(Side::Ask, dec!(50001)), None);
    }

    #[test]
    fn test_sorted_levels_order() {
        let book = create_test_book();
        let levels = book.levels();
        assert_eq!(levels.bids[0].price, dec!(50000));
        assert_eq!(levels.bids[1].price, dec!(49999));
        assert_eq!(levels.asks[0].price, dec!(50001));
        assert_eq!(levels.best_ask().map(|l| l.quantity), Some(dec!(1.5)));
    }
}
