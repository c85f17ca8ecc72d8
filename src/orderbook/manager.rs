//! Order book manager
//!
//! Manages one synchronized subscription per symbol.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::subscription::{
    spawn_subscription, FeedConnector, SnapshotSource, SubscriptionHandle, SubscriptionSettings,
    SyncStatus,
};

/// Manages order book subscriptions for multiple symbols
pub struct OrderBookManager {
    source: Arc<dyn SnapshotSource>,
    feed: Arc<dyn FeedConnector>,
    settings: SubscriptionSettings,
    subscriptions: HashMap<String, SubscriptionHandle>,
}

impl OrderBookManager {
    /// Create a new order book manager
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        feed: Arc<dyn FeedConnector>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            source,
            feed,
            settings,
            subscriptions: HashMap::new(),
        }
    }

    /// Start maintaining `symbol`; subscribing twice returns the existing handle
    pub fn subscribe(&mut self, symbol: &str) -> &SubscriptionHandle {
        let symbol = symbol.to_uppercase();
        let source = &self.source;
        let feed = &self.feed;
        let settings = &self.settings;

        self.subscriptions
            .entry(symbol.clone())
            .or_insert_with(|| {
                info!(symbol = %symbol, "Subscribing");
                spawn_subscription(&symbol, feed.connect(&symbol), source.clone(), settings.clone())
            })
    }

    /// Stop maintaining `symbol` and wait for its task to finish
    pub async fn unsubscribe(&mut self, symbol: &str) -> bool {
        match self.subscriptions.remove(&symbol.to_uppercase()) {
            Some(handle) => {
                info!(symbol = %handle.symbol(), "Unsubscribing");
                handle.unsubscribe().await;
                true
            }
            None => false,
        }
    }

    /// Tear down `from` before starting `to`
    ///
    /// No result of the old subscription can reach the new one.
    pub async fn switch_symbol(&mut self, from: &str, to: &str) -> &SubscriptionHandle {
        if !from.eq_ignore_ascii_case(to) {
            self.unsubscribe(from).await;
        }
        self.subscribe(to)
    }

    /// Get the handle for a symbol
    pub fn handle(&self, symbol: &str) -> Option<&SubscriptionHandle> {
        self.subscriptions.get(&symbol.to_uppercase())
    }

    /// Subscribed symbols, sorted
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.subscriptions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Sync status of every subscription, sorted by symbol
    pub fn statuses(&self) -> Vec<(String, SyncStatus)> {
        let mut statuses: Vec<(String, SyncStatus)> = self
            .subscriptions
            .iter()
            .map(|(symbol, handle)| (symbol.clone(), handle.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    /// Check if every subscription is synced
    pub fn all_synced(&self) -> bool {
        self.subscriptions
            .values()
            .all(|handle| handle.status() == SyncStatus::Synced)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Unsubscribe everything
    pub async fn shutdown(&mut self) {
        for (symbol, handle) in self.subscriptions.drain() {
            info!(symbol = %symbol, "Shutting down subscription");
            handle.unsubscribe().await;
        }
    }
}

impl fmt::Debug for OrderBookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderBookManager")
            .field("symbols", &self.symbols())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{DepthSnapshot, DepthUpdate, PriceLevel};
    use crate::subscription::{FeedEvent, MockSnapshotSource};
    use rust_decimal_macros::dec;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Hands out channels and keeps the sending halves for the test
    #[derive(Default)]
    struct ChannelFeed {
        senders: Mutex<HashMap<String, mpsc::Sender<FeedEvent>>>,
    }

    impl ChannelFeed {
        fn sender(&self, symbol: &str) -> mpsc::Sender<FeedEvent> {
            self.senders.lock().unwrap()[symbol].clone()
        }

        fn connects(&self) -> usize {
            self.senders.lock().unwrap().len()
        }
    }

    impl FeedConnector for ChannelFeed {
        fn connect(&self, symbol: &str) -> mpsc::Receiver<FeedEvent> {
            let (tx, rx) = mpsc::channel(16);
            self.senders.lock().unwrap().insert(symbol.to_string(), tx);
            rx
        }
    }

    fn manager() -> (OrderBookManager, Arc<ChannelFeed>) {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch_snapshot().returning(|_, _| {
            Ok(DepthSnapshot {
                last_update_id: 10,
                bids: vec![PriceLevel::new(dec!(100), dec!(1))],
                asks: vec![PriceLevel::new(dec!(101), dec!(1))],
            })
        });
        let feed = Arc::new(ChannelFeed::default());
        let manager = OrderBookManager::new(
            Arc::new(source),
            feed.clone(),
            SubscriptionSettings::default(),
        );
        (manager, feed)
    }

    fn bridge(symbol: &str) -> FeedEvent {
        FeedEvent::Depth(DepthUpdate {
            event_type: "depthUpdate".to_string(),
            event_time: 1,
            transaction_time: 1,
            symbol: symbol.to_string(),
            first_update_id: 8,
            final_update_id: 12,
            previous_final_update_id: Some(7),
            bids: vec![],
            asks: vec![],
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_is_idempotent() {
        let (mut manager, feed) = manager();

        assert_eq!(manager.subscribe("btcusdt").symbol(), "BTCUSDT");
        manager.subscribe("BTCUSDT");
        manager.subscribe("ethusdt");

        assert_eq!(feed.connects(), 2);
        assert_eq!(manager.symbols(), vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(
            manager.statuses(),
            vec![
                ("BTCUSDT".to_string(), SyncStatus::Unsynced),
                ("ETHUSDT".to_string(), SyncStatus::Unsynced),
            ]
        );
        assert!(!manager.all_synced());

        manager.shutdown().await;
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_syncs_through_manager() {
        let (mut manager, feed) = manager();
        let mut status = manager.subscribe("BTCUSDT").status_updates();

        let tx = feed.sender("BTCUSDT");
        tx.send(FeedEvent::Connected).await.unwrap();
        tx.send(bridge("BTCUSDT")).await.unwrap();

        status.wait_for(|s| *s == SyncStatus::Synced).await.unwrap();
        assert!(manager.all_synced());

        let handle = manager.handle("btcusdt").unwrap();
        assert_eq!(handle.current_book().await.last_update_id, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_symbol_tears_down_previous() {
        let (mut manager, feed) = manager();
        manager.subscribe("BTCUSDT");
        let old_feed = feed.sender("BTCUSDT");

        let handle = manager.switch_symbol("BTCUSDT", "ETHUSDT").await;
        assert_eq!(handle.symbol(), "ETHUSDT");

        // unsubscribe awaited the task, so its feed receiver is gone
        assert!(old_feed.is_closed());
        assert!(manager.handle("BTCUSDT").is_none());
        assert_eq!(manager.symbols(), vec!["ETHUSDT"]);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_unknown_symbol() {
        let (mut manager, _feed) = manager();
        assert!(!manager.unsubscribe("BTCUSDT").await);

        manager.subscribe("BTCUSDT");
        assert!(manager.unsubscribe("btcusdt").await);
        assert!(manager.is_empty());
    }
}
