//! Per-symbol subscription lifecycle
//!
//! Wires a depth feed, a snapshot source, the reconciler and the projector
//! together for one symbol and exposes the results through a handle.

mod controller;
mod rest;

pub use controller::{spawn_subscription, SubscriptionHandle};
pub use rest::RestSnapshotClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::orderbook::Budget;
use crate::parser::{DepthSnapshot, DepthUpdate};

/// Events delivered by a live depth feed, in send order
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Transport (re)connected; the stream may have skipped updates
    Connected,
    Depth(DepthUpdate),
    /// A depth message that could not be parsed or validated
    Malformed(String),
    Disconnected(String),
}

/// Point-in-time depth snapshots over request/response
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot>;
}

/// Opens a live depth feed for a symbol
///
/// The feed stops once the returned receiver is dropped.
pub trait FeedConnector: Send + Sync {
    fn connect(&self, symbol: &str) -> mpsc::Receiver<FeedEvent>;
}

/// Externally visible synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Unsynced,
    Scanning,
    Synced,
    /// Snapshot requests keep failing; the book may be stale
    Degraded,
}

/// Tuning for one subscription
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub snapshot_limit: u32,
    pub scan_window: usize,
    pub display_depth: usize,
    pub refresh_interval: Duration,
    pub snapshot_retry_delay: Duration,
    pub snapshot_max_retries: u32,
    pub budget: Option<Budget>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            snapshot_limit: 1000,
            scan_window: 100,
            display_depth: 25,
            refresh_interval: Duration::from_millis(250),
            snapshot_retry_delay: Duration::from_millis(500),
            snapshot_max_retries: 5,
            budget: None,
        }
    }
}
