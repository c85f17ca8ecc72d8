//! REST snapshot client

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::SnapshotSource;
use crate::error::{MarketDataError, Result};
use crate::parser::DepthSnapshot;

/// Fetches depth snapshots from the futures REST API
#[derive(Debug, Clone)]
pub struct RestSnapshotClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RestSnapshotClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn depth_url(&self, symbol: &str, limit: u32) -> String {
        format!("{}/depth?symbol={}&limit={}", self.endpoint, symbol, limit)
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotClient {
    async fn fetch_snapshot(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot> {
        let url = self.depth_url(symbol, limit);
        info!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::SnapshotStatus {
                symbol: symbol.to_string(),
                status: status.as_u16(),
            });
        }

        let snapshot = response.json::<DepthSnapshot>().await?;
        debug!(
            symbol = %symbol,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "Snapshot received"
        );

        Ok(snapshot)
    }
}
