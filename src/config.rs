//! Configuration module for the depth synchronization service

use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MarketDataError, Result};
use crate::orderbook::Budget;
use crate::subscription::SubscriptionSettings;

/// Highest leverage the futures venue offers
const MAX_LEVERAGE: Decimal = Decimal::from_parts(125, 0, 0, false, 0);

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Futures symbols to maintain books for (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// WebSocket endpoint for the diff depth stream
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// IPC socket path for publishing derived views
    pub ipc_socket_path: String,

    /// Levels requested per snapshot
    pub snapshot_limit: u32,

    /// Events retained while looking for the bridging update
    pub scan_window: usize,

    /// Levels per side included in each derived view
    pub display_depth: usize,

    /// Minimum interval between derived views
    pub refresh_interval_ms: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,

    /// Snapshot retry settings
    pub snapshot_retry_delay_ms: u64,
    pub snapshot_max_retries: u32,

    /// Account balance and leverage used for max order size estimates
    pub balance: Option<Decimal>,
    pub leverage: Option<Decimal>,

    /// Port for the health and metrics server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            symbols,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            snapshot_limit: parse_var("SNAPSHOT_LIMIT", defaults.snapshot_limit),
            scan_window: parse_var("SCAN_WINDOW", defaults.scan_window),
            display_depth: parse_var("DISPLAY_DEPTH", defaults.display_depth),
            refresh_interval_ms: parse_var("REFRESH_INTERVAL_MS", defaults.refresh_interval_ms),
            reconnect_delay_ms: parse_var("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            snapshot_retry_delay_ms: parse_var(
                "SNAPSHOT_RETRY_DELAY_MS",
                defaults.snapshot_retry_delay_ms,
            ),
            snapshot_max_retries: parse_var("SNAPSHOT_MAX_RETRIES", defaults.snapshot_max_retries),
            balance: decimal_var("BALANCE")?,
            leverage: decimal_var("LEVERAGE")?,
            health_port: parse_var("HEALTH_PORT", defaults.health_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(MarketDataError::ConfigError(
                "at least one symbol is required".to_string(),
            ));
        }
        if self.scan_window < 2 {
            return Err(MarketDataError::ConfigError(format!(
                "scan window must hold at least 2 events, got {}",
                self.scan_window
            )));
        }
        if self.display_depth == 0 {
            return Err(MarketDataError::ConfigError(
                "display depth must be positive".to_string(),
            ));
        }
        if self.refresh_interval_ms == 0 {
            return Err(MarketDataError::ConfigError(
                "refresh interval must be positive".to_string(),
            ));
        }
        if self.balance.is_some() != self.leverage.is_some() {
            return Err(MarketDataError::ConfigError(
                "BALANCE and LEVERAGE must be set together".to_string(),
            ));
        }
        if matches!(self.leverage, Some(l) if l <= Decimal::ZERO || l > MAX_LEVERAGE) {
            return Err(MarketDataError::ConfigError(format!(
                "leverage must be in (0, {}]",
                MAX_LEVERAGE
            )));
        }
        if matches!(self.balance, Some(b) if b < Decimal::ZERO) {
            return Err(MarketDataError::ConfigError(
                "balance must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Budget for max buy/sell estimates, if configured
    pub fn budget(&self) -> Option<Budget> {
        match (self.balance, self.leverage) {
            (Some(balance), Some(leverage)) => Some(Budget::new(balance, leverage)),
            _ => None,
        }
    }

    /// Per-symbol subscription settings derived from this configuration
    pub fn subscription_settings(&self) -> SubscriptionSettings {
        SubscriptionSettings {
            snapshot_limit: self.snapshot_limit,
            scan_window: self.scan_window,
            display_depth: self.display_depth,
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
            snapshot_retry_delay: Duration::from_millis(self.snapshot_retry_delay_ms),
            snapshot_max_retries: self.snapshot_max_retries,
            budget: self.budget(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            ws_endpoint: "wss://fstream.binance.com".to_string(),
            rest_endpoint: "https://fapi.binance.com/fapi/v1".to_string(),
            ipc_socket_path: "/tmp/depth-sync.sock".to_string(),
            snapshot_limit: 1000,
            scan_window: 100,
            display_depth: 25,
            refresh_interval_ms: 250,
            reconnect_delay_ms: 1000,
            snapshot_retry_delay_ms: 500,
            snapshot_max_retries: 5,
            balance: None,
            leverage: None,
            health_port: 9090,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn decimal_var(key: &str) -> Result<Option<Decimal>> {
    match env::var(key) {
        Ok(raw) => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|e| MarketDataError::ConfigError(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.budget().is_none());
    }

    #[test]
    fn test_rejects_tiny_scan_window() {
        let config = Config {
            scan_window: 1,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MarketDataError::ConfigError(_))
        ));
    }

    #[test]
    fn test_budget_requires_both_values() {
        let config = Config {
            balance: Some(dec!(1000)),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            balance: Some(dec!(1000)),
            leverage: Some(dec!(20)),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        let settings = config.subscription_settings();
        assert_eq!(settings.budget.map(|b| b.notional()), Some(dec!(20000)));
        assert_eq!(settings.refresh_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_out_of_range_budget() {
        let config = Config {
            balance: Some(dec!(1000)),
            leverage: Some(dec!(1000)),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(MarketDataError::ConfigError(_))
        ));

        let config = Config {
            balance: Some(dec!(-1)),
            leverage: Some(dec!(10)),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            balance: Some(dec!(1000)),
            leverage: Some(dec!(125)),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
