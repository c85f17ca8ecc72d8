//! Parser module for Binance futures depth messages
//!
//! Handles deserialization of diff depth updates and REST depth snapshots.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

use crate::error::{MarketDataError, Result};

/// Binance futures diff depth update
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event type
    #[serde(rename = "e")]
    pub event_type: String,

    /// Event time (milliseconds)
    #[serde(rename = "E", default)]
    pub event_time: u64,

    /// Transaction time (milliseconds)
    #[serde(rename = "T", default)]
    pub transaction_time: u64,

    /// Symbol
    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    /// Final update ID of the previous event on this stream
    #[serde(rename = "pu", default)]
    pub previous_final_update_id: Option<u64>,

    /// Bids to update
    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks to update
    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

impl DepthUpdate {
    /// Reject updates that deserialize but cannot be applied safely
    pub fn validate(&self) -> Result<()> {
        if self.first_update_id > self.final_update_id {
            return Err(MarketDataError::MalformedEvent(format!(
                "{}: first update id {} exceeds final update id {}",
                self.symbol, self.first_update_id, self.final_update_id
            )));
        }

        if let Some(level) = self
            .bids
            .iter()
            .chain(&self.asks)
            .find(|l| l.price <= Decimal::ZERO || l.quantity < Decimal::ZERO)
        {
            return Err(MarketDataError::MalformedEvent(format!(
                "{}: invalid level {} @ {}",
                self.symbol, level.quantity, level.price
            )));
        }

        Ok(())
    }
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot from REST API
#[derive(Debug, Clone, Deserialize)]
pub struct DepthSnapshot {
    /// Last update ID
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,

    /// Bids
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    /// Asks
    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    /// Stream name
    pub stream: String,

    /// Data payload
    pub data: serde_json::Value,
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    Unknown(String),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    ///
    /// Anything that claims to be a depth update but is missing sequence
    /// fields or carries invalid levels is an error; other payloads
    /// (subscription acks, unrelated streams) come back as `Unknown`.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        // Combined streams wrap the event in {"stream": ..., "data": ...}
        if value.get("stream").is_some() && value.get("data").is_some() {
            let stream_msg: StreamMessage = serde_json::from_value(value)?;
            return Self::parse_stream_data(&stream_msg.stream, stream_msg.data);
        }

        Self::parse_event(value)
    }

    fn parse_stream_data(stream: &str, data: serde_json::Value) -> Result<Self> {
        if stream.contains("depth") {
            Self::parse_event(data)
        } else {
            Ok(ParsedMessage::Unknown(data.to_string()))
        }
    }

    fn parse_event(value: serde_json::Value) -> Result<Self> {
        if value.get("e").and_then(|e| e.as_str()) != Some("depthUpdate") {
            return Ok(ParsedMessage::Unknown(value.to_string()));
        }

        let depth: DepthUpdate = serde_json::from_value(value)
            .map_err(|e| MarketDataError::MalformedEvent(e.to_string()))?;
        depth.validate()?;
        Ok(ParsedMessage::DepthUpdate(depth))
    }
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "e": "depthUpdate",
            "E": 1672531200000,
            "T": 1672531199990,
            "s": "BTCUSDT",
            "U": 100,
            "u": 105,
            "pu": 99,
            "b": [["50000.00", "1.5"], ["49999.00", "0.000"]],
            "a": [["50001.00", "1.0"], ["50002.00", "0.5"]]
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::DepthUpdate(depth) = msg {
            assert_eq!(depth.symbol, "BTCUSDT");
            assert_eq!(depth.previous_final_update_id, Some(99));
            assert_eq!(depth.bids.len(), 2);
            assert_eq!(depth.asks.len(), 2);
            assert_eq!(depth.bids[0].price, dec!(50000.00));
            assert!(depth.bids[1].quantity.is_zero());
        } else {
            panic!("Expected DepthUpdate");
        }
    }

    #[test]
    fn test_parse_combined_stream() {
        let raw = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {"e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 8, "u": 12, "pu": null,
                     "b": [["100", "7"]], "a": []}
        }"#;

        match ParsedMessage::parse(raw).unwrap() {
            ParsedMessage::DepthUpdate(depth) => {
                assert_eq!(depth.first_update_id, 8);
                assert_eq!(depth.final_update_id, 12);
                assert_eq!(depth.previous_final_update_id, None);
            }
            other => panic!("Expected DepthUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_sequence_field_is_malformed() {
        let raw = r#"{"e": "depthUpdate", "E": 1, "s": "BTCUSDT", "u": 12, "b": [], "a": []}"#;
        assert!(matches!(
            ParsedMessage::parse(raw),
            Err(MarketDataError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_inverted_range_is_malformed() {
        let raw = r#"{"e": "depthUpdate", "s": "BTCUSDT", "U": 20, "u": 12, "b": [], "a": []}"#;
        assert!(matches!(
            ParsedMessage::parse(raw),
            Err(MarketDataError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_negative_quantity_is_malformed() {
        let raw = r#"{"e": "depthUpdate", "s": "BTCUSDT", "U": 1, "u": 2, "b": [["100", "-1"]], "a": []}"#;
        assert!(ParsedMessage::parse(raw).is_err());
    }

    #[test]
    fn test_subscription_ack_is_unknown() {
        let msg = ParsedMessage::parse(r#"{"result": null, "id": 1}"#).unwrap();
        assert!(matches!(msg, ParsedMessage::Unknown(_)));
    }

    #[test]
    fn test_parse_snapshot() {
        let raw = r#"{
            "lastUpdateId": 1027024,
            "E": 1589436922972,
            "T": 1589436922959,
            "bids": [["4.00000000", "431.00000000"]],
            "asks": [["4.00000200", "12.00000000"]]
        }"#;

        let snapshot: DepthSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.last_update_id, 1027024);
        assert_eq!(snapshot.bids[0], PriceLevel::new(dec!(4), dec!(431)));
        assert_eq!(snapshot.asks[0].price, dec!(4.000002));
    }
}
