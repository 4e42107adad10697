//! Wire messages of the L2 / trade feed
//!
//! Prices and sizes stay as the exchange sent them (decimal strings) until a
//! consumer parses them with [`parse_decimal`]; a bad number is a
//! validation error at the call site, never a silent zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::{Error, Result, Side};

/// Decoded feed message, tagged by its `type` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FeedMessage {
    Snapshot(Snapshot),
    L2update(L2Update),
    Match(Match),
    Heartbeat(Heartbeat),
    Ticker(Ticker),
    /// Anything the core does not consume (subscriptions, received, ...)
    #[serde(other)]
    Other,
}

/// Message kinds, used as subscription keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    Snapshot,
    L2Update,
    Match,
    Heartbeat,
    Ticker,
    Other,
}

impl FeedMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> FeedEventKind {
        match self {
            FeedMessage::Snapshot(_) => FeedEventKind::Snapshot,
            FeedMessage::L2update(_) => FeedEventKind::L2Update,
            FeedMessage::Match(_) => FeedEventKind::Match,
            FeedMessage::Heartbeat(_) => FeedEventKind::Heartbeat,
            FeedMessage::Ticker(_) => FeedEventKind::Ticker,
            FeedMessage::Other => FeedEventKind::Other,
        }
    }

    pub fn product_id(&self) -> Option<&str> {
        match self {
            FeedMessage::Snapshot(m) => Some(&m.product_id),
            FeedMessage::L2update(m) => Some(&m.product_id),
            FeedMessage::Match(m) => Some(&m.product_id),
            FeedMessage::Heartbeat(m) => Some(&m.product_id),
            FeedMessage::Ticker(m) => Some(&m.product_id),
            FeedMessage::Other => None,
        }
    }

    pub fn is_ticker(&self) -> bool {
        matches!(self, FeedMessage::Ticker(_))
    }
}

/// Full depth snapshot. Levels are `[price, size, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub product_id: String,
    pub bids: Vec<Vec<String>>,
    pub asks: Vec<Vec<String>>,
}

/// Incremental depth changes. Changes are `[side, price, size]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct L2Update {
    pub product_id: String,
    pub changes: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
}

/// Trade between a maker and a taker order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub maker_order_id: String,
    pub taker_order_id: String,
    pub size: String,
    pub price: String,
    pub product_id: String,
    pub side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<u64>,
}

impl Match {
    pub fn involves(&self, order_id: &str) -> bool {
        self.maker_order_id == order_id || self.taker_order_id == order_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_trade_id: u64,
    pub product_id: String,
    pub sequence: u64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub product_id: String,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
}

/// Parse a wire decimal; `field` names it in the error.
pub fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| Error::validation(format!("{field} '{raw}' is not a decimal: {e}")))
}

/// One `[price, size]` level, both non-negative.
pub fn parse_level(level: &[String]) -> Result<(Decimal, Decimal)> {
    let [price, size, ..] = level else {
        return Err(Error::validation(format!("level {level:?} needs a price and a size")));
    };
    let price = parse_decimal("price", price)?;
    let size = parse_decimal("size", size)?;
    if price <= Decimal::ZERO || size < Decimal::ZERO {
        return Err(Error::validation(format!("level {price}/{size} is out of range")));
    }
    Ok((price, size))
}

/// One `[side, price, size]` change.
pub fn parse_change(change: &[String]) -> Result<(Side, Decimal, Decimal)> {
    let [side, price, size] = change else {
        return Err(Error::validation(format!("change {change:?} must be [side, price, size]")));
    };
    let side: Side = side.parse()?;
    let (price, size) = parse_level(&[price.clone(), size.clone()])?;
    Ok((side, price, size))
}
