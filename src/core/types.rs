//! Core Types - Strong typing for products, sides and orders

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::{Error, Result};

/// Tradeable product (e.g., "BTC-USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    /// Strict constructor: the product must look like `AAA-BBB`.
    pub fn parse(s: &str) -> Result<Self> {
        if is_valid_product(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(Error::validation(format!("product '{s}' must match AAA-BBB")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        is_valid_product(&self.0)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Three uppercase letters, a dash, three uppercase letters.
pub fn is_valid_product(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 7
        && bytes[3] == b'-'
        && bytes[..3].iter().chain(&bytes[4..]).all(u8::is_ascii_uppercase)
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(Error::validation(format!("side must be 'buy' or 'sell', got '{other}'"))),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Placing,
    Placed,
    Partial,
    Filled,
    Cancelling,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Placing => "placing",
            OrderStatus::Placed => "placed",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelling => "cancelling",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Waiting for a (re-)placement at the current best price.
    pub fn awaiting_placement(&self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::Cancelled)
    }

    /// Resting on the exchange and subject to re-pricing.
    pub fn is_resting(&self) -> bool {
        matches!(self, OrderStatus::Placed | OrderStatus::Partial)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "created" => OrderStatus::Created,
            "placing" => OrderStatus::Placing,
            "placed" => OrderStatus::Placed,
            "partial" => OrderStatus::Partial,
            "filled" => OrderStatus::Filled,
            "cancelling" => OrderStatus::Cancelling,
            "cancelled" => OrderStatus::Cancelled,
            other => {
                return Err(Error::validation(format!(
                    "order status must be one of created, placing, placed, partial, filled, cancelling or cancelled, got '{other}'"
                )))
            }
        })
    }
}

/// A desired order, owned by the broker once queued.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    id: Option<String>,
    product: Symbol,
    side: Side,
    size: Decimal,
    remaining: Decimal,
    limit: Option<Decimal>,
    status: OrderStatus,
}

/// Orders are shared between the caller and the broker queue.
pub type SharedOrder = Arc<RwLock<Order>>;

impl Order {
    pub fn new(product: &str, side: Side, size: Decimal) -> Result<Self> {
        let product = Symbol::parse(product)?;
        if size <= Decimal::ZERO {
            return Err(Error::validation(format!("order size must be positive, got {size}")));
        }
        Ok(Self {
            id: None,
            product,
            side,
            size,
            remaining: size,
            limit: None,
            status: OrderStatus::Created,
        })
    }

    pub fn into_shared(self) -> SharedOrder {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn product(&self) -> &Symbol {
        &self.product
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn size(&self) -> Decimal {
        self.size
    }

    pub fn remaining(&self) -> Decimal {
        self.remaining
    }

    pub fn limit(&self) -> Option<Decimal> {
        self.limit
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn is_valid(&self) -> bool {
        self.product.is_valid()
            && self.size > Decimal::ZERO
            && self.remaining >= Decimal::ZERO
            && self.remaining <= self.size
    }

    pub fn set_id(&mut self, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::validation("order id must be a non-empty string"));
        }
        self.id = Some(id.to_string());
        Ok(())
    }

    pub fn set_limit(&mut self, price: Decimal) -> Result<()> {
        if price <= Decimal::ZERO {
            return Err(Error::validation(format!("limit price must be positive, got {price}")));
        }
        self.limit = Some(price);
        Ok(())
    }

    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
    }

    pub fn set_status_str(&mut self, status: &str) -> Result<()> {
        self.status = status.parse()?;
        Ok(())
    }

    /// Bypasses validation so tests can build orders that fail `is_valid`.
    #[cfg(test)]
    pub(crate) fn force_remaining(&mut self, size: Decimal) {
        self.remaining = size;
    }

    pub fn set_remaining(&mut self, size: Decimal) -> Result<()> {
        if size < Decimal::ZERO || size > self.size {
            return Err(Error::validation(format!(
                "remaining size must be within 0..={}, got {size}",
                self.size
            )));
        }
        self.remaining = size;
        Ok(())
    }
}

/// Order entry as written in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub product: String,
    pub side: Side,
    pub size: Decimal,
}

impl TryFrom<&OrderTicket> for Order {
    type Error = Error;

    fn try_from(ticket: &OrderTicket) -> Result<Self> {
        Order::new(&ticket.product, ticket.side, ticket.size)
    }
}

/// Price level in the L2 ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Product listed by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: Symbol,
    pub base_currency: String,
    pub quote_currency: String,
    pub base_min_size: Decimal,
    pub quote_increment: Decimal,
}

/// Limit order submission
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub client_oid: Uuid,
    pub product: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub post_only: bool,
}

impl OrderRequest {
    /// Passive limit request for whatever is left of `order` at `price`.
    pub fn maker(order: &Order, price: Decimal) -> Self {
        Self {
            client_oid: Uuid::new_v4(),
            product: order.product.clone(),
            side: order.side,
            size: order.remaining,
            price,
            post_only: true,
        }
    }
}

/// Order as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub product_id: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub status: String,
    pub filled_size: Decimal,
    pub done_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
