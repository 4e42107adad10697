//! Paper exchange - in-memory order entry for replays and tests
//!
//! Orders rest forever unless cancelled or filled through [`PaperExchange::fill`],
//! which also produces the `match` message a real feed would carry.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::{Error, Exchange, OrderRecord, OrderRequest, ProductInfo, Result, Symbol};
use crate::feeds::messages::{FeedMessage, Match};

#[derive(Default)]
struct PaperBook {
    orders: HashMap<String, OrderRecord>,
    placed: Vec<OrderRequest>,
    cancelled: Vec<String>,
    /// Injected failures still to hand out
    place_failures: usize,
    cancel_failures: usize,
    next_trade_id: u64,
}

pub struct PaperExchange {
    name: String,
    products: Vec<ProductInfo>,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(products: &[Symbol]) -> Self {
        let products = products
            .iter()
            .map(|id| {
                let (base, quote) = id.as_str().split_once('-').unwrap_or((id.as_str(), ""));
                ProductInfo {
                    id: id.clone(),
                    base_currency: base.to_string(),
                    quote_currency: quote.to_string(),
                    base_min_size: Decimal::new(1, 8),
                    quote_increment: Decimal::new(1, 2),
                }
            })
            .collect();

        Self {
            name: "paper".to_string(),
            products,
            book: Mutex::new(PaperBook::default()),
        }
    }

    /// The next `n` placements are rejected.
    pub fn fail_next_places(&self, n: usize) {
        self.book.lock().place_failures = n;
    }

    /// The next `n` cancellations are rejected.
    pub fn fail_next_cancels(&self, n: usize) {
        self.book.lock().cancel_failures = n;
    }

    /// Every request that was accepted, in order
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.book.lock().placed.clone()
    }

    /// Ids of every accepted cancellation, in order
    pub fn cancelled(&self) -> Vec<String> {
        self.book.lock().cancelled.clone()
    }

    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.book
            .lock()
            .orders
            .values()
            .filter(|o| o.status == "open")
            .cloned()
            .collect()
    }

    /// Trade `size` against a resting order. Returns the feed message
    /// reporting it, with the paper order as maker.
    pub fn fill(&self, order_id: &str, size: Decimal) -> Result<FeedMessage> {
        let mut book = self.book.lock();
        book.next_trade_id += 1;
        let trade_id = book.next_trade_id;

        let record = book
            .orders
            .get_mut(order_id)
            .filter(|o| o.status == "open")
            .ok_or_else(|| Error::Exchange(format!("no open order {order_id}")))?;

        let size = size.min(record.size - record.filled_size);
        record.filled_size += size;
        if record.filled_size >= record.size {
            record.status = "done".to_string();
            record.done_reason = Some("filled".to_string());
        }

        Ok(FeedMessage::Match(Match {
            maker_order_id: record.id.clone(),
            taker_order_id: Uuid::new_v4().to_string(),
            size: size.to_string(),
            price: record.price.unwrap_or_default().to_string(),
            product_id: record.product_id.to_string(),
            side: record.side,
            trade_id: Some(trade_id),
        }))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_products(&self) -> Result<Vec<ProductInfo>> {
        Ok(self.products.clone())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderRecord> {
        self.book
            .lock()
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| Error::Exchange(format!("order {order_id} not found")))
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderRecord> {
        let mut book = self.book.lock();
        if book.place_failures > 0 {
            book.place_failures -= 1;
            return Err(Error::Network("paper exchange: injected place failure".to_string()));
        }
        if !self.products.iter().any(|p| p.id == request.product) {
            return Err(Error::Exchange(format!("unknown product {}", request.product)));
        }
        if request.size <= Decimal::ZERO || request.price <= Decimal::ZERO {
            return Err(Error::Exchange(format!(
                "invalid order size {} / price {}",
                request.size, request.price
            )));
        }

        let record = OrderRecord {
            id: Uuid::new_v4().to_string(),
            product_id: request.product.clone(),
            side: request.side,
            size: request.size,
            price: Some(request.price),
            status: "open".to_string(),
            filled_size: Decimal::ZERO,
            done_reason: None,
            created_at: Utc::now(),
        };
        info!(
            order_id = %record.id,
            product = %request.product,
            side = %request.side,
            size = %request.size,
            price = %request.price,
            "paper order placed"
        );
        book.orders.insert(record.id.clone(), record.clone());
        book.placed.push(request);
        Ok(record)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Vec<String>> {
        let mut book = self.book.lock();
        if book.cancel_failures > 0 {
            book.cancel_failures -= 1;
            return Err(Error::Network("paper exchange: injected cancel failure".to_string()));
        }

        let record = book
            .orders
            .get_mut(order_id)
            .filter(|o| o.status == "open")
            .ok_or_else(|| Error::Exchange(format!("no open order {order_id}")))?;
        record.status = "done".to_string();
        record.done_reason = Some("canceled".to_string());

        debug!(order_id, "paper order cancelled");
        book.cancelled.push(order_id.to_string());
        Ok(vec![order_id.to_string()])
    }
}
