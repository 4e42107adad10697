//! Core traits - Seams to the exchange and the feed transport

use async_trait::async_trait;

use crate::core::{OrderRecord, OrderRequest, ProductInfo, Result};

/// Exchange trait - Order entry against the upstream venue
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Exchange name
    fn name(&self) -> &str;

    /// List tradeable products
    async fn get_products(&self) -> Result<Vec<ProductInfo>>;

    /// Get order status
    async fn get_order(&self, order_id: &str) -> Result<OrderRecord>;

    /// Place a limit order
    async fn place_order(&self, request: OrderRequest) -> Result<OrderRecord>;

    /// Cancel an order, returning the ids the exchange cancelled
    async fn cancel_order(&self, order_id: &str) -> Result<Vec<String>>;
}

/// Feed transport - Tears down and rebuilds the market data connection
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Reconnect and resubscribe; fresh snapshots follow on success.
    async fn reconnect(&self) -> Result<()>;
}
