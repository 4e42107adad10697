//! Feed hub - fan-out point between the transport and its consumers

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::core::Result;
use crate::events::{Listeners, SubscriptionId};
use crate::feeds::messages::{FeedEventKind, FeedMessage};

/// The transport publishes decoded messages here; books, the broker and the
/// health monitor subscribe by message kind.
#[derive(Default)]
pub struct FeedHub {
    listeners: Listeners<FeedEventKind, FeedMessage>,
    received: AtomicU64,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: FeedEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&FeedMessage) + Send + Sync + 'static,
    {
        self.listeners.subscribe(kind, handler)
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&FeedMessage) + Send + Sync + 'static,
    {
        self.listeners.subscribe_all(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Deliver one message to its subscribers, synchronously.
    pub fn publish(&self, msg: &FeedMessage) -> usize {
        self.received.fetch_add(1, Ordering::Relaxed);
        let delivered = self.listeners.emit(msg.kind(), msg);
        trace!(kind = ?msg.kind(), delivered, "feed message published");
        delivered
    }

    /// Decode a raw frame and publish it.
    pub fn publish_json(&self, text: &str) -> Result<usize> {
        let msg = FeedMessage::from_json(text)?;
        Ok(self.publish(&msg))
    }

    /// Messages published so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_routes_by_kind() {
        let hub = FeedHub::new();
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let everything = Arc::new(AtomicUsize::new(0));

        let h = heartbeats.clone();
        hub.subscribe(FeedEventKind::Heartbeat, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let e = everything.clone();
        hub.subscribe_all(move |_| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        hub.publish_json(
            r#"{"type":"heartbeat","sequence":1,"last_trade_id":1,"product_id":"BTC-USD","time":"2020-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        hub.publish_json(r#"{"type":"ticker","product_id":"BTC-USD","price":"1"}"#).unwrap();

        assert_eq!(heartbeats.load(Ordering::SeqCst), 1);
        assert_eq!(everything.load(Ordering::SeqCst), 2);
        assert_eq!(hub.received(), 2);
    }

    #[test]
    fn test_bad_frame_is_an_error() {
        let hub = FeedHub::new();
        assert!(hub.publish_json("{not json").is_err());
        assert_eq!(hub.received(), 0);
    }
}
