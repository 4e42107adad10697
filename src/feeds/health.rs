//! Feed health - heartbeat staleness and full reload
//!
//! A stale feed is never repaired in place. The watchdog resets every book
//! and asks the transport for a fresh connection; new snapshots rebuild the
//! books from scratch.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::{Error, FeedConnector, Result};
use crate::events::SubscriptionId;
use crate::feeds::messages::FeedEventKind;
use crate::feeds::FeedHub;
use crate::orderbook::OrderBook;

/// Tracks the last heartbeat seen on the feed
pub struct FeedHealth {
    timeout: Duration,
    last_beat: Mutex<Instant>,
}

impl FeedHealth {
    /// Creation counts as the first beat.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_beat: Mutex::new(Instant::now()),
        }
    }

    pub fn record_heartbeat(&self) {
        *self.last_beat.lock() = Instant::now();
    }

    pub fn since_last_beat(&self) -> Duration {
        self.last_beat.lock().elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.since_last_beat() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn attach(self: &Arc<Self>, hub: &FeedHub) -> SubscriptionId {
        let health = Arc::clone(self);
        hub.subscribe(FeedEventKind::Heartbeat, move |_| health.record_heartbeat())
    }
}

/// Periodically checks feed health and rebuilds the feed when it goes stale
pub struct Watchdog {
    health: Arc<FeedHealth>,
    connector: Arc<dyn FeedConnector>,
    books: Vec<Arc<OrderBook>>,
    check_interval: Duration,
    max_failures: u32,
}

impl Watchdog {
    pub fn new(
        health: Arc<FeedHealth>,
        connector: Arc<dyn FeedConnector>,
        books: Vec<Arc<OrderBook>>,
        check_interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            health,
            connector,
            books,
            check_interval,
            max_failures: max_failures.max(1),
        }
    }

    /// One health check. Returns whether a reload was attempted and, if so,
    /// how it went.
    pub async fn check(&self) -> Option<Result<()>> {
        if !self.health.is_stale() {
            return None;
        }

        warn!(
            silent_for = ?self.health.since_last_beat(),
            books = self.books.len(),
            "feed is stale, reloading"
        );
        for book in &self.books {
            book.reset();
        }

        let outcome = self.connector.reconnect().await;
        if outcome.is_ok() {
            // a fresh connection gets a full timeout before it is judged
            self.health.record_heartbeat();
            info!("feed reloaded");
        }
        Some(outcome)
    }

    /// Run until reloads fail `max_failures` times in a row.
    pub async fn run(self) -> Result<()> {
        let mut failures = 0u32;
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.check().await {
                None => {}
                Some(Ok(())) => failures = 0,
                Some(Err(e)) => {
                    failures += 1;
                    warn!(failures, error = %e, "feed reload failed");
                    if failures >= self.max_failures {
                        error!(failures, "giving up on feed reload");
                        return Err(Error::StaleFeed { failures });
                    }
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}
