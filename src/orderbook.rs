//! L2 order book for a single product.
//!
//! A snapshot builds the ladder; l2update deltas are only queued on arrival
//! and applied later by the book's own engine, so feed callbacks stay O(1)
//! in the book size. Bids: descending (highest first). Asks: ascending
//! (lowest first).

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{Error, PriceLevel, Result, Side, Symbol};
use crate::engine::{Engine, ExecutionMode, Process};
use crate::events::SubscriptionId;
use crate::feeds::messages::{parse_change, parse_level, FeedEventKind, FeedMessage, Snapshot};
use crate::feeds::FeedHub;

/// A buffered `(side, price, size)` change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelta {
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Price → size on both sides. Zero sizes are never stored.
#[derive(Debug, Clone, Default)]
pub struct Ladder {
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl Ladder {
    fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let mut ladder = Ladder::default();
        for level in &snapshot.bids {
            let (price, size) = parse_level(level)?;
            upsert(&mut ladder.bids, Reverse(price), size);
        }
        for level in &snapshot.asks {
            let (price, size) = parse_level(level)?;
            upsert(&mut ladder.asks, price, size);
        }
        Ok(ladder)
    }

    /// Replace, insert or remove one level. size == 0 means remove.
    pub fn apply(&mut self, delta: &PendingDelta) {
        match delta.side {
            Side::Buy => upsert(&mut self.bids, Reverse(delta.price), delta.size),
            Side::Sell => upsert(&mut self.asks, delta.price, delta.size),
        }
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next().map(|(p, s)| PriceLevel::new(p.0, *s))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, s)| PriceLevel::new(*p, *s))
    }

    /// Size resting at exactly `price`
    pub fn level(&self, side: Side, price: Decimal) -> Option<PriceLevel> {
        let size = match side {
            Side::Buy => self.bids.get(&Reverse(price)),
            Side::Sell => self.asks.get(&price),
        };
        size.map(|s| PriceLevel::new(price, *s))
    }

    pub fn bids(&self) -> Vec<PriceLevel> {
        self.bids.iter().map(|(p, s)| PriceLevel::new(p.0, *s)).collect()
    }

    pub fn asks(&self) -> Vec<PriceLevel> {
        self.asks.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect()
    }
}

fn upsert<K: Ord>(levels: &mut BTreeMap<K, Decimal>, price: K, size: Decimal) {
    if size.is_zero() {
        levels.remove(&price);
    } else {
        levels.insert(price, size);
    }
}

struct BookState {
    product: Symbol,
    /// `None` until the first snapshot
    ladder: RwLock<Option<Ladder>>,
    pending: Mutex<VecDeque<PendingDelta>>,
    /// Held for one drain pass, and by `init` / `reset` while they swap the
    /// ladder, so a batch never lands on a ladder it was not taken for
    draining: Mutex<()>,
}

impl BookState {
    fn apply_queue(&self) -> bool {
        let Some(_pass) = self.draining.try_lock() else {
            return false;
        };
        if self.ladder.read().is_none() {
            return false;
        }

        // Everything queued after this point waits for the next pass.
        let batch: Vec<PendingDelta> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.drain(..).collect()
        };

        let mut guard = self.ladder.write();
        let Some(ladder) = guard.as_mut() else {
            debug!(product = %self.product, dropped = batch.len(), "book reset during drain");
            return false;
        };
        for delta in &batch {
            ladder.apply(delta);
        }
        true
    }
}

/// Order book for one product, kept in sync from snapshot + deltas
pub struct OrderBook {
    state: Arc<BookState>,
    engine: Engine,
}

impl OrderBook {
    pub fn new(product: Symbol) -> Self {
        Self::with_drain_interval(product, Duration::from_millis(10))
    }

    pub fn with_drain_interval(product: Symbol, drain: Duration) -> Self {
        Self {
            state: Arc::new(BookState {
                product,
                ladder: RwLock::new(None),
                pending: Mutex::new(VecDeque::new()),
                draining: Mutex::new(()),
            }),
            engine: Engine::new(drain, ExecutionMode::Sequential),
        }
    }

    pub fn product(&self) -> &Symbol {
        &self.state.product
    }

    /// Build the ladder from a snapshot and start draining deltas.
    ///
    /// A snapshot for another product is ignored (`Ok(false)`), so one
    /// dispatcher can hand every message to every book.
    pub fn init(&self, msg: &FeedMessage) -> Result<bool> {
        let FeedMessage::Snapshot(snapshot) = msg else {
            return Err(Error::validation(format!(
                "order book init expects a snapshot message, got {:?}",
                msg.kind()
            )));
        };
        if snapshot.product_id != self.state.product.as_str() {
            return Ok(false);
        }

        let ladder = Ladder::from_snapshot(snapshot)?;
        let (bids, asks) = (ladder.bids.len(), ladder.asks.len());
        {
            let _pass = self.state.draining.lock();
            let mut pending = self.state.pending.lock();
            let stale = pending.len();
            pending.clear();
            *self.state.ladder.write() = Some(ladder);
            if stale > 0 {
                debug!(product = %self.state.product, stale, "dropped deltas queued before snapshot");
            }
        }
        info!(product = %self.state.product, bids, asks, "order book initialized");

        let drain = Process::bind(
            "apply_queue",
            |state: Arc<BookState>, ()| async move {
                state.apply_queue();
                Ok::<(), Error>(())
            },
            Arc::clone(&self.state),
            (),
        );
        if !self.engine.start(vec![drain]) {
            warn!(product = %self.state.product, "drain loop not running, call apply_queue manually");
        }
        Ok(true)
    }

    /// Buffer the changes of an l2update message. Nothing is queued unless
    /// every change parses.
    pub fn queue_updates(&self, msg: &FeedMessage) -> Result<bool> {
        let FeedMessage::L2update(update) = msg else {
            return Err(Error::validation(format!(
                "queue_updates expects an l2update message, got {:?}",
                msg.kind()
            )));
        };
        let deltas = update
            .changes
            .iter()
            .map(|change| {
                parse_change(change).map(|(side, price, size)| PendingDelta { side, price, size })
            })
            .collect::<Result<Vec<_>>>()?;

        if update.product_id != self.state.product.as_str() {
            return Ok(false);
        }

        self.state.pending.lock().extend(deltas);
        Ok(true)
    }

    /// Apply the deltas queued at the start of this call, in arrival order.
    /// False when not initialized, when the queue is empty, or when another
    /// pass is already running.
    pub fn apply_queue(&self) -> bool {
        self.state.apply_queue()
    }

    /// Best bid for `Buy`, best ask for `Sell`.
    pub fn best_price(&self, side: Side) -> Option<PriceLevel> {
        let ladder = self.state.ladder.read();
        let ladder = ladder.as_ref()?;
        match side {
            Side::Buy => ladder.best_bid(),
            Side::Sell => ladder.best_ask(),
        }
    }

    /// Size resting at `price` on one side, if any.
    pub fn level(&self, side: Side, price: Decimal) -> Option<PriceLevel> {
        self.state.ladder.read().as_ref()?.level(side, price)
    }

    pub fn bids(&self) -> Vec<PriceLevel> {
        self.state.ladder.read().as_ref().map(Ladder::bids).unwrap_or_default()
    }

    pub fn asks(&self) -> Vec<PriceLevel> {
        self.state.ladder.read().as_ref().map(Ladder::asks).unwrap_or_default()
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_price(Side::Sell)?.price - self.best_price(Side::Buy)?.price)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.ladder.read().is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending.lock().len()
    }

    /// Whether the drain loop is scheduled
    pub fn is_draining(&self) -> bool {
        self.engine.is_started()
    }

    /// Back to uninitialized: ladder and queue dropped, drain loop stopped.
    /// The next snapshot rebuilds everything.
    pub fn reset(&self) {
        self.engine.stop();
        {
            let _pass = self.state.draining.lock();
            self.state.pending.lock().clear();
            *self.state.ladder.write() = None;
        }
        info!(product = %self.state.product, "order book reset");
    }

    /// Feed this book from `hub`: snapshots go to `init`, l2updates to
    /// `queue_updates`. Malformed messages are logged and dropped here since
    /// there is no caller to hand the error to.
    pub fn attach(self: &Arc<Self>, hub: &FeedHub) -> [SubscriptionId; 2] {
        let book: Weak<OrderBook> = Arc::downgrade(self);
        let snapshots = hub.subscribe(FeedEventKind::Snapshot, move |msg| {
            if let Some(book) = book.upgrade() {
                if let Err(e) = book.init(msg) {
                    warn!(product = %book.product(), error = %e, "rejected snapshot");
                }
            }
        });

        let book: Weak<OrderBook> = Arc::downgrade(self);
        let updates = hub.subscribe(FeedEventKind::L2Update, move |msg| {
            if let Some(book) = book.upgrade() {
                if let Err(e) = book.queue_updates(msg) {
                    warn!(product = %book.product(), error = %e, "rejected l2update");
                }
            }
        });

        [snapshots, updates]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::messages::L2Update;

    fn levels(raw: &[(&str, &str)]) -> Vec<Vec<String>> {
        raw.iter().map(|(p, s)| vec![p.to_string(), s.to_string()]).collect()
    }

    fn snapshot(product: &str, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> FeedMessage {
        FeedMessage::Snapshot(Snapshot {
            product_id: product.to_string(),
            bids: levels(bids),
            asks: levels(asks),
        })
    }

    fn update(product: &str, changes: &[(&str, &str, &str)]) -> FeedMessage {
        FeedMessage::L2update(L2Update {
            product_id: product.to_string(),
            changes: changes
                .iter()
                .map(|(side, p, s)| vec![side.to_string(), p.to_string(), s.to_string()])
                .collect(),
            time: None,
        })
    }

    fn lvl(price: i64, size: i64) -> PriceLevel {
        PriceLevel::new(Decimal::from(price), Decimal::from(size))
    }

    /// Book whose drain loop never fires during a test
    fn manual_book() -> OrderBook {
        OrderBook::with_drain_interval(Symbol::new("BTC-USD"), Duration::from_secs(3600))
    }

    fn assert_sorted(book: &OrderBook) {
        let bids = book.bids();
        let asks = book.asks();
        assert!(bids.windows(2).all(|w| w[0].price > w[1].price), "bids not descending: {bids:?}");
        assert!(asks.windows(2).all(|w| w[0].price < w[1].price), "asks not ascending: {asks:?}");
        assert!(bids.iter().chain(&asks).all(|l| !l.size.is_zero()));
    }

    #[tokio::test]
    async fn test_init_sorts_numerically() {
        let book = manual_book();
        let snap = snapshot(
            "BTC-USD",
            &[("9.5", "1"), ("10.25", "2"), ("100", "3")],
            &[("101", "1"), ("99.5", "0"), ("1000", "2"), ("200", "4")],
        );

        assert!(book.init(&snap).unwrap());
        assert!(book.is_initialized());
        assert!(book.is_draining());
        assert_eq!(book.bids().iter().map(|l| l.price.to_string()).collect::<Vec<_>>(), ["100", "10.25", "9.5"]);
        assert_eq!(book.asks(), vec![lvl(101, 1), lvl(200, 4), lvl(1000, 2)]);
        assert_sorted(&book);
    }

    #[tokio::test]
    async fn test_init_ignores_other_product() {
        let book = manual_book();
        assert!(!book.init(&snapshot("ETH-USD", &[("1", "1")], &[])).unwrap());
        assert!(!book.is_initialized());
        assert!(!book.is_draining());
    }

    #[tokio::test]
    async fn test_wrong_message_type_fails_fast() {
        let book = manual_book();
        let err = book.init(&update("BTC-USD", &[("buy", "1", "1")])).unwrap_err();
        assert!(err.is_validation());

        let err = book.queue_updates(&snapshot("BTC-USD", &[], &[])).unwrap_err();
        assert!(err.is_validation());

        let err = book.init(&snapshot("BTC-USD", &[("abc", "1")], &[])).unwrap_err();
        assert!(err.is_validation());
        assert!(!book.is_initialized());
    }

    #[tokio::test]
    async fn test_malformed_change_queues_nothing() {
        let book = manual_book();
        let msg = update("BTC-USD", &[("buy", "100", "1"), ("hold", "101", "1")]);
        assert!(book.queue_updates(&msg).unwrap_err().is_validation());
        assert_eq!(book.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_remove_best_ask() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[], &[("100", "1"), ("101", "2")])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("sell", "100", "0")])).unwrap();
        assert!(book.apply_queue());

        assert_eq!(book.asks(), vec![lvl(101, 2)]);
        assert_eq!(book.best_price(Side::Sell), Some(lvl(101, 2)));
    }

    #[tokio::test]
    async fn test_insert_lower_bid() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("buy", "99", "5")])).unwrap();
        assert!(book.apply_queue());

        assert_eq!(book.bids(), vec![lvl(100, 1), lvl(99, 5)]);
        assert_eq!(book.best_price(Side::Buy), Some(lvl(100, 1)));
    }

    #[tokio::test]
    async fn test_replace_size_keeps_order() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1"), ("99", "2"), ("98", "3")], &[])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("buy", "99", "7")])).unwrap();
        book.apply_queue();

        assert_eq!(book.bids(), vec![lvl(100, 1), lvl(99, 7), lvl(98, 3)]);
    }

    #[tokio::test]
    async fn test_zero_for_absent_price_is_noop() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[("101", "1")])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("buy", "50", "0"), ("sell", "150", "0")])).unwrap();
        book.apply_queue();

        assert_eq!(book.bids(), vec![lvl(100, 1)]);
        assert_eq!(book.asks(), vec![lvl(101, 1)]);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();

        assert!(!book.apply_queue());
        assert_eq!(book.bids(), vec![lvl(100, 1)]);
    }

    #[tokio::test]
    async fn test_uninitialized_keeps_queue() {
        let book = manual_book();
        book.queue_updates(&update("BTC-USD", &[("buy", "100", "1")])).unwrap();

        assert!(!book.apply_queue());
        assert_eq!(book.pending_len(), 1);
        assert!(book.best_price(Side::Buy).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_supersedes_earlier_deltas() {
        let book = manual_book();
        book.queue_updates(&update("BTC-USD", &[("buy", "90", "1")])).unwrap();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();

        assert_eq!(book.pending_len(), 0);
        assert!(!book.apply_queue());
        assert_eq!(book.bids(), vec![lvl(100, 1)]);
    }

    #[tokio::test]
    async fn test_later_deltas_wait_for_next_drain() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("buy", "101", "1")])).unwrap();
        assert!(book.apply_queue());
        book.queue_updates(&update("BTC-USD", &[("buy", "102", "1"), ("buy", "101", "0")])).unwrap();

        assert_eq!(book.pending_len(), 2);
        assert_eq!(book.best_price(Side::Buy), Some(lvl(101, 1)));
        assert!(book.apply_queue());
        assert_eq!(book.bids(), vec![lvl(102, 1), lvl(100, 1)]);
    }

    #[tokio::test]
    async fn test_deltas_apply_in_arrival_order() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[], &[("100", "1")])).unwrap();

        book.queue_updates(&update("BTC-USD", &[("sell", "100", "0"), ("sell", "100", "4")])).unwrap();
        book.queue_updates(&update("BTC-USD", &[("sell", "100", "6")])).unwrap();
        book.apply_queue();

        assert_eq!(book.asks(), vec![lvl(100, 6)]);
    }

    #[tokio::test]
    async fn test_wrong_product_update_ignored() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();

        assert!(!book.queue_updates(&update("ETH-USD", &[("buy", "101", "1")])).unwrap());
        assert_eq!(book.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_ordering_holds_under_churn() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[("101", "1")])).unwrap();

        let changes: Vec<(String, String, String)> = (0..60)
            .map(|i| {
                let side = if i % 2 == 0 { "buy" } else { "sell" };
                let base = if side == "buy" { 90 } else { 102 };
                let price = base + (i * 7) % 10;
                let size = if i % 5 == 0 { 0 } else { i % 4 + 1 };
                (side.to_string(), price.to_string(), size.to_string())
            })
            .collect();
        for (side, price, size) in &changes {
            book.queue_updates(&update("BTC-USD", &[(side.as_str(), price.as_str(), size.as_str())])).unwrap();
            if price.ends_with('3') {
                book.apply_queue();
            }
            assert_sorted(&book);
        }
        book.apply_queue();
        assert_sorted(&book);
        assert_eq!(book.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_drain_loop_applies_queue() {
        let book = OrderBook::with_drain_interval(Symbol::new("BTC-USD"), Duration::from_millis(5));
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();
        book.queue_updates(&update("BTC-USD", &[("buy", "101", "2")])).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(book.best_price(Side::Buy), Some(lvl(101, 2)));
        assert_eq!(book.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_one_drain_pass_at_a_time() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();
        book.queue_updates(&update("BTC-USD", &[("buy", "101", "2")])).unwrap();

        let pass = book.state.draining.lock();
        assert!(!book.apply_queue());
        assert_eq!(book.pending_len(), 1);
        assert_eq!(book.best_price(Side::Buy), Some(lvl(100, 1)));

        drop(pass);
        assert!(book.apply_queue());
        assert_eq!(book.pending_len(), 0);
        assert_eq!(book.best_price(Side::Buy), Some(lvl(101, 2)));
    }

    #[tokio::test]
    async fn test_reset_waits_for_running_drain() {
        let book = Arc::new(manual_book());
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();
        book.queue_updates(&update("BTC-USD", &[("buy", "101", "2")])).unwrap();

        let pass = book.state.draining.lock();
        let resetting = {
            let book = Arc::clone(&book);
            std::thread::spawn(move || book.reset())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(book.is_initialized());
        assert_eq!(book.pending_len(), 1);

        drop(pass);
        resetting.join().unwrap();
        assert!(!book.is_initialized());
        assert_eq!(book.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_level_lookup() {
        let book = manual_book();
        assert!(book.level(Side::Buy, Decimal::from(100)).is_none());

        book.init(&snapshot("BTC-USD", &[("100", "1"), ("99", "5")], &[("101", "2")])).unwrap();
        assert_eq!(book.level(Side::Buy, Decimal::from(99)), Some(lvl(99, 5)));
        assert_eq!(book.level(Side::Sell, Decimal::from(101)), Some(lvl(101, 2)));
        assert!(book.level(Side::Sell, Decimal::from(100)).is_none());

        book.queue_updates(&update("BTC-USD", &[("buy", "99", "0")])).unwrap();
        book.apply_queue();
        assert!(book.level(Side::Buy, Decimal::from(99)).is_none());
    }

    #[tokio::test]
    async fn test_reset_and_reinit() {
        let book = manual_book();
        book.init(&snapshot("BTC-USD", &[("100", "1")], &[])).unwrap();
        book.queue_updates(&update("BTC-USD", &[("buy", "101", "2")])).unwrap();

        book.reset();
        assert!(!book.is_initialized());
        assert!(!book.is_draining());
        assert_eq!(book.pending_len(), 0);
        assert!(book.spread().is_none());

        book.init(&snapshot("BTC-USD", &[("200", "1")], &[("201", "1")])).unwrap();
        assert_eq!(book.spread(), Some(Decimal::ONE));
        assert!(book.is_draining());
    }

    #[tokio::test]
    async fn test_attach_routes_feed() {
        let hub = FeedHub::new();
        let book = Arc::new(manual_book());
        book.attach(&hub);

        hub.publish_json(r#"{"type":"snapshot","product_id":"BTC-USD","bids":[["100","1"]],"asks":[["101","1"]]}"#)
            .unwrap();
        hub.publish_json(r#"{"type":"l2update","product_id":"BTC-USD","changes":[["sell","100.5","3"]]}"#)
            .unwrap();
        hub.publish_json(r#"{"type":"l2update","product_id":"BTC-USD","changes":[["sell","bad","3"]]}"#)
            .unwrap();

        assert_eq!(book.pending_len(), 1);
        book.apply_queue();
        assert_eq!(book.best_price(Side::Sell).map(|l| l.price), Some(Decimal::new(1005, 1)));
    }
}
