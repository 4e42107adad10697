//! Broker - owns the order queue and reconciles it against book and exchange
//!
//! Each tick runs two passes over the queue:
//! - `place_orders`: orders waiting for placement join the best price on
//!   their own side (bid for buys, ask for sells) and are submitted.
//! - `cancel_orders`: resting orders whose limit no longer matches that
//!   price are cancelled, which makes them eligible for placement again.
//!
//! Fills come from `match` messages on the feed. Orders stay in the queue
//! until the caller removes them.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::core::config::BrokerConfig;
use crate::core::{Error, Exchange, Order, OrderRecord, OrderRequest, OrderStatus, Result, SharedOrder, Symbol};
use crate::engine::{Engine, Process};
use crate::events::{Listeners, SubscriptionId};
use crate::execution::report::TickReport;
use crate::feeds::messages::{parse_decimal, FeedMessage};
use crate::feeds::FeedHub;
use crate::orderbook::OrderBook;

/// Broker notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerEventKind {
    Placed,
    Cancelled,
    PartiallyFilled,
    Filled,
    PlaceFailed,
    CancelFailed,
}

#[derive(Debug, Clone)]
pub struct BrokerEvent {
    pub kind: BrokerEventKind,
    /// Order state right after the change
    pub order: Order,
    pub error: Option<String>,
}

/// Result of applying one trade to a queued order
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order: SharedOrder,
    pub traded: Decimal,
    pub remaining: Decimal,
    pub status: OrderStatus,
}

type Attempt = std::result::Result<SharedOrder, (SharedOrder, Error)>;

/// What a pass decided for one order before any network call
enum Claim<T> {
    Ready(T),
    NoPrice,
    NotEligible,
}

struct BrokerCore {
    exchange: Arc<dyn Exchange>,
    books: RwLock<HashMap<Symbol, Arc<OrderBook>>>,
    queue: RwLock<Vec<SharedOrder>>,
    listeners: Listeners<BrokerEventKind, BrokerEvent>,
}

impl BrokerCore {
    fn limit_price(&self, order: &Order) -> Option<Decimal> {
        let book = self.books.read().get(order.product()).cloned()?;
        let level = book.best_price(order.side())?;
        (level.price > Decimal::ZERO).then_some(level.price)
    }

    fn emit(&self, kind: BrokerEventKind, order: Order, error: Option<String>) {
        self.listeners.emit(kind, &BrokerEvent { kind, order, error });
    }

    async fn place_orders(&self) -> TickReport {
        let mut report = TickReport::new("place_orders");
        let queue = self.queue.read().clone();

        let mut attempts = Vec::new();
        for order in queue {
            match self.claim_placement(&order) {
                Claim::Ready((request, previous)) => attempts.push(self.place_one(order, request, previous)),
                Claim::NoPrice => report.skipped += 1,
                Claim::NotEligible => {}
            }
        }

        for outcome in join_all(attempts).await {
            report.record(outcome);
        }
        if report.attempted() > 0 || report.skipped > 0 {
            debug!(
                placed = report.succeeded.len(),
                failed = report.failed.len(),
                skipped = report.skipped,
                "place_orders tick"
            );
        }
        report
    }

    /// Fix the limit and mark the order `placing` so no other pass touches
    /// it while the request is in flight.
    fn claim_placement(&self, order: &SharedOrder) -> Claim<(OrderRequest, OrderStatus)> {
        let mut order = order.write();
        let previous = order.status();
        if !previous.awaiting_placement() {
            return Claim::NotEligible;
        }
        let Some(price) = self.limit_price(&order) else {
            debug!(product = %order.product(), side = %order.side(), "no price yet, order waits");
            return Claim::NoPrice;
        };
        if order.set_limit(price).is_err() {
            return Claim::NoPrice;
        }
        order.set_status(OrderStatus::Placing);
        Claim::Ready((OrderRequest::maker(&order, price), previous))
    }

    async fn place_one(&self, order: SharedOrder, request: OrderRequest, previous: OrderStatus) -> Attempt {
        let price = request.price;
        match self.exchange.place_order(request).await {
            Ok(record) => {
                let (placed, moved) = {
                    let mut o = order.write();
                    if let Err(e) = o.set_id(&record.id) {
                        o.set_status(previous);
                        drop(o);
                        return Err((order, e));
                    }
                    let moved = o.status() == OrderStatus::Placing;
                    if moved {
                        o.set_status(OrderStatus::Placed);
                    }
                    (o.clone(), moved)
                };
                if !moved {
                    // a fill on the previous id finished it while we waited
                    debug!(order_id = %record.id, status = %placed.status(), "placement landed on a finished order");
                    return Ok(order);
                }
                info!(
                    order_id = %record.id,
                    product = %placed.product(),
                    side = %placed.side(),
                    size = %placed.remaining(),
                    %price,
                    "order placed"
                );
                self.emit(BrokerEventKind::Placed, placed, None);
                Ok(order)
            }
            Err(e) => {
                let snapshot = {
                    let mut o = order.write();
                    if o.status() == OrderStatus::Placing {
                        o.set_status(previous);
                    }
                    o.clone()
                };
                warn!(product = %snapshot.product(), %price, error = %e, "order placement failed");
                self.emit(BrokerEventKind::PlaceFailed, snapshot, Some(e.to_string()));
                Err((order, e))
            }
        }
    }

    async fn cancel_orders(&self) -> TickReport {
        let mut report = TickReport::new("cancel_orders");
        let queue = self.queue.read().clone();

        let mut attempts = Vec::new();
        for order in queue {
            match self.claim_cancel(&order) {
                Claim::Ready((id, previous)) => attempts.push(self.cancel_one(order, id, previous)),
                Claim::NoPrice => report.skipped += 1,
                Claim::NotEligible => {}
            }
        }

        for outcome in join_all(attempts).await {
            report.record(outcome);
        }
        if report.attempted() > 0 {
            debug!(
                cancelled = report.succeeded.len(),
                failed = report.failed.len(),
                "cancel_orders tick"
            );
        }
        report
    }

    /// A resting order whose limit left the best price is marked
    /// `cancelling`.
    fn claim_cancel(&self, order: &SharedOrder) -> Claim<(String, OrderStatus)> {
        let mut order = order.write();
        let previous = order.status();
        if !previous.is_resting() {
            return Claim::NotEligible;
        }
        let Some(id) = order.id().map(str::to_string) else {
            return Claim::NotEligible;
        };
        let Some(best) = self.limit_price(&order) else {
            return Claim::NoPrice;
        };
        if order.limit() == Some(best) {
            return Claim::NotEligible;
        }
        debug!(order_id = %id, limit = ?order.limit(), %best, "market moved away from order");
        order.set_status(OrderStatus::Cancelling);
        Claim::Ready((id, previous))
    }

    async fn cancel_one(&self, order: SharedOrder, id: String, previous: OrderStatus) -> Attempt {
        match self.exchange.cancel_order(&id).await {
            Ok(_) => {
                let snapshot = {
                    let mut o = order.write();
                    // a fill may have finished it while we waited
                    if o.status() == OrderStatus::Cancelling {
                        o.set_status(OrderStatus::Cancelled);
                    }
                    o.clone()
                };
                info!(order_id = %id, status = %snapshot.status(), "order cancelled");
                self.emit(BrokerEventKind::Cancelled, snapshot, None);
                Ok(order)
            }
            Err(e) => {
                let snapshot = {
                    let mut o = order.write();
                    if o.status() == OrderStatus::Cancelling {
                        o.set_status(previous);
                    }
                    o.clone()
                };
                warn!(order_id = %id, error = %e, "order cancel failed");
                self.emit(BrokerEventKind::CancelFailed, snapshot, Some(e.to_string()));
                Err((order, e))
            }
        }
    }

    fn check_filled(&self, msg: &FeedMessage) -> Option<FillEvent> {
        let FeedMessage::Match(trade) = msg else {
            return None;
        };
        let traded = match parse_decimal("match size", &trade.size) {
            Ok(size) if size > Decimal::ZERO => size,
            Ok(size) => {
                warn!(%size, "ignoring non-positive match size");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "ignoring malformed match");
                return None;
            }
        };

        let order = self
            .queue
            .read()
            .iter()
            .find(|o| o.read().id().is_some_and(|id| trade.involves(id)))
            .cloned()?;

        let (kind, snapshot) = {
            let mut o = order.write();
            if o.status() == OrderStatus::Filled {
                return None;
            }
            let kind = if traded >= o.remaining() {
                o.set_remaining(Decimal::ZERO).ok()?;
                o.set_status(OrderStatus::Filled);
                BrokerEventKind::Filled
            } else {
                let left = o.remaining() - traded;
                o.set_remaining(left).ok()?;
                // a cancel in flight keeps its status; the exchange decides
                if o.status().is_resting() {
                    o.set_status(OrderStatus::Partial);
                }
                BrokerEventKind::PartiallyFilled
            };
            (kind, o.clone())
        };

        info!(
            order_id = snapshot.id().unwrap_or_default(),
            %traded,
            remaining = %snapshot.remaining(),
            status = %snapshot.status(),
            "fill recorded"
        );
        let event = FillEvent {
            order: Arc::clone(&order),
            traded,
            remaining: snapshot.remaining(),
            status: snapshot.status(),
        };
        self.emit(kind, snapshot, None);
        Some(event)
    }
}

/// Order queue plus the engine reconciling it
pub struct Broker {
    core: Arc<BrokerCore>,
    engine: Engine,
    feed_subscription: Mutex<Option<SubscriptionId>>,
}

impl Broker {
    pub fn new(exchange: Arc<dyn Exchange>, config: &BrokerConfig) -> Self {
        Self {
            core: Arc::new(BrokerCore {
                exchange,
                books: RwLock::new(HashMap::new()),
                queue: RwLock::new(Vec::new()),
                listeners: Listeners::new(),
            }),
            engine: Engine::new(config.tick_interval(), config.mode),
            feed_subscription: Mutex::new(None),
        }
    }

    /// Price source for one product. Replaces any book already registered.
    pub fn add_book(&self, book: Arc<OrderBook>) -> Option<Arc<OrderBook>> {
        self.core.books.write().insert(book.product().clone(), book)
    }

    pub fn book(&self, product: &Symbol) -> Option<Arc<OrderBook>> {
        self.core.books.read().get(product).cloned()
    }

    /// Append a valid order to the queue and return the new queue length.
    /// Unless `silent`, the broker is enabled if it was not already.
    pub fn queue_order(&self, order: SharedOrder, silent: bool) -> Result<usize> {
        {
            let o = order.read();
            if !o.is_valid() {
                return Err(Error::validation(format!(
                    "cannot queue invalid order for '{}'",
                    o.product()
                )));
            }
        }

        let len = {
            let mut queue = self.core.queue.write();
            queue.push(order);
            queue.len()
        };
        debug!(queued = len, silent, "order queued");

        if !silent && !self.is_enabled() {
            self.enable();
        }
        Ok(len)
    }

    /// Start ticking. Returns whether the engine is running.
    pub fn enable(&self) -> bool {
        let place = Process::bind(
            "place_orders",
            |core: Arc<BrokerCore>, ()| async move { core.place_orders().await.into_result().map(|_| ()) },
            Arc::clone(&self.core),
            (),
        );
        let cancel = Process::bind(
            "cancel_orders",
            |core: Arc<BrokerCore>, ()| async move { core.cancel_orders().await.into_result().map(|_| ()) },
            Arc::clone(&self.core),
            (),
        );
        let started = self.engine.start(vec![place, cancel]);
        if started {
            info!(tick = ?self.engine.timing(), orders = self.len(), "broker enabled");
        }
        started
    }

    /// Stop ticking. Queued orders stay and are picked up on the next enable.
    pub fn disable(&self) -> bool {
        let state = self.engine.stop();
        info!(orders = self.len(), "broker disabled");
        state
    }

    pub fn is_enabled(&self) -> bool {
        self.engine.is_started()
    }

    /// Price a new order would join: best bid for buys, best ask for sells.
    pub fn limit_price(&self, order: &Order) -> Option<Decimal> {
        self.core.limit_price(order)
    }

    /// Place every `created` / `cancelled` order at the current best price.
    pub async fn place_orders(&self) -> TickReport {
        self.core.place_orders().await
    }

    /// Cancel every resting order the best price has moved away from.
    pub async fn cancel_orders(&self) -> TickReport {
        self.core.cancel_orders().await
    }

    /// Apply a `match` message to the queued order it names, if any.
    pub fn check_filled(&self, msg: &FeedMessage) -> Option<FillEvent> {
        self.core.check_filled(msg)
    }

    /// Route every non-ticker feed message to `check_filled`. Subscribes
    /// only once; later calls return false.
    pub fn dispatch_filled_order_handler(&self, hub: &FeedHub) -> bool {
        let mut subscription = self.feed_subscription.lock();
        if subscription.is_some() {
            return false;
        }

        let core: Weak<BrokerCore> = Arc::downgrade(&self.core);
        *subscription = Some(hub.subscribe_all(move |msg| {
            if msg.is_ticker() {
                return;
            }
            if let Some(core) = core.upgrade() {
                core.check_filled(msg);
            }
        }));
        true
    }

    pub fn subscribe<F>(&self, kind: BrokerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BrokerEvent) + Send + Sync + 'static,
    {
        self.core.listeners.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.core.listeners.unsubscribe(id)
    }

    /// Queue contents, oldest first
    pub fn orders(&self) -> Vec<SharedOrder> {
        self.core.queue.read().clone()
    }

    pub fn len(&self) -> usize {
        self.core.queue.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.queue.read().is_empty()
    }

    /// Take an order out of the queue. Does not touch the exchange.
    pub fn remove_order(&self, order: &SharedOrder) -> bool {
        let mut queue = self.core.queue.write();
        let before = queue.len();
        queue.retain(|o| !Arc::ptr_eq(o, order));
        queue.len() != before
    }

    /// Exchange view of a placed order.
    pub async fn fetch_order(&self, order: &SharedOrder) -> Result<OrderRecord> {
        let id = order.read().id().map(str::to_string);
        let id = id.ok_or_else(|| Error::InvalidState("order has no exchange id yet".to_string()))?;
        self.core.exchange.get_order(&id).await
    }
}
