use anyhow::Context;
use rust_decimal::Decimal;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use limit_broker::core::{Exchange, Order, Side};
use limit_broker::exchanges::PaperExchange;
use limit_broker::{Broker, BrokerEventKind, Config, FeedHealth, FeedHub, FeedMessage, OrderBook};

/// Replays a newline-delimited JSON feed capture through the order books and
/// the broker, against the paper exchange.
///
/// Usage: `limit-broker <feed.jsonl> [pace_ms]`
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = match std::env::var("LIMIT_BROKER_CONFIG") {
        Ok(path) => Config::load(&PathBuf::from(&path)).with_context(|| format!("loading {path}"))?,
        Err(_) => Config::load_default(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.app.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let mut args = std::env::args().skip(1);
    let feed_path = args.next().context("usage: limit-broker <feed.jsonl> [pace_ms]")?;
    let pace = match args.next() {
        Some(ms) => Duration::from_millis(ms.parse().context("pace_ms must be an integer")?),
        None => Duration::ZERO,
    };

    tracing::info!(feed = %feed_path, products = config.products.len(), "limit-broker replay starting");

    let symbols = config.symbols();
    let exchange = Arc::new(PaperExchange::new(&symbols));
    for product in exchange.get_products().await? {
        tracing::debug!(
            product = %product.id,
            base = %product.base_currency,
            quote = %product.quote_currency,
            "product listed"
        );
    }

    let hub = FeedHub::new();
    let health = Arc::new(FeedHealth::new(config.feed.heartbeat_timeout()));
    health.attach(&hub);

    let broker = Broker::new(exchange.clone(), &config.broker);
    for symbol in &symbols {
        let book = Arc::new(OrderBook::with_drain_interval(symbol.clone(), config.orderbook.drain_interval()));
        book.attach(&hub);
        broker.add_book(book);
    }
    broker.dispatch_filled_order_handler(&hub);

    for kind in [BrokerEventKind::PlaceFailed, BrokerEventKind::CancelFailed] {
        broker.subscribe(kind, |event| {
            tracing::warn!(kind = ?event.kind, product = %event.order.product(), error = ?event.error, "broker action failed");
        });
    }

    for ticket in &config.orders {
        let order = Order::try_from(ticket).with_context(|| format!("order for {}", ticket.product))?;
        broker.queue_order(order.into_shared(), true)?;
    }
    if !broker.enable() {
        anyhow::bail!("broker engine did not start");
    }

    let (tx, rx) = flume::bounded::<String>(1024);
    let reader_path = feed_path.clone();
    let reader = tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
        let file = std::fs::File::open(&reader_path).with_context(|| format!("opening {reader_path}"))?;
        let mut lines = 0;
        for line in std::io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if tx.send(line).is_err() {
                break;
            }
            lines += 1;
        }
        Ok(lines)
    });

    let mut rejected = 0usize;
    while let Ok(line) = rx.recv_async().await {
        let msg = match FeedMessage::from_json(&line) {
            Ok(msg) => msg,
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "skipping undecodable feed line");
                continue;
            }
        };
        hub.publish(&msg);
        simulate_fills(&exchange, &hub, &msg);

        if pace.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pace).await;
        }
    }
    let lines = reader.await??;

    // let the last deltas drain and the broker react to them
    tokio::time::sleep(config.broker.tick_interval() * 2).await;
    broker.disable();

    tracing::info!(lines, rejected, received = hub.received(), stale = health.is_stale(), "replay finished");
    for order in broker.orders() {
        let order = order.read();
        tracing::info!(
            order_id = order.id().unwrap_or("-"),
            product = %order.product(),
            side = %order.side(),
            size = %order.size(),
            remaining = %order.remaining(),
            limit = ?order.limit(),
            status = %order.status(),
            "final order state"
        );
    }
    Ok(())
}

/// Trades in the capture fill paper orders they cross; the resulting
/// matches go back through the hub like real fills would.
fn simulate_fills(exchange: &PaperExchange, hub: &FeedHub, msg: &FeedMessage) {
    let FeedMessage::Match(trade) = msg else {
        return;
    };
    let (Ok(price), Ok(mut size)) = (trade.price.parse::<Decimal>(), trade.size.parse::<Decimal>()) else {
        return;
    };

    for order in exchange.open_orders() {
        if size <= Decimal::ZERO {
            break;
        }
        if order.product_id.as_str() != trade.product_id {
            continue;
        }
        let Some(limit) = order.price else { continue };
        let crossed = match order.side {
            Side::Buy => price <= limit,
            Side::Sell => price >= limit,
        };
        if !crossed {
            continue;
        }

        let take = size.min(order.size - order.filled_size);
        match exchange.fill(&order.id, take) {
            Ok(fill) => {
                size -= take;
                hub.publish(&fill);
            }
            Err(e) => tracing::debug!(order_id = %order.id, error = %e, "paper fill skipped"),
        }
    }
}
