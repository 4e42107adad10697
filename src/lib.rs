//! Limit Broker - Core Library
//! Maker-only limit orders kept at the best price of a live order book

// Public modules
pub mod core;
pub mod engine;
pub mod events;
pub mod exchanges;
pub mod execution;
pub mod feeds;
pub mod orderbook;

// Re-exports
pub use crate::core::{Config, Error, Result};
pub use engine::{Engine, ExecutionMode, Process};
pub use execution::{Broker, BrokerEvent, BrokerEventKind, TickReport};
pub use feeds::{FeedHealth, FeedHub, FeedMessage, Watchdog};
pub use orderbook::OrderBook;
