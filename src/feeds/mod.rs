//! Market data feeds - message decoding, fan-out and health

pub mod health;
pub mod hub;
pub mod messages;

pub use health::{FeedHealth, Watchdog};
pub use hub::FeedHub;
pub use messages::{FeedEventKind, FeedMessage};
