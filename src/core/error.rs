//! Error handling - One hierarchy for the whole broker core

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broker error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input (feed message, order field, process). Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the exchange
    #[error("Network error: {0}")]
    Network(String),

    /// Exchange rejected the request
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Aggregated per-order failures of one broker tick
    #[error("Tick error: {action} failed for {failed} of {attempted} orders")]
    Tick {
        action: &'static str,
        failed: usize,
        attempted: usize,
    },

    /// Feed stayed stale after repeated reloads
    #[error("Stale feed: reload failed {failures} consecutive times")]
    StaleFeed { failures: u32 },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Shorthand used by the parsers and mutators.
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}
