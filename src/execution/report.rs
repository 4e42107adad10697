//! Per-tick outcome of a broker action

use crate::core::{Error, Result, SharedOrder};

/// What one `place_orders` / `cancel_orders` pass did. Every order is
/// handled on its own, so a tick can succeed for some orders and fail for
/// others.
#[derive(Debug, Default)]
pub struct TickReport {
    pub action: &'static str,
    pub succeeded: Vec<SharedOrder>,
    pub failed: Vec<(SharedOrder, Error)>,
    /// Eligible orders left for a later tick (no usable price yet)
    pub skipped: usize,
}

impl TickReport {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: std::result::Result<SharedOrder, (SharedOrder, Error)>) {
        match outcome {
            Ok(order) => self.succeeded.push(order),
            Err(failure) => self.failed.push(failure),
        }
    }

    /// Orders an exchange call was made for
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Successful orders, or one aggregate error naming how many failed.
    pub fn into_result(self) -> Result<Vec<SharedOrder>> {
        if self.failed.is_empty() {
            return Ok(self.succeeded);
        }
        Err(Error::Tick {
            action: self.action,
            failed: self.failed.len(),
            attempted: self.attempted(),
        })
    }
}
