//! Execution layer - Order queue reconciliation

pub mod broker;
pub mod report;

pub use broker::{Broker, BrokerEvent, BrokerEventKind, FillEvent};
pub use report::TickReport;
