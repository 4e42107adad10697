//! Exchange implementations - Pluggable `Exchange` backends

pub mod paper;

pub use paper::PaperExchange;
