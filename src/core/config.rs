//! Configuration - Type-safe, validated config
//!
//! Loads from `config.toml`. Every section has defaults so a partial file is
//! enough.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, OrderTicket, Result, Symbol};
use crate::engine::ExecutionMode;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub broker: BrokerConfig,
    pub orderbook: OrderbookConfig,
    pub feed: FeedConfig,

    /// Products to keep a book for
    pub products: Vec<String>,

    /// Orders queued at startup
    pub orders: Vec<OrderTicket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log filter used when RUST_LOG is unset
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info,limit_broker=debug".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Milliseconds between place/cancel ticks
    pub tick_ms: u64,
    pub mode: ExecutionMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            mode: ExecutionMode::Sequential,
        }
    }
}

impl BrokerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderbookConfig {
    /// Milliseconds between delta queue drains
    pub drain_ms: u64,
}

impl Default for OrderbookConfig {
    fn default() -> Self {
        Self { drain_ms: 10 }
    }
}

impl OrderbookConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Heartbeat age after which the feed counts as stale
    pub heartbeat_timeout_ms: u64,
    /// How often the watchdog looks at feed health
    pub check_interval_ms: u64,
    /// Consecutive failed reloads before the watchdog gives up
    pub max_reload_failures: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            check_interval_ms: 5_000,
            max_reload_failures: 5,
        }
    }
}

impl FeedConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `config.toml` next to the process or the crate, else defaults.
    pub fn load_default() -> Self {
        let candidates = [
            "config.toml",
            concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml"),
        ];

        for path in &candidates {
            match Self::load(Path::new(path)) {
                Ok(cfg) => {
                    tracing::info!(path, "loaded config");
                    return cfg;
                }
                Err(Error::Config(msg)) if msg.starts_with("Failed to read") => continue,
                Err(e) => {
                    tracing::warn!(path, error = %e, "ignoring unusable config");
                }
            }
        }

        tracing::warn!("no config.toml found, using defaults");
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.broker.tick_ms == 0 {
            return Err(Error::Config("broker.tick_ms must be positive".to_string()));
        }
        if self.feed.max_reload_failures == 0 {
            return Err(Error::Config("feed.max_reload_failures must be positive".to_string()));
        }
        for product in &self.products {
            Symbol::parse(product).map_err(|e| Error::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.products.iter().map(|p| Symbol::new(p.as_str())).collect()
    }
}
