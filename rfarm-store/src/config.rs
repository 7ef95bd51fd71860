//! Farm configuration.
//!
//! A farm is described as a list of `(code, address, db)` entries plus shared
//! pool settings, usually loaded from JSON:
//!
//! ```json
//! {
//!   "stores": [
//!     { "code": "intraday", "address": "127.0.0.1:6379", "db": 3 },
//!     { "code": "history",  "address": "127.0.0.1:6379", "db": 4 }
//!   ],
//!   "pool": { "max_idle": 10, "max_total": 10, "connect_timeout_ms": 500 }
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::error::StoreResult;
use crate::redis::{RedisStore, StoreOptions};
use crate::registry::Registry;
use crate::store::DEFAULT_CHANNEL_PREFIX;

/// Connection pool sizing and timeouts shared by every store of a farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_idle: usize,
    pub max_total: usize,
    pub connect_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_idle: 10,
            max_total: 10,
            connect_timeout_ms: None,
            response_timeout_ms: None,
        }
    }
}

/// One store of the farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub code: String,
    pub address: String,
    pub db: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmConfig {
    pub stores: Vec<StoreEntry>,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_channel_prefix() -> String {
    DEFAULT_CHANNEL_PREFIX.to_string()
}

impl FarmConfig {
    pub fn from_json_str(raw: &str) -> StoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Builds a registry of unconnected stores, one per entry, in file order.
    ///
    /// Connecting and closing the stores stays with the caller.
    pub fn build_registry(&self, parent: &Span) -> Registry {
        let mut registry = Registry::new();
        for entry in &self.stores {
            let options = StoreOptions {
                address: entry.address.clone(),
                db: entry.db,
                channel_prefix: self.channel_prefix.clone(),
                pool: self.pool.clone(),
            };
            registry.add(
                entry.code.clone(),
                Arc::new(RedisStore::with_options(options, parent)),
            );
        }
        registry
    }
}
