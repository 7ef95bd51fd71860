//! # RedisFarm Store
//!
//! Typed facade over one Redis database per store, and a registry resolving
//! stores by a logical code or by their database index.
//!
//! ## Key Types
//!
//! - [`Store`] - The async capability set every store offers
//! - [`RedisStore`] - Store backed by a pooled Redis client
//! - [`Registry`] - Directory of stores keyed by code and db index
//! - [`ChannelMessage`] - Pub/sub notification tagged with subscription and db
//! - [`FarmConfig`] - JSON-loadable farm description
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rfarm_store::{RedisStore, Registry, Store};
//!
//! async fn example() -> rfarm_store::StoreResult<()> {
//!     let store = Arc::new(RedisStore::new("127.0.0.1:6379", 3, &tracing::Span::current()));
//!     store.connect().await?;
//!
//!     let mut registry = Registry::new();
//!     registry.add("intraday", store.clone());
//!
//!     let same = registry.by_db(3).expect("registered");
//!     same.publish("intraday:code1").await?; // sent on CMND:3
//!     store.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod redis;
pub mod registry;
pub mod store;

pub use config::{FarmConfig, PoolSettings, StoreEntry};
pub use error::{StoreError, StoreResult};
pub use redis::{RedisStore, StoreOptions};
pub use registry::Registry;
pub use rfarm_client::PubSubMessage;
pub use store::{normalize_list_key, ChannelMessage, SharedStore, Store, DEFAULT_CHANNEL_PREFIX};
