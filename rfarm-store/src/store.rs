//! Store trait: the capability set every database-segment facade offers.
//!
//! Callers program against [`Store`] so the registry can hold any backend
//! behind an `Arc<dyn Store>`. [`RedisStore`](crate::RedisStore) is the
//! production implementation.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rfarm_client::PubSubMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StoreResult;

/// Prefix of the default publish channel, completed with `:<db>`.
pub const DEFAULT_CHANNEL_PREFIX: &str = "CMND";

/// Shared handle to a store, as kept by the registry.
pub type SharedStore = Arc<dyn Store>;

/// A pub/sub notification tagged with its subscription and source database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Tag passed to [`Store::subscribe`].
    pub tag: String,
    /// Database index of the store that received the message.
    pub db: u32,
    pub message: PubSubMessage,
}

/// Async interface to one logical database of a key-value backend.
///
/// # Design Notes
///
/// - **Absence is not failure**: missing keys come back as `None`, an empty
///   string, or an empty collection. `Err` always means the round trip failed.
/// - **Explicit lifecycle**: nothing is dialed before `connect`; `close` is
///   idempotent and safe after a partial `connect`.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Opens the command pool and the pub/sub connection.
    async fn connect(&self) -> StoreResult<()>;

    /// Releases both connections. Later operations fail with `Closed`.
    fn close(&self);

    /// Database index this store was created with.
    fn db(&self) -> u32;

    /// Connection target, `host:port`.
    fn address(&self) -> &str;

    // ─────────────────────────────────────────────────────────────────────────
    // Keys
    // ─────────────────────────────────────────────────────────────────────────

    /// Cursor-based enumeration of keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Single-command enumeration of keys matching a glob pattern.
    ///
    /// Blocks the backend for the duration of the command; prefer `scan` on
    /// large keyspaces.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Strings and hashes
    // ─────────────────────────────────────────────────────────────────────────

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Values aligned with `keys`; `None` where a key is absent.
    async fn mget(&self, keys: &[&str]) -> StoreResult<Vec<Option<String>>>;

    /// All fields of a hash; empty when the key is absent.
    async fn get_object(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// One hash field; empty string when the key or field is absent.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<String>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lists
    // ─────────────────────────────────────────────────────────────────────────

    async fn lpush(&self, key: &str, element: &str) -> StoreResult<()>;

    async fn rpush(&self, key: &str, element: &str) -> StoreResult<()>;

    /// Removes up to `count` occurrences of `element`: head to tail when
    /// positive, tail to head when negative, all of them when zero.
    async fn lrem(&self, key: &str, element: &str, count: i64) -> StoreResult<()>;

    /// Elements `from..=to`; negative indexes count from the tail.
    async fn list_range(&self, key: &str, from: i64, to: i64) -> StoreResult<Vec<String>>;

    async fn llen(&self, key: &str) -> StoreResult<usize>;

    /// `llen` on the key rewritten by [`normalize_list_key`].
    async fn list_len(&self, key: &str) -> StoreResult<usize>;

    // ─────────────────────────────────────────────────────────────────────────
    // Pub/Sub
    // ─────────────────────────────────────────────────────────────────────────

    /// Publishes `code` on the store's default channel, `<prefix>:<db>`.
    /// Returns whether at least one subscriber received it.
    async fn publish(&self, code: &str) -> StoreResult<bool>;

    /// Publishes `message` on an explicit channel.
    async fn publish_ex(&self, channel: &str, message: &str) -> StoreResult<bool>;

    /// Subscribes to `channels` and forwards every inbound message to `dst`
    /// as a [`ChannelMessage`] carrying `tag` and this store's db index.
    ///
    /// Delivery runs on its own task until the store is closed or `dst` is
    /// dropped. A backend disconnect only pauses it: the pub/sub connection is
    /// redialed and the channels subscribed again. Aborting the returned
    /// handle stops delivery early. A slow `dst` holds back the pub/sub
    /// reader rather than queueing without bound.
    async fn subscribe(
        &self,
        tag: &str,
        dst: mpsc::Sender<ChannelMessage>,
        channels: &[&str],
    ) -> StoreResult<JoinHandle<()>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Escape hatch
    // ─────────────────────────────────────────────────────────────────────────

    /// Runs an arbitrary command, discarding its reply.
    async fn exec(&self, command: &str, args: &[&str]) -> StoreResult<()>;
}

/// Maps a key to the list key it addresses: `M:x` becomes `L:x`, `L:x` is
/// kept, and any other key gains an `L:` prefix.
pub fn normalize_list_key(key: &str) -> Cow<'_, str> {
    if let Some(rest) = key.strip_prefix("M:") {
        Cow::Owned(format!("L:{}", rest))
    } else if key.starts_with("L:") {
        Cow::Borrowed(key)
    } else {
        Cow::Owned(format!("L:{}", key))
    }
}
