//! Redis-backed [`Store`].
//!
//! Each `RedisStore` owns a command pool and a pub/sub connection, both bound
//! to one database index, plus a tracing span carrying the connection target
//! and db index for every event it emits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rfarm_client::{Client, ClientConfig, ClientError, PubSub};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Span};

use crate::config::PoolSettings;
use crate::error::{StoreError, StoreResult};
use crate::store::{normalize_list_key, ChannelMessage, Store, DEFAULT_CHANNEL_PREFIX};

/// Construction parameters for a [`RedisStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backend address, `host:port`.
    pub address: String,
    /// Database index selected on every connection.
    pub db: u32,
    /// Prefix of the default publish channel.
    pub channel_prefix: String,
    pub pool: PoolSettings,
}

impl StoreOptions {
    pub fn new(address: impl Into<String>, db: u32) -> Self {
        StoreOptions {
            address: address.into(),
            db,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            pool: PoolSettings::default(),
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            addr: self.address.clone(),
            db: self.db,
            max_idle: self.pool.max_idle,
            max_total: self.pool.max_total,
            connect_timeout: self.pool.connect_timeout_ms.map(Duration::from_millis),
            response_timeout: self.pool.response_timeout_ms.map(Duration::from_millis),
            ..ClientConfig::default()
        }
    }
}

#[derive(Default)]
struct Backend {
    client: Option<Arc<Client>>,
    pubsub: Option<Arc<PubSub>>,
    closed: bool,
}

/// Store facade over one Redis database.
pub struct RedisStore {
    options: StoreOptions,
    span: Span,
    backend: RwLock<Backend>,
}

impl RedisStore {
    /// Creates an unconnected store with default pool settings.
    ///
    /// `parent` is the logging context; the store's span is created beneath it.
    pub fn new(address: impl Into<String>, db: u32, parent: &Span) -> Self {
        Self::with_options(StoreOptions::new(address, db), parent)
    }

    pub fn with_options(options: StoreOptions, parent: &Span) -> Self {
        let span = tracing::info_span!(
            parent: parent,
            "store",
            layer = "store",
            connection = %options.address,
            db = options.db,
        );
        RedisStore {
            options,
            span,
            backend: RwLock::new(Backend::default()),
        }
    }

    /// Channel used by [`Store::publish`]: `<prefix>:<db>`.
    pub fn default_channel(&self) -> String {
        format!("{}:{}", self.options.channel_prefix, self.options.db)
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    fn client(&self) -> StoreResult<Arc<Client>> {
        let backend = self.backend.read().expect("backend lock poisoned");
        if backend.closed {
            return Err(StoreError::Closed);
        }
        backend.client.clone().ok_or(StoreError::NotConnected)
    }

    fn pubsub(&self) -> StoreResult<Arc<PubSub>> {
        let backend = self.backend.read().expect("backend lock poisoned");
        if backend.closed {
            return Err(StoreError::Closed);
        }
        backend.pubsub.clone().ok_or(StoreError::NotConnected)
    }

    fn connection_error(&self, source: ClientError) -> StoreError {
        StoreError::Connection {
            address: self.options.address.clone(),
            db: self.options.db,
            source,
        }
    }

    fn transport(&self, op: &str, target: &str, source: ClientError) -> StoreError {
        debug!(parent: &self.span, op, target, error = %source, "command failed");
        StoreError::Transport {
            op: op.to_string(),
            target: target.to_string(),
            source,
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn connect(&self) -> StoreResult<()> {
        let (need_client, need_pubsub) = {
            let backend = self.backend.read().expect("backend lock poisoned");
            if backend.closed {
                return Err(StoreError::Closed);
            }
            (backend.client.is_none(), backend.pubsub.is_none())
        };
        let config = self.options.client_config();

        // The pool is kept even if the pub/sub dial fails below; `close`
        // releases whatever was opened and a second `connect` retries the rest.
        if need_client {
            let client = Client::with_config(&config)
                .await
                .map_err(|source| self.connection_error(source))?;
            let mut backend = self.backend.write().expect("backend lock poisoned");
            if backend.closed || backend.client.is_some() {
                client.close();
            } else {
                backend.client = Some(Arc::new(client));
            }
        }

        if need_pubsub {
            let pubsub = PubSub::connect(&config)
                .await
                .map_err(|source| self.connection_error(source))?;
            let mut backend = self.backend.write().expect("backend lock poisoned");
            if backend.closed || backend.pubsub.is_some() {
                pubsub.close();
            } else {
                backend.pubsub = Some(Arc::new(pubsub));
            }
        }

        info!(parent: &self.span, "store connected");
        Ok(())
    }

    fn close(&self) {
        let (client, pubsub) = {
            let mut backend = self.backend.write().expect("backend lock poisoned");
            backend.closed = true;
            (backend.client.take(), backend.pubsub.take())
        };
        if client.is_none() && pubsub.is_none() {
            return;
        }
        if let Some(client) = client {
            client.close();
        }
        if let Some(pubsub) = pubsub {
            pubsub.close();
        }
        info!(parent: &self.span, "store closed");
    }

    fn db(&self) -> u32 {
        self.options.db
    }

    fn address(&self) -> &str {
        &self.options.address
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let client = self.client()?;
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            let (next, page) = client
                .scan(cursor, pattern.as_bytes())
                .await
                .map_err(|source| self.transport("SCAN", pattern, source))?;
            // SCAN may report a key more than once across iterations.
            for key in page.into_iter().map(text) {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let keys = self
            .client()?
            .keys(pattern.as_bytes())
            .await
            .map_err(|source| self.transport("KEYS", pattern, source))?;
        Ok(keys.into_iter().map(text).collect())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.client()?
            .exists(key.as_bytes())
            .await
            .map_err(|source| self.transport("EXISTS", key, source))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let value = self
            .client()?
            .get(key.as_bytes())
            .await
            .map_err(|source| self.transport("GET", key, source))?;
        Ok(value.map(text))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.client()?
            .set(key.as_bytes(), value.as_bytes())
            .await
            .map_err(|source| self.transport("SET", key, source))
    }

    async fn mget(&self, keys: &[&str]) -> StoreResult<Vec<Option<String>>> {
        let client = self.client()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<&[u8]> = keys.iter().map(|key| key.as_bytes()).collect();
        let values = client
            .mget(&raw)
            .await
            .map_err(|source| self.transport("MGET", &keys.join(" "), source))?;
        Ok(values.into_iter().map(|value| value.map(text)).collect())
    }

    async fn get_object(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let pairs = self
            .client()?
            .hgetall(key.as_bytes())
            .await
            .map_err(|source| self.transport("HGETALL", key, source))?;
        Ok(pairs
            .into_iter()
            .map(|(field, value)| (text(field), text(value)))
            .collect())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<String> {
        let value = self
            .client()?
            .hget(key.as_bytes(), field.as_bytes())
            .await
            .map_err(|source| self.transport("HGET", key, source))?;
        Ok(value.map(text).unwrap_or_default())
    }

    async fn lpush(&self, key: &str, element: &str) -> StoreResult<()> {
        self.client()?
            .lpush(key.as_bytes(), element.as_bytes())
            .await
            .map_err(|source| self.transport("LPUSH", key, source))?;
        Ok(())
    }

    async fn rpush(&self, key: &str, element: &str) -> StoreResult<()> {
        self.client()?
            .rpush(key.as_bytes(), element.as_bytes())
            .await
            .map_err(|source| self.transport("RPUSH", key, source))?;
        Ok(())
    }

    async fn lrem(&self, key: &str, element: &str, count: i64) -> StoreResult<()> {
        self.client()?
            .lrem(key.as_bytes(), count, element.as_bytes())
            .await
            .map_err(|source| self.transport("LREM", key, source))?;
        Ok(())
    }

    async fn list_range(&self, key: &str, from: i64, to: i64) -> StoreResult<Vec<String>> {
        let items = self
            .client()?
            .lrange(key.as_bytes(), from, to)
            .await
            .map_err(|source| self.transport("LRANGE", key, source))?;
        Ok(items.into_iter().map(text).collect())
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let len = self
            .client()?
            .llen(key.as_bytes())
            .await
            .map_err(|source| self.transport("LLEN", key, source))?;
        Ok(len.max(0) as usize)
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let key = normalize_list_key(key);
        self.llen(&key).await
    }

    async fn publish(&self, code: &str) -> StoreResult<bool> {
        let channel = self.default_channel();
        self.publish_ex(&channel, code).await
    }

    async fn publish_ex(&self, channel: &str, message: &str) -> StoreResult<bool> {
        let receivers = self
            .client()?
            .publish(channel.as_bytes(), message.as_bytes())
            .await
            .map_err(|source| self.transport("PUBLISH", channel, source))?;
        if receivers > 0 {
            debug!(parent: &self.span, channel, msg = message, receivers, "message sent");
        }
        Ok(receivers > 0)
    }

    async fn subscribe(
        &self,
        tag: &str,
        dst: mpsc::Sender<ChannelMessage>,
        channels: &[&str],
    ) -> StoreResult<JoinHandle<()>> {
        let mut source = self
            .pubsub()?
            .subscribe(channels)
            .await
            .map_err(|source| self.transport("SUBSCRIBE", &channels.join(" "), source))?;
        debug!(parent: &self.span, tag, ?channels, "subscription started");

        let tag = tag.to_string();
        let db = self.options.db;
        let span = self.span.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = source.recv().await {
                let envelope = ChannelMessage {
                    tag: tag.clone(),
                    db,
                    message,
                };
                if dst.send(envelope).await.is_err() {
                    break;
                }
            }
            debug!(parent: &span, tag = %tag, "subscription ended");
        }))
    }

    async fn exec(&self, command: &str, args: &[&str]) -> StoreResult<()> {
        let client = self.client()?;
        let mut parts: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        parts.push(command.as_bytes());
        parts.extend(args.iter().map(|arg| arg.as_bytes()));
        client
            .exec(&parts)
            .await
            .map_err(|source| self.transport(command, &args.join(" "), source))?;
        Ok(())
    }
}

fn text(raw: Vec<u8>) -> String {
    String::from_utf8(raw).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}
