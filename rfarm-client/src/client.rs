//! # Async Client API
//!
//! Purpose: Expose a compact async API for issuing the Redis commands the
//! store layer needs, one typed method per command, over RESP2.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations and error replies surface immediately.

use std::time::Duration;

use thiserror::Error;

use crate::pool::{ConnectionPool, PoolConfig};
use crate::resp::RespValue;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {message}")]
    Server { message: String },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// The peer closed the connection mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,
    /// Connect or response deadline elapsed.
    #[error("operation timed out")]
    Timeout,
    /// The pool was closed and hands out no more connections.
    #[error("connection pool closed")]
    PoolClosed,
}

impl ClientError {
    pub(crate) fn server(message: Vec<u8>) -> Self {
        ClientError::Server {
            message: String::from_utf8_lossy(&message).into_owned(),
        }
    }
}

/// Configuration for the client, its pool and its pub/sub connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Database index selected on every new connection.
    pub db: u32,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional deadline for a single command round trip.
    pub response_timeout: Option<Duration>,
    /// Messages buffered per subscription before the pub/sub reader waits.
    pub subscription_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            db: 0,
            max_idle: 8,
            max_total: 16,
            connect_timeout: None,
            response_timeout: None,
            subscription_buffer: 64,
        }
    }
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        PoolConfig {
            addr: config.addr.clone(),
            db: config.db,
            max_idle: config.max_idle,
            max_total: config.max_total,
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
        }
    }
}

/// Async client with connection pooling.
///
/// Each call acquires a connection, executes one command, and returns the
/// connection to the pool. The handle is cheap to share behind an `Arc`.
pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    /// Connects with default settings and the given address.
    pub async fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let config = ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        };
        Self::with_config(&config).await
    }

    /// Creates a client and dials one connection up front, so an unreachable
    /// address or a rejected `SELECT` fails here rather than on first use.
    pub async fn with_config(config: &ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig::from(config));
        pool.warm_up().await?;
        Ok(Client { pool })
    }

    /// Closes the pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Executes an arbitrary command. Error replies become `ClientError::Server`.
    pub async fn exec(&self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let mut conn = self.pool.acquire().await?;
        match conn.exec(args).await? {
            RespValue::Error(message) => Err(ClientError::server(message)),
            value => Ok(value),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec(&[b"GET", key]).await? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.exec(&[b"SET", key, value]).await? {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches several keys at once; the reply is aligned with `keys`.
    pub async fn mget(&self, keys: &[&[u8]]) -> ClientResult<Vec<Option<Vec<u8>>>> {
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET");
        args.extend_from_slice(keys);

        match self.exec(&args).await? {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::Bulk(data) => Ok(data),
                    _ => Err(ClientError::UnexpectedResponse),
                })
                .collect(),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Returns every key matching `pattern` in one `KEYS` round trip.
    pub async fn keys(&self, pattern: &[u8]) -> ClientResult<Vec<Vec<u8>>> {
        bulk_list(self.exec(&[b"KEYS", pattern]).await?)
    }

    /// Runs one `SCAN` step. Returns the next cursor and the page of keys;
    /// a returned cursor of zero ends the iteration.
    pub async fn scan(&self, cursor: u64, pattern: &[u8]) -> ClientResult<(u64, Vec<Vec<u8>>)> {
        let cursor = cursor.to_string();
        let reply = self
            .exec(&[b"SCAN", cursor.as_bytes(), b"MATCH", pattern])
            .await?;

        let mut parts = match reply {
            RespValue::Array(parts) if parts.len() == 2 => parts.into_iter(),
            _ => return Err(ClientError::UnexpectedResponse),
        };
        let next = parts
            .next()
            .and_then(RespValue::into_bytes)
            .and_then(|raw| std::str::from_utf8(&raw).ok()?.parse::<u64>().ok())
            .ok_or(ClientError::UnexpectedResponse)?;
        let page = match parts.next() {
            Some(keys) => bulk_list(keys)?,
            None => return Err(ClientError::UnexpectedResponse),
        };
        Ok((next, page))
    }

    /// Returns all field/value pairs of a hash; empty when the key is missing.
    pub async fn hgetall(&self, key: &[u8]) -> ClientResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let flat = bulk_list(self.exec(&[b"HGETALL", key]).await?)?;
        if flat.len() % 2 != 0 {
            return Err(ClientError::UnexpectedResponse);
        }

        let mut pairs = Vec::with_capacity(flat.len() / 2);
        let mut items = flat.into_iter();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            pairs.push((field, value));
        }
        Ok(pairs)
    }

    /// Fetches one hash field; `Ok(None)` when the key or field is missing.
    pub async fn hget(&self, key: &[u8], field: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.exec(&[b"HGET", key, field]).await? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Prepends an element. Returns the new list length.
    pub async fn lpush(&self, key: &[u8], element: &[u8]) -> ClientResult<i64> {
        integer(self.exec(&[b"LPUSH", key, element]).await?)
    }

    /// Appends an element. Returns the new list length.
    pub async fn rpush(&self, key: &[u8], element: &[u8]) -> ClientResult<i64> {
        integer(self.exec(&[b"RPUSH", key, element]).await?)
    }

    /// Removes up to `count` occurrences of `element`. Returns how many were removed.
    pub async fn lrem(&self, key: &[u8], count: i64, element: &[u8]) -> ClientResult<i64> {
        let (count, len) = encode_i64(count);
        integer(self.exec(&[b"LREM", key, &count[..len], element]).await?)
    }

    /// Returns the inclusive range `start..=stop` of a list.
    pub async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> ClientResult<Vec<Vec<u8>>> {
        let (start, start_len) = encode_i64(start);
        let (stop, stop_len) = encode_i64(stop);
        bulk_list(
            self.exec(&[b"LRANGE", key, &start[..start_len], &stop[..stop_len]])
                .await?,
        )
    }

    pub async fn llen(&self, key: &[u8]) -> ClientResult<i64> {
        integer(self.exec(&[b"LLEN", key]).await?)
    }

    pub async fn exists(&self, key: &[u8]) -> ClientResult<bool> {
        Ok(integer(self.exec(&[b"EXISTS", key]).await?)? > 0)
    }

    /// Publishes a message. Returns the number of receiving subscribers.
    pub async fn publish(&self, channel: &[u8], message: &[u8]) -> ClientResult<i64> {
        integer(self.exec(&[b"PUBLISH", channel, message]).await?)
    }
}

fn integer(value: RespValue) -> ClientResult<i64> {
    match value {
        RespValue::Integer(value) => Ok(value),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn bulk_list(value: RespValue) -> ClientResult<Vec<Vec<u8>>> {
    match value {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| item.into_bytes().ok_or(ClientError::UnexpectedResponse))
            .collect(),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

fn encode_i64(value: i64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut magnitude = value.unsigned_abs();
    if magnitude == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while magnitude > 0 {
        buf[len] = b'0' + (magnitude % 10) as u8;
        magnitude /= 10;
        len += 1;
    }
    if value < 0 {
        buf[len] = b'-';
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}
