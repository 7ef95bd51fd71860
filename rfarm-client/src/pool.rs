//! # Connection Pool
//!
//! Purpose: Reuse TCP connections across concurrent callers, selecting the
//! configured database on every connection the pool dials.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Backpressure by Permit**: A semaphore caps total connections; callers
//!    wait for a permit instead of failing when the pool is busy.
//! 4. **Poison Isolation**: A connection that saw an IO or framing error is
//!    dropped, never handed out again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::client::{ClientError, ClientResult};
use crate::resp::{decode, encode_command, RespValue};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Database index passed to `SELECT` after dialing.
    pub db: u32,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional per-command response timeout.
    pub response_timeout: Option<Duration>,
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<VecDeque<Connection>>,
    permits: Arc<Semaphore>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. No connection is dialed until `acquire`.
    pub fn new(config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_total.max(1)));
        ConnectionPool {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
                config,
                permits,
            }),
        }
    }

    /// Dials one connection and parks it as idle.
    pub async fn warm_up(&self) -> ClientResult<()> {
        let conn = self.acquire().await?;
        drop(conn);
        Ok(())
    }

    /// Acquires a connection, waiting while `max_total` connections are in use.
    pub async fn acquire(&self) -> ClientResult<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::PoolClosed)?;

        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConnection::new(self.inner.clone(), conn, permit));
        }

        // On failure the permit drops with this frame and frees the slot.
        let conn = Connection::connect(&self.inner.config).await?;
        Ok(PooledConnection::new(self.inner.clone(), conn, permit))
    }

    /// Closes the pool: pending and future `acquire` calls fail and idle
    /// connections are dropped. Connections in use are dropped on release.
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().expect("pool mutex poisoned").clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    fn pop_idle(&self) -> Option<Connection> {
        let mut idle = self.inner.idle.lock().expect("pool mutex poisoned");
        idle.pop_front()
    }
}

impl PoolInner {
    fn return_connection(&self, conn: Connection) {
        if self.permits.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().expect("pool mutex poisoned");
        if idle.len() < self.config.max_idle {
            idle.push_back(conn);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
    // Released after `Drop::drop` has parked the connection.
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection, permit: OwnedSemaphorePermit) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
            _permit: permit,
        }
    }

    /// Executes a RESP command and returns the parsed response.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(ClientError::ConnectionClosed),
        };
        let response = conn.exec(args).await;
        if response.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.valid {
                self.pool.return_connection(conn);
            }
        }
    }
}

/// Single TCP connection with reusable buffers, already switched to the
/// configured database.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    response_timeout: Option<Duration>,
}

impl Connection {
    /// Dials `config.addr` and issues `SELECT config.db`.
    pub(crate) async fn connect(config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(config).await?;
        let mut conn = Connection {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(256),
            response_timeout: config.response_timeout,
        };

        let db = config.db.to_string();
        match conn.exec(&[b"SELECT", db.as_bytes()]).await? {
            RespValue::Simple(_) => {}
            RespValue::Error(message) => return Err(ClientError::server(message)),
            _ => return Err(ClientError::UnexpectedResponse),
        }

        debug!(addr = %config.addr, db = config.db, "dialed connection");
        Ok(conn)
    }

    pub(crate) async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;

        let response_timeout = self.response_timeout;
        match response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.read_value())
                .await
                .map_err(|_| ClientError::Timeout)?,
            None => self.read_value().await,
        }
    }

    async fn read_value(&mut self) -> ClientResult<RespValue> {
        loop {
            if let Some(value) = decode(&mut self.read_buf)? {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    /// Hands over the socket together with any bytes already buffered.
    pub(crate) fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream, self.read_buf)
    }
}

async fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let connect = TcpStream::connect(config.addr.as_str());
    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| ClientError::Timeout)??,
        None => connect.await?,
    };
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}
