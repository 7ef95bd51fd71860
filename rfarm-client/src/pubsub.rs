//! # Pub/Sub Connection
//!
//! Purpose: Hold one long-lived connection in subscribe mode, fan inbound
//! messages out to every local subscriber of the channel they arrived on, and
//! keep the connection alive across backend disconnects.
//!
//! ## Design Principles
//! 1. **Single Reader**: One supervisor task owns the read half and routes
//!    frames; writers share the write half behind an async mutex.
//! 2. **Register Before Subscribe**: Routes exist before `SUBSCRIBE` is sent,
//!    so no message published right after the confirmation is lost.
//! 3. **Persistent**: When the connection drops, the supervisor redials with
//!    backoff, selects the database again and re-subscribes every channel that
//!    still has a route. Receivers stay open across the gap.
//! 4. **Backpressure**: Routes are bounded. A full route stalls the reader, and
//!    with it the socket, instead of growing a queue.
//! 5. **Close by Dropping Routes**: `close` drops every route sender and each
//!    subscriber observes its receiver closing.
//!
//! ## Structure Overview
//!
//! ```text
//! PubSub
//!   ├── supervisor: JoinHandle              (read loop + redial)
//!   └── shared: Arc<PubSubShared>
//!         ├── writer:  Mutex<Option<OwnedWriteHalf>>   (None while redialing)
//!         ├── routes:  channel -> [Sender<PubSubMessage>]
//!         └── acks:    SUBSCRIBE requests in send order, plus parked waiters
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientConfig, ClientError, ClientResult};
use crate::pool::{Connection, PoolConfig};
use crate::resp::{decode, encode_command, RespValue};

const REDIAL_MIN_DELAY: Duration = Duration::from_millis(50);
const REDIAL_MAX_DELAY: Duration = Duration::from_secs(2);

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

type Route = mpsc::Sender<PubSubMessage>;
type Ack = oneshot::Sender<ClientResult<()>>;

/// One `SUBSCRIBE` written to the socket, waiting for its confirmations.
struct Pending {
    remaining: Vec<String>,
    waiters: Vec<Ack>,
}

#[derive(Default)]
struct Acks {
    /// Requests in the order they were written; the server answers in order.
    queue: VecDeque<Pending>,
    /// Waiters whose request is replayed by the next successful redial.
    parked: Vec<Ack>,
}

impl Acks {
    fn park_all(&mut self) {
        let waiters = self.queue.drain(..).flat_map(|pending| pending.waiters);
        self.parked.extend(waiters);
    }
}

struct PubSubShared {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    routes: Mutex<HashMap<String, Vec<Route>>>,
    acks: Mutex<Acks>,
    closed: AtomicBool,
}

/// Persistent pub/sub connection.
pub struct PubSub {
    shared: Arc<PubSubShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    response_timeout: Option<Duration>,
    buffer: usize,
}

impl PubSub {
    /// Dials a dedicated connection, selects the configured database and
    /// starts the supervisor task.
    ///
    /// Only this first dial reports failure; later disconnects are redialed
    /// in the background.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let pool_config = PoolConfig::from(config);
        let conn = Connection::connect(&pool_config).await?;
        let (stream, read_buf) = conn.into_parts();
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(PubSubShared {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            routes: Mutex::new(HashMap::new()),
            acks: Mutex::new(Acks::default()),
            closed: AtomicBool::new(false),
        });
        let supervisor = tokio::spawn(supervise(read_half, read_buf, shared.clone(), pool_config));

        Ok(PubSub {
            shared,
            supervisor: Mutex::new(Some(supervisor)),
            response_timeout: config.response_timeout,
            buffer: config.subscription_buffer.max(1),
        })
    }

    /// Subscribes to `channels` and returns a receiver fed with every message
    /// that arrives on any of them.
    ///
    /// Resolves once the server confirmed each channel. While the connection
    /// is being redialed the request waits for the replayed subscription,
    /// bounded by the response timeout. The receiver closes on `close`.
    pub async fn subscribe(&self, channels: &[&str]) -> ClientResult<mpsc::Receiver<PubSubMessage>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if channels.is_empty() {
            return Ok(rx);
        }

        {
            let mut routes = self.shared.routes.lock().expect("routes mutex poisoned");
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(ClientError::ConnectionClosed);
            }
            for channel in channels {
                routes.entry(channel.to_string()).or_default().push(tx.clone());
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_subscribe(channels, ack_tx).await;

        let confirm = async { ack_rx.await.unwrap_or(Err(ClientError::ConnectionClosed)) };
        let confirmed = match self.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, confirm)
                .await
                .unwrap_or(Err(ClientError::Timeout)),
            None => confirm.await,
        };
        if let Err(err) = confirmed {
            self.shared.remove_routes(&tx);
            return Err(err);
        }

        debug!(?channels, "subscribed");
        Ok(rx)
    }

    /// Stops the supervisor and closes every subscriber receiver. Idempotent.
    pub fn close(&self) {
        let supervisor = self.supervisor.lock().expect("supervisor mutex poisoned").take();
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.shared.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    async fn send_subscribe(&self, channels: &[&str], ack: Ack) {
        let mut writer = self.shared.writer.lock().await;
        {
            let mut acks = self.shared.acks.lock().expect("acks mutex poisoned");
            if self.shared.closed.load(Ordering::Acquire) {
                return;
            }
            if writer.is_none() {
                acks.parked.push(ack);
                return;
            }
            acks.queue.push_back(Pending {
                remaining: channels.iter().map(|channel| channel.to_string()).collect(),
                waiters: vec![ack],
            });
        }

        if let Some(stream) = writer.as_mut() {
            let mut buf = BytesMut::new();
            encode_subscribe(channels, &mut buf);
            if let Err(err) = stream.write_all(&buf).await {
                // The supervisor sees the broken socket and replays the request.
                debug!(error = %err, "pub/sub write failed");
            }
        }
    }
}

impl Drop for PubSub {
    fn drop(&mut self) {
        self.close();
    }
}

impl PubSubShared {
    async fn dispatch(&self, frame: RespValue) {
        let items = match frame {
            RespValue::Array(items) => items,
            RespValue::Error(message) => {
                self.fail_oldest(String::from_utf8_lossy(&message).into_owned());
                return;
            }
            other => {
                debug!(?other, "ignoring unexpected pub/sub frame");
                return;
            }
        };

        let mut items = items.into_iter();
        let kind = items.next().and_then(RespValue::into_bytes);
        let channel = items
            .next()
            .and_then(RespValue::into_bytes)
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());

        match (kind.as_deref(), channel) {
            (Some(b"subscribe"), Some(channel)) => self.acknowledge(&channel),
            (Some(b"message"), Some(channel)) => {
                let payload = items.next().and_then(RespValue::into_bytes).unwrap_or_default();
                self.route(channel, payload).await;
            }
            _ => {}
        }
    }

    fn acknowledge(&self, channel: &str) {
        let mut acks = self.acks.lock().expect("acks mutex poisoned");
        let idx = match acks
            .queue
            .iter()
            .position(|pending| pending.remaining.iter().any(|name| name == channel))
        {
            Some(idx) => idx,
            None => return,
        };

        let done = {
            let pending = &mut acks.queue[idx];
            if let Some(pos) = pending.remaining.iter().position(|name| name == channel) {
                pending.remaining.swap_remove(pos);
            }
            pending.remaining.is_empty()
        };
        if done {
            if let Some(pending) = acks.queue.remove(idx) {
                for waiter in pending.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// An error reply answers the oldest outstanding request only.
    fn fail_oldest(&self, message: String) {
        let oldest = self.acks.lock().expect("acks mutex poisoned").queue.pop_front();
        if let Some(pending) = oldest {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(ClientError::Server {
                    message: message.clone(),
                }));
            }
        }
    }

    async fn route(&self, channel: String, payload: Vec<u8>) {
        let targets: Vec<Route> = {
            let routes = self.routes.lock().expect("routes mutex poisoned");
            match routes.get(&channel) {
                Some(targets) => targets.clone(),
                None => return,
            }
        };

        let mut any_closed = false;
        for tx in &targets {
            let message = PubSubMessage {
                channel: channel.clone(),
                payload: payload.clone(),
            };
            // Waits while the subscriber's buffer is full.
            if tx.send(message).await.is_err() {
                any_closed = true;
            }
        }

        if any_closed {
            let mut routes = self.routes.lock().expect("routes mutex poisoned");
            let drained = match routes.get_mut(&channel) {
                Some(targets) => {
                    targets.retain(|tx| !tx.is_closed());
                    targets.is_empty()
                }
                None => false,
            };
            if drained {
                routes.remove(&channel);
            }
        }
    }

    fn remove_routes(&self, route: &Route) {
        let mut routes = self.routes.lock().expect("routes mutex poisoned");
        routes.retain(|_, targets| {
            targets.retain(|tx| !tx.same_channel(route));
            !targets.is_empty()
        });
    }

    /// Marks the connection as lost; outstanding requests wait for the replay.
    async fn detach(&self) {
        let mut writer = self.writer.lock().await;
        *writer = None;
        self.acks.lock().expect("acks mutex poisoned").park_all();
    }

    /// Installs a redialed connection after re-subscribing every routed channel.
    async fn attach(&self, mut stream: OwnedWriteHalf) -> ClientResult<()> {
        let mut writer = self.writer.lock().await;
        let channels: Vec<String> = self
            .routes
            .lock()
            .expect("routes mutex poisoned")
            .keys()
            .cloned()
            .collect();

        {
            let mut acks = self.acks.lock().expect("acks mutex poisoned");
            let waiters = std::mem::take(&mut acks.parked);
            if channels.is_empty() {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            } else {
                acks.queue.push_back(Pending {
                    remaining: channels.clone(),
                    waiters,
                });
            }
        }

        if !channels.is_empty() {
            let mut buf = BytesMut::new();
            encode_subscribe(&channels[..], &mut buf);
            if let Err(err) = stream.write_all(&buf).await {
                self.acks.lock().expect("acks mutex poisoned").park_all();
                return Err(err.into());
            }
        }

        *writer = Some(stream);
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut acks = self.acks.lock().expect("acks mutex poisoned");
            self.closed.store(true, Ordering::Release);
            acks.queue.clear();
            acks.parked.clear();
        }
        self.routes.lock().expect("routes mutex poisoned").clear();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

fn encode_subscribe<S: AsRef<str>>(channels: &[S], out: &mut BytesMut) {
    let mut args: Vec<&[u8]> = Vec::with_capacity(channels.len() + 1);
    args.push(b"SUBSCRIBE");
    args.extend(channels.iter().map(|channel| channel.as_ref().as_bytes()));
    encode_command(&args, out);
}

async fn supervise(
    mut stream: OwnedReadHalf,
    mut buf: BytesMut,
    shared: Arc<PubSubShared>,
    config: PoolConfig,
) {
    loop {
        read_loop(&mut stream, &mut buf, &shared).await;
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        shared.detach().await;
        warn!(addr = %config.addr, db = config.db, "pub/sub connection lost, redialing");

        match redial(&shared, &config).await {
            Some((next_stream, next_buf)) => {
                stream = next_stream;
                buf = next_buf;
            }
            None => break,
        }
    }
    shared.shutdown();
}

async fn redial(shared: &PubSubShared, config: &PoolConfig) -> Option<(OwnedReadHalf, BytesMut)> {
    let mut delay = REDIAL_MIN_DELAY;
    loop {
        tokio::time::sleep(delay).await;
        if shared.closed.load(Ordering::Acquire) {
            return None;
        }

        match Connection::connect(config).await {
            Ok(conn) => {
                let (stream, buf) = conn.into_parts();
                let (read_half, write_half) = stream.into_split();
                match shared.attach(write_half).await {
                    Ok(()) => {
                        info!(addr = %config.addr, db = config.db, "pub/sub connection restored");
                        return Some((read_half, buf));
                    }
                    Err(err) => debug!(error = %err, "pub/sub re-subscribe failed"),
                }
            }
            Err(err) => debug!(error = %err, "pub/sub redial failed"),
        }
        delay = (delay * 2).min(REDIAL_MAX_DELAY);
    }
}

async fn read_loop(stream: &mut OwnedReadHalf, buf: &mut BytesMut, shared: &PubSubShared) {
    loop {
        match decode(buf) {
            Ok(Some(frame)) => {
                shared.dispatch(frame).await;
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "malformed pub/sub frame");
                return;
            }
        }

        match stream.read_buf(buf).await {
            Ok(0) => {
                debug!("pub/sub connection closed by server");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "pub/sub read failed");
                return;
            }
        }
    }
}
