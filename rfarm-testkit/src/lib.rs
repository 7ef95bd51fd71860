//! # RedisFarm Testkit
//!
//! Purpose: A scripted RESP2 server for integration tests. Each test supplies a
//! handler mapping a received command to the frames written back, and can
//! inspect every command the server saw afterwards.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rfarm_testkit::{FakeServer, Reply};
//!
//! async fn example() {
//!     let server = FakeServer::spawn(|args| match args[0].as_str() {
//!         "GET" => Some(vec![Reply::bulk("value")]),
//!         _ => None,
//!     })
//!     .await;
//!     // connect a client to server.addr() ...
//! }
//! ```
//!
//! Commands the handler declines (`None`) get a default reply: `+OK` for
//! `SELECT`, `+PONG` for `PING`, an error reply otherwise.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A reply frame written by the fake server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
    /// Bytes written as-is, for malformed frames.
    Raw(Vec<u8>),
    /// Closes the connection once the frames before it are written.
    Hangup,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }

    pub fn error(message: &str) -> Self {
        Reply::Error(message.to_string())
    }

    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Reply::Bulk(Some(data.as_ref().to_vec()))
    }

    /// Array of bulk strings.
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Reply::Array(items.into_iter().map(Reply::bulk).collect())
    }

    /// Confirmation pushed for each channel of a `SUBSCRIBE`.
    pub fn subscribed(channel: &str, count: i64) -> Self {
        Reply::Array(vec![
            Reply::bulk("subscribe"),
            Reply::bulk(channel),
            Reply::Integer(count),
        ])
    }

    /// A message pushed to a subscribed connection.
    pub fn message(channel: &str, payload: impl AsRef<[u8]>) -> Self {
        Reply::Array(vec![
            Reply::bulk("message"),
            Reply::bulk(channel),
            Reply::bulk(payload),
        ])
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
            }
            Reply::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
            }
            Reply::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
            }
            Reply::Bulk(None) => out.extend_from_slice(b"$-1"),
            Reply::Bulk(Some(data)) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
            }
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
                return;
            }
            Reply::Raw(data) => {
                out.extend_from_slice(data);
                return;
            }
            Reply::Hangup => return,
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// One command received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Accept order of the connection, starting at zero.
    pub connection: usize,
    pub args: Vec<String>,
}

type Handler = dyn Fn(&[String]) -> Option<Vec<Reply>> + Send + Sync;

/// Scripted RESP2 server bound to an ephemeral localhost port.
pub struct FakeServer {
    addr: String,
    log: Arc<Mutex<Vec<Recorded>>>,
    accepted: Arc<AtomicUsize>,
    generation: watch::Sender<u64>,
    accept_task: JoinHandle<()>,
}

impl FakeServer {
    /// Binds the listener and starts accepting connections.
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&[String]) -> Option<Vec<Reply>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let handler: Arc<Handler> = Arc::new(handler);
        let log = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (generation, _) = watch::channel(0u64);

        let accept_task = {
            let log = log.clone();
            let accepted = accepted.clone();
            let generation = generation.subscribe();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let id = accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        id,
                        stream,
                        handler.clone(),
                        log.clone(),
                        generation.clone(),
                    ));
                }
            })
        };

        FakeServer {
            addr,
            log,
            accepted,
            generation,
            accept_task,
        }
    }

    /// Server address in `host:port` form.
    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Every command received so far, in arrival order.
    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().expect("log mutex poisoned").clone()
    }

    /// Arguments of every command received so far.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.recorded().into_iter().map(|entry| entry.args).collect()
    }

    /// Commands whose name equals `name` (ASCII case-insensitive).
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|args| args.first().is_some_and(|cmd| cmd.eq_ignore_ascii_case(name)))
            .collect()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Drops every connection accepted so far. New connections are still served.
    pub fn disconnect_all(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.disconnect_all();
    }
}

/// Returns a localhost address nothing listens on.
pub async fn unreachable_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr").to_string()
}

/// Installs a test-friendly `tracing` subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn serve(
    id: usize,
    mut stream: TcpStream,
    handler: Arc<Handler>,
    log: Arc<Mutex<Vec<Recorded>>>,
    mut generation: watch::Receiver<u64>,
) {
    let started = *generation.borrow_and_update();
    let mut buf = BytesMut::with_capacity(4 * 1024);

    loop {
        while let Some(args) = parse_command(&mut buf) {
            log.lock().expect("log mutex poisoned").push(Recorded {
                connection: id,
                args: args.clone(),
            });

            let replies = handler(args.as_slice()).unwrap_or_else(|| default_reply(&args));
            let mut out = Vec::new();
            let mut hangup = false;
            for reply in &replies {
                if *reply == Reply::Hangup {
                    hangup = true;
                    break;
                }
                reply.encode(&mut out);
            }
            if stream.write_all(&out).await.is_err() || hangup {
                return;
            }
        }

        tokio::select! {
            changed = generation.changed() => {
                if changed.is_err() || *generation.borrow() != started {
                    return;
                }
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        }
    }
}

fn default_reply(args: &[String]) -> Vec<Reply> {
    let name = args.first().map(|cmd| cmd.to_ascii_uppercase()).unwrap_or_default();
    match name.as_str() {
        "SELECT" => vec![Reply::ok()],
        "PING" => vec![Reply::Simple("PONG".to_string())],
        _ => vec![Reply::Error(format!("ERR unknown command '{}'", name))],
    }
}

/// Pops one complete `*N` array of bulk strings off the buffer.
fn parse_command(buf: &mut BytesMut) -> Option<Vec<String>> {
    let (args, consumed) = parse_array(&buf[..])?;
    buf.advance(consumed);
    Some(args)
}

fn parse_array(data: &[u8]) -> Option<(Vec<String>, usize)> {
    let (header, mut pos) = read_line(data, 0)?;
    let count: usize = header.strip_prefix(b"*")?.iter().try_fold(0usize, digit)?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let (header, next) = read_line(data, pos)?;
        let len: usize = header.strip_prefix(b"$")?.iter().try_fold(0usize, digit)?;
        let end = next + len;
        if data.len() < end + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&data[next..end]).into_owned());
        pos = end + 2;
    }
    Some((args, pos))
}

fn read_line(data: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = data.get(pos..)?;
    let idx = rest.windows(2).position(|pair| pair == b"\r\n")?;
    Some((&rest[..idx], pos + idx + 2))
}

fn digit(acc: usize, byte: &u8) -> Option<usize> {
    if byte.is_ascii_digit() {
        Some(acc * 10 + (byte - b'0') as usize)
    } else {
        None
    }
}
