//! # RedisFarm Async Client
//!
//! Purpose: Provide a lightweight async Redis client with connection pooling
//! and a persistent pub/sub connection, scoped to one logical database.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Database Affinity**: Every dialed connection runs `SELECT` first, so a
//!    client never talks to the wrong database.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod client;
mod pool;
mod pubsub;
mod resp;

pub use client::{Client, ClientConfig, ClientError, ClientResult};
pub use pubsub::{PubSub, PubSubMessage};
pub use resp::RespValue;
