//! Error types for the store layer.

use rfarm_client::ClientError;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Dialing the backend or selecting the database failed.
    #[error("redis connect to {address} (db {db}) failed: {source}")]
    Connection {
        address: String,
        db: u32,
        #[source]
        source: ClientError,
    },

    /// A command round trip failed.
    #[error("redis {op} {target} failed: {source}")]
    Transport {
        op: String,
        target: String,
        #[source]
        source: ClientError,
    },

    /// The store was used before `connect`.
    #[error("store is not connected")]
    NotConnected,

    /// The store was used after `close`.
    #[error("store is closed")]
    Closed,

    /// Farm configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
