//! Framework error types.

use std::io;

use thiserror::Error;

use crate::addr::Address;

/// Result type for framework operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors that can occur while setting up or running a server.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: Address,
        source: io::Error,
    },

    /// A bind address could not be parsed as dotted IPv4.
    #[error("invalid IPv4 address {addr:?}: {source}")]
    InvalidAddress {
        addr: String,
        source: std::net::AddrParseError,
    },

    /// An I/O worker thread exited before its reactor came up.
    #[error("worker thread {name:?} failed to start its reactor")]
    WorkerStart { name: String },
}
