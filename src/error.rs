//! Error types for the proxy.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors produced while configuring the proxy or answering a query.
#[derive(Debug, Error)]
pub enum Error {
    /// An override pattern is not a valid glob. Fatal at startup.
    #[error("invalid pattern {pattern:?}: {reason}")]
    Compile { pattern: String, reason: String },

    /// Nothing answered the question: no cache hit, no local override and
    /// an empty upstream answer, or an alias chain that never terminated.
    #[error("not found")]
    NotFound,

    /// The upstream exchange failed on the network.
    #[error("upstream transport error: {0}")]
    Transport(#[from] io::Error),

    /// The upstream did not answer within the exchange timeout.
    #[error("upstream {0} timed out")]
    Timeout(SocketAddr),

    /// A DNS message could not be decoded or encoded.
    #[error("malformed DNS message: {0}")]
    Protocol(String),

    /// Invalid settings.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
