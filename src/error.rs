//! Error types for the control-protocol engine.
//!
//! Four failure classes cover every fallible operation: the server rejected
//! an operation, the transport died, a local deadline elapsed, or the caller
//! handed us malformed input. Transport failures are terminal — they fan out
//! to every pending request and owned tunnel on the connection and are never
//! retried here.

use serde_json::Value;
use thiserror::Error;

/// The canonical error type for this crate.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The server explicitly reported a non-success result for an operation.
    /// Carries the server's full response payload.
    #[error("server rejected operation: {0}")]
    Server(Value),

    /// The connection closed while the operation was outstanding, or the
    /// operation was attempted on a connection already closed.
    ///
    /// For buffered shell reads, `partial` carries bytes drained from the
    /// accumulation buffer when the caller asked to keep data on failure.
    #[error("connection closed")]
    Closed { partial: Option<Vec<u8>> },

    /// The socket reported an error. Terminal for every request in flight
    /// on that connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// A client-side deadline elapsed. The server-side operation is not
    /// cancelled. `partial` carries drained bytes for buffered reads when
    /// the caller asked to keep data on timeout.
    #[error("operation timed out")]
    Timeout { partial: Option<Vec<u8>> },

    /// Malformed caller input — a missing identifier, a bad URL scheme, an
    /// invalid pattern.
    #[error("invalid input: {0}")]
    Invalid(String),
}

impl Error {
    /// A closed-connection error with no attached data.
    pub fn closed() -> Self {
        Error::Closed { partial: None }
    }

    /// A timeout error with no attached data.
    pub fn timeout() -> Self {
        Error::Timeout { partial: None }
    }

    /// Bytes attached to a `Closed` or `Timeout` failure, if any.
    pub fn partial_data(&self) -> Option<&[u8]> {
        match self {
            Error::Closed { partial } | Error::Timeout { partial } => partial.as_deref(),
            _ => None,
        }
    }
}
