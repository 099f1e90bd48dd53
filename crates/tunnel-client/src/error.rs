//! Client error types

use std::time::Duration;

use thiserror::Error;

/// Errors on the client data path
///
/// `Dial`, `Handshake`, `BadHello`, and `Stream` are absorbed by the pump
/// workers and answered with a backoff retry; `Cancelled` is clean
/// termination and is never reported as a failure.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connect failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("Connect timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("One-shot resolve failed: {0}")]
    Resolve(#[source] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("Bad hello from server")]
    BadHello,

    #[error("Stream transfer failed: {0}")]
    Stream(#[source] std::io::Error),

    #[error("Reply delivery failed: {0}")]
    Reply(#[source] std::io::Error),

    #[error("Short reply write: {written} of {expected} bytes")]
    ShortReply { written: usize, expected: usize },

    #[error("Connection closed by local side")]
    LocalClosed,

    #[error("Session cancelled")]
    Cancelled,
}

/// Result type alias for client operations
pub type ClientResult<T> = Result<T, ClientError>;
