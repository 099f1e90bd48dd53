//! Wire protocol error types

use thiserror::Error;

/// Errors raised while framing datagrams or parsing the request prologue
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Datagram too large: {size} bytes (max: {max})")]
    Oversize { size: usize, max: usize },

    #[error("Malformed request head: {0}")]
    BadHead(String),

    #[error("Invalid session id")]
    InvalidSessionId,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for wire protocol operations
pub type WireResult<T> = Result<T, WireError>;
