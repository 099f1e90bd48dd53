//! Server error types

use thiserror::Error;

/// Result of a session's first endpoint dial.
///
/// Cloned to every later connector of the same session id, so the variants
/// carry owned strings rather than source errors.
#[derive(Debug, Clone, Error)]
pub enum EndpointError {
    #[error("Endpoint dial failed: {0}")]
    Dial(String),

    #[error("Endpoint dial timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Endpoint resolve failed: {0}")]
    Resolve(String),
}

/// Result type alias for endpoint operations
pub type EndpointResult<T> = Result<T, EndpointError>;
