//! Server side of the tunnel
//!
//! Accepts byte-stream connections, validates the HTTP-like CONNECT
//! prologue, and bridges each accepted stream to a reference-counted UDP
//! endpoint shared by all connections of the same session id.

mod bridge;
mod endpoint;
mod error;
mod handler;
mod serve;

pub use bridge::*;
pub use endpoint::*;
pub use error::*;
pub use handler::*;
pub use serve::*;
