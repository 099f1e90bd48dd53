//! Wire protocol shared by the tunnel client and server
//!
//! Defines the length-prefixed datagram framing, the session identifier,
//! and the HTTP-like request prologue that opens every byte-stream
//! connection. Both peers must agree on everything in this crate.

mod error;
mod frame;
mod prologue;

pub use error::*;
pub use frame::*;
pub use prologue::*;

/// Receive buffer size for a single UDP datagram
pub const DGRAM_BUF: usize = 65536;

/// Width of the frame length prefix in bytes
pub const DGRAM_LEN_BYTES: usize = 2;

/// Largest payload that fits a length-prefixed frame
pub const MAX_DGRAM_LEN: usize = u16::MAX as usize;

/// Capacity of a client session's send queue
pub const MAX_DGRAM_QLEN: usize = 128;

/// TCP probes attempted by one-shot hostname resolution
pub const RESOLVE_ATTEMPTS: usize = 3;

/// Reply that completes the opening handshake, byte-for-byte
pub const SERVER_HELLO: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Request header carrying the (possibly empty) password
pub const HEADER_PASSWD: &str = "X-UDPIERCE-PASSWD";

/// Request header carrying the session id
pub const HEADER_SESSION: &str = "X-UDPIERCE-SESSION";
