//! Client side of the tunnel
//!
//! Accepts UDP datagrams from local peers, groups them into expiring
//! sessions keyed by source address, and multiplexes each session's
//! traffic over a pool of framed byte-stream connections to the server.

mod error;
mod factory;
mod listener;
mod session;

pub use error::*;
pub use factory::*;
pub use listener::*;
pub use session::*;
