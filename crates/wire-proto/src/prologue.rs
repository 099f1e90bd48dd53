//! Session identifiers and the HTTP-like opening handshake

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{HEADER_PASSWD, HEADER_SESSION, WireError, WireResult};

/// 128-bit session identifier
///
/// Generated on the client, rendered as 32 lowercase hex characters on the
/// wire, and used by the server as the key into its endpoint map. Stable
/// for the entire session lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the wire form, hyphenated or plain hex
    pub fn parse(s: &str) -> WireResult<Self> {
        Uuid::try_parse(s.trim())
            .map(Self)
            .map_err(|_| WireError::InvalidSessionId)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Render the immutable request prologue sent at the start of every
/// byte-stream connection.
pub fn render_connect_request(password: &str, id: &SessionId) -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"CONNECT / HTTP/1.1\r\n");
    buf.put_slice(b"Host: udpierce\r\n");
    buf.put_slice(format!("{HEADER_PASSWD}: {password}\r\n").as_bytes());
    buf.put_slice(format!("{HEADER_SESSION}: {id}\r\n").as_bytes());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Request head as seen by the server, before any validation
#[derive(Debug, Clone)]
pub struct ConnectHead {
    pub method: String,
    pub password: Option<String>,
    pub session: Option<String>,
}

/// Incrementally parse a request head from `buf`.
///
/// Returns `Ok(None)` while the head is still incomplete. On completion
/// returns the head and the number of bytes consumed; anything past that
/// offset belongs to the frame stream and must be handed to the bridge.
pub fn parse_connect_head(buf: &[u8]) -> WireResult<Option<(ConnectHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req.method.unwrap_or_default().to_owned();
            let mut password = None;
            let mut session = None;
            for h in req.headers.iter() {
                if h.name.eq_ignore_ascii_case(HEADER_PASSWD) {
                    password = Some(String::from_utf8_lossy(h.value).into_owned());
                } else if h.name.eq_ignore_ascii_case(HEADER_SESSION) {
                    session = Some(String::from_utf8_lossy(h.value).into_owned());
                }
            }
            Ok(Some((
                ConnectHead {
                    method,
                    password,
                    session,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(WireError::BadHead(e.to_string())),
    }
}
