//! Per-connection CONNECT request handling

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use constant_time_eq::constant_time_eq_32;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use wire_proto::{ConnectHead, SERVER_HELLO, SessionId, parse_connect_head};

use crate::{DgramEndpoint, bridge};

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const MAX_HEAD: usize = 8192;

/// Validates incoming CONNECT requests and bridges accepted streams to the
/// shared UDP endpoint.
pub struct ServerHandler {
    endpoint: Arc<DgramEndpoint>,
    require_tls_auth: bool,
    pass_hash: Option<[u8; 32]>,
}

impl ServerHandler {
    /// `require_tls_auth` demands a verified client certificate chain; a
    /// non-empty `password` additionally demands a matching password
    /// header, compared as SHA-256 digests in constant time.
    pub fn new(password: &str, endpoint: Arc<DgramEndpoint>, require_tls_auth: bool) -> Self {
        let pass_hash = (!password.is_empty()).then(|| Sha256::digest(password.as_bytes()).into());
        Self {
            endpoint,
            require_tls_auth,
            pass_hash,
        }
    }

    /// Handle one accepted byte stream until its session ends.
    ///
    /// `client_cert_verified` reports whether the TLS layer saw a verified
    /// client chain. Rejections answer a plain 400 and never say why. The
    /// endpoint is detached on every exit path past the connect.
    pub async fn handle<S>(&self, stream: S, peer: SocketAddr, client_cert_verified: bool)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);

        let (head, leftover) = match read_head(&mut rd).await {
            Ok(parsed) => parsed,
            Err(HeadError::Malformed(reason)) => {
                info!("Malformed request from {}: {}", peer, reason);
                reject(&mut wr).await;
                return;
            }
            Err(HeadError::Io(e)) => {
                info!("Connection from {} dropped before request head: {}", peer, e);
                return;
            }
        };

        let id = match self.authorize(&head, peer, client_cert_verified) {
            Some(id) => id,
            None => {
                reject(&mut wr).await;
                return;
            }
        };
        info!("Incoming session {} from {}", id, peer);

        if let Err(e) = wr.write_all(SERVER_HELLO).await {
            error!("Can't write hello message to {}: {}", peer, e);
            return;
        }

        match self.endpoint.connect_session(id).await {
            Ok(socket) => {
                // Bytes that followed the head in the same read belong to
                // the frame stream; replay them ahead of the connection.
                let rd = Cursor::new(leftover).chain(rd);
                bridge(rd, wr, socket).await;
            }
            Err(e) => error!("Endpoint connection failed: {}", e),
        }
        self.endpoint.disconnect_session(id).await;
        info!("Session {} from {} terminated", id, peer);
    }

    /// Ordered checks: client TLS auth, password, method, session id.
    /// Returns the session id to serve, or `None` to reject.
    fn authorize(
        &self,
        head: &ConnectHead,
        peer: SocketAddr,
        client_cert_verified: bool,
    ) -> Option<SessionId> {
        if self.require_tls_auth && !client_cert_verified {
            info!("Got unauthorized request (no TLS cert) from {}", peer);
            return None;
        }
        if let Some(expected) = &self.pass_hash {
            let presented: [u8; 32] =
                Sha256::digest(head.password.as_deref().unwrap_or("").as_bytes()).into();
            if !constant_time_eq_32(&presented, expected) {
                info!("Got unauthorized request (password mismatch) from {}", peer);
                return None;
            }
        }
        if !head.method.eq_ignore_ascii_case("CONNECT") {
            info!("Bad request method ({}) from {}", head.method, peer);
            return None;
        }
        match head.session.as_deref().map(SessionId::parse) {
            Some(Ok(id)) => Some(id),
            _ => {
                error!("Bad request from {}: no parseable session id", peer);
                None
            }
        }
    }
}

enum HeadError {
    Malformed(String),
    Io(std::io::Error),
}

/// Accumulate bytes until a full request head parses. Anything read past
/// the head is returned for replay into the frame stream.
async fn read_head<R>(rd: &mut R) -> Result<(ConnectHead, Bytes), HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        match parse_connect_head(&buf) {
            Ok(Some((head, consumed))) => {
                let leftover = buf.split_off(consumed).freeze();
                return Ok((head, leftover));
            }
            Ok(None) => {
                if buf.len() >= MAX_HEAD {
                    return Err(HeadError::Malformed("request head too large".into()));
                }
                match rd.read_buf(&mut buf).await {
                    Ok(0) => {
                        return Err(HeadError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "EOF in request head",
                        )));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(HeadError::Io(e)),
                }
            }
            Err(e) => return Err(HeadError::Malformed(e.to_string())),
        }
    }
}

async fn reject<W>(wr: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let _ = wr.write_all(BAD_REQUEST).await;
    let _ = wr.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use wire_proto::{DGRAM_BUF, render_connect_request};

    fn peer() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    async fn spawn_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DGRAM_BUF];
            loop {
                if let Ok((n, from)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
            }
        });
        addr
    }

    async fn handler_for(
        password: &str,
        remote: SocketAddr,
        require_tls_auth: bool,
    ) -> Arc<ServerHandler> {
        let endpoint = Arc::new(
            DgramEndpoint::new(remote.to_string(), Duration::from_secs(1), false)
                .await
                .unwrap(),
        );
        Arc::new(ServerHandler::new(password, endpoint, require_tls_auth))
    }

    async fn expect_rejected(handler: Arc<ServerHandler>, request: &[u8]) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer(), false).await });

        client.write_all(request).await.unwrap();
        let mut reply = [0u8; BAD_REQUEST.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..], BAD_REQUEST);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_echo_session() {
        let echo = spawn_udp_echo().await;
        let handler = handler_for("", echo, false).await;
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer(), false).await });

        let id = SessionId::generate();
        client
            .write_all(&render_connect_request("", &id))
            .await
            .unwrap();
        let mut hello = [0u8; SERVER_HELLO.len()];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[..], SERVER_HELLO);

        client
            .write_all(&wire_proto::encode(b"ping").unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; DGRAM_BUF];
        let n = wire_proto::read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_sent_with_the_head_survive() {
        let echo = spawn_udp_echo().await;
        let handler = handler_for("", echo, false).await;
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer(), false).await });

        // Prologue and first frame in a single write
        let id = SessionId::generate();
        let mut opening = render_connect_request("", &id).to_vec();
        opening.extend_from_slice(&wire_proto::encode(b"early").unwrap());
        client.write_all(&opening).await.unwrap();

        let mut hello = [0u8; SERVER_HELLO.len()];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[..], SERVER_HELLO);

        let mut buf = vec![0u8; DGRAM_BUF];
        let n = wire_proto::read_frame(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"early");

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_password_checked() {
        let echo = spawn_udp_echo().await;

        let id = SessionId::generate();
        let handler = handler_for("right", echo, false).await;
        expect_rejected(handler, &render_connect_request("wrong", &id)).await;

        // Matching password is accepted
        let handler = handler_for("right", echo, false).await;
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(async move { handler.handle(server, peer(), false).await });
        client
            .write_all(&render_connect_request("right", &id))
            .await
            .unwrap();
        let mut hello = [0u8; SERVER_HELLO.len()];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(&hello[..], SERVER_HELLO);
        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_connect_method_rejected() {
        let echo = spawn_udp_echo().await;
        let handler = handler_for("", echo, false).await;
        let id = SessionId::generate();
        let request = format!(
            "GET / HTTP/1.1\r\nHost: udpierce\r\nX-UDPIERCE-SESSION: {id}\r\n\r\n"
        );
        expect_rejected(handler, request.as_bytes()).await;
    }

    #[tokio::test]
    async fn test_missing_session_rejected() {
        let echo = spawn_udp_echo().await;
        let handler = handler_for("", echo, false).await;
        expect_rejected(
            handler,
            b"CONNECT / HTTP/1.1\r\nHost: udpierce\r\n\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_client_cert_required() {
        let echo = spawn_udp_echo().await;
        let handler = handler_for("", echo, true).await;
        let id = SessionId::generate();
        expect_rejected(handler, &render_connect_request("", &id)).await;
    }
}
