//! Client session: a pool of pump workers multiplexing one peer's datagrams
//!
//! Each session owns a bounded queue of pre-framed datagrams and a fixed
//! number of pump workers. Every worker maintains one byte-stream
//! connection through dial, prologue handshake, and duplex transfer, and
//! retries after a fixed backoff when the connection dies. With more than
//! one worker, datagrams pulled by different workers may reach the server
//! reordered; the wrapped traffic is UDP, so that is accepted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wire_proto::{DGRAM_BUF, MAX_DGRAM_QLEN, SERVER_HELLO, SessionId, render_connect_request};

use crate::{ByteStream, ClientError, ClientResult, ConnFactory};

/// Sink for datagrams flowing back toward the local peer.
///
/// Returns the number of bytes delivered. Invoked from downlink sub-tasks;
/// with more than one pump the calls may run concurrently, so
/// implementations must be safe for concurrent use.
pub type ReplySink = Arc<dyn Fn(&[u8]) -> std::io::Result<usize> + Send + Sync>;

/// Builds client sessions sharing one connection factory
pub struct ClientSessionFactory {
    password: String,
    backoff: Duration,
    conns: usize,
    connfactory: Arc<ConnFactory>,
}

impl ClientSessionFactory {
    pub fn new(
        password: String,
        backoff: Duration,
        conns: usize,
        connfactory: Arc<ConnFactory>,
    ) -> Self {
        Self {
            password,
            backoff,
            conns: conns.max(1),
            connfactory,
        }
    }

    /// Create a session whose replies are fed to `reply`
    pub fn session(&self, reply: ReplySink) -> ClientSession {
        ClientSession::new(
            &self.password,
            self.backoff,
            self.conns,
            self.connfactory.clone(),
            reply,
        )
    }
}

/// One logical peer's uplink
pub struct ClientSession {
    id: SessionId,
    send_queue: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// State shared by the pump workers of one session
struct PumpShared {
    id: SessionId,
    prologue: Bytes,
    backoff: Duration,
    connfactory: Arc<ConnFactory>,
    reply: ReplySink,
    cancel: CancellationToken,
    // Single consumer end of the send queue. Workers take the lock for one
    // recv at a time; the first worker ready pulls the next frame.
    recv_queue: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl ClientSession {
    fn new(
        password: &str,
        backoff: Duration,
        conns: usize,
        connfactory: Arc<ConnFactory>,
        reply: ReplySink,
    ) -> Self {
        let id = SessionId::generate();
        let prologue = render_connect_request(password, &id);
        let (send_queue, recv_queue) = mpsc::channel(MAX_DGRAM_QLEN);
        let cancel = CancellationToken::new();
        let shared = Arc::new(PumpShared {
            id,
            prologue,
            backoff,
            connfactory,
            reply,
            cancel: cancel.clone(),
            recv_queue: tokio::sync::Mutex::new(recv_queue),
        });
        for worker in 0..conns {
            tokio::spawn(pump(worker, shared.clone()));
        }
        Self {
            id,
            send_queue,
            cancel,
        }
    }

    /// Session id carried in the request prologue
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Frame `payload` and enqueue it for the pump pool.
    ///
    /// Never blocks the caller: when the queue is full the datagram is
    /// dropped with a warning, and after `stop()` nothing is enqueued.
    pub fn write(&self, payload: &[u8]) {
        if self.cancel.is_cancelled() {
            return;
        }
        let frame = match wire_proto::encode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("session {}: undeliverable datagram: {}", self.id, e);
                return;
            }
        };
        match self.send_queue.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("session {}: dropped packet due to send queue overflow", self.id);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Signal cancellation. Every pump worker exits at its next suspension
    /// point or completed I/O. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Non-blocking query of cancellation
    pub fn stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn pump(worker: usize, shared: Arc<PumpShared>) {
    debug!("session {}: pump {} started", shared.id, worker);
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let conn = match shared.connfactory.dial(&shared.cancel).await {
            Ok(conn) => conn,
            Err(ClientError::Cancelled) => break,
            Err(e) => {
                if shared.cancel.is_cancelled() {
                    break;
                }
                backoff_pause(&shared, &e).await;
                continue;
            }
        };

        let conn = match handshake(&shared, conn).await {
            Ok(conn) => conn,
            Err(ClientError::Cancelled) => break,
            Err(e) => {
                backoff_pause(&shared, &e).await;
                continue;
            }
        };

        match transfer(&shared, conn).await {
            Some(err) => backoff_pause(&shared, &err).await,
            // Session cancelled while transferring
            None => break,
        }
    }
    debug!("session {}: pump {} exited", shared.id, worker);
}

/// Write the request prologue and read the server hello.
///
/// The exchange runs as its own sub-task so session cancellation can abort
/// a stuck handshake; on cancel the connection is dropped and
/// [`ClientError::Cancelled`] returned. Any hello byte differing from
/// [`SERVER_HELLO`] fails the attempt.
async fn handshake(
    shared: &PumpShared,
    mut conn: Box<dyn ByteStream>,
) -> ClientResult<Box<dyn ByteStream>> {
    let exchange = async move {
        let res: ClientResult<()> = async {
            conn.write_all(&shared.prologue)
                .await
                .map_err(ClientError::Handshake)?;
            let mut hello = [0u8; SERVER_HELLO.len()];
            conn.read_exact(&mut hello)
                .await
                .map_err(ClientError::Handshake)?;
            if &hello[..] != SERVER_HELLO {
                return Err(ClientError::BadHello);
            }
            Ok(())
        }
        .await;
        (conn, res)
    };
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(ClientError::Cancelled),
        (conn, res) = exchange => res.map(|()| conn),
    }
}

/// Run the duplex copy over one connection.
///
/// Returns the error that ended the connection, or `None` when the session
/// itself was cancelled. Either sub-task failing cancels its sibling
/// through a connection-scoped token; both halves are joined before the
/// connection is torn down.
async fn transfer(shared: &Arc<PumpShared>, conn: Box<dyn ByteStream>) -> Option<ClientError> {
    let scope = shared.cancel.child_token();
    let (rd, wr) = tokio::io::split(conn);
    let up = tokio::spawn(uplink(shared.clone(), wr, scope.clone()));
    let down = tokio::spawn(downlink(shared.clone(), rd, scope));
    let (up_res, down_res) = tokio::join!(up, down);

    if shared.cancel.is_cancelled() {
        return None;
    }
    let err = [up_res, down_res]
        .into_iter()
        .filter_map(|res| res.ok())
        .find(|e| !matches!(e, ClientError::Cancelled))
        .unwrap_or(ClientError::Cancelled);
    Some(err)
}

/// Draw frames from the send queue and write them to the connection
async fn uplink(
    shared: Arc<PumpShared>,
    mut wr: WriteHalf<Box<dyn ByteStream>>,
    scope: CancellationToken,
) -> ClientError {
    loop {
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => return ClientError::Cancelled,
            frame = next_frame(&shared) => match frame {
                Some(frame) => frame,
                None => {
                    scope.cancel();
                    return ClientError::LocalClosed;
                }
            },
        };
        tokio::select! {
            biased;
            _ = scope.cancelled() => return ClientError::Cancelled,
            res = wr.write_all(&frame) => {
                if let Err(e) = res {
                    scope.cancel();
                    return ClientError::Stream(e);
                }
            }
        }
    }
}

async fn next_frame(shared: &PumpShared) -> Option<Bytes> {
    shared.recv_queue.lock().await.recv().await
}

/// Read frames from the connection and hand each payload to the reply sink
async fn downlink(
    shared: Arc<PumpShared>,
    mut rd: ReadHalf<Box<dyn ByteStream>>,
    scope: CancellationToken,
) -> ClientError {
    let mut buf = vec![0u8; DGRAM_BUF];
    loop {
        let len = tokio::select! {
            biased;
            _ = scope.cancelled() => return ClientError::Cancelled,
            res = wire_proto::read_frame(&mut rd, &mut buf) => match res {
                Ok(len) => len,
                Err(e) => {
                    warn!("session {}: incomplete read from channel: {}", shared.id, e);
                    scope.cancel();
                    return ClientError::Stream(e);
                }
            },
        };
        match (shared.reply)(&buf[..len]) {
            Ok(n) if n == len => {}
            Ok(n) => {
                warn!("session {}: short dgram send: {} of {} bytes", shared.id, n, len);
                scope.cancel();
                return ClientError::ShortReply {
                    written: n,
                    expected: len,
                };
            }
            Err(e) => {
                warn!("session {}: bad dgram send: {}", shared.id, e);
                scope.cancel();
                return ClientError::Reply(e);
            }
        }
    }
}

/// Log the failure and sleep one backoff interval, leaving early on cancel
async fn backoff_pause(shared: &PumpShared, reason: &ClientError) {
    if shared.cancel.is_cancelled() {
        return;
    }
    info!(
        "session {}: upstream connection terminated: {}. Backoff for {:?}...",
        shared.id, reason, shared.backoff
    );
    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = tokio::time::sleep(shared.backoff) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn stalled_factory() -> (Arc<ConnFactory>, tokio::task::JoinHandle<()>) {
        // Accepts connections and then stays silent, so the prologue
        // handshake never completes and no pump drains the queue.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((conn, _)) = listener.accept().await {
                    held.push(conn);
                }
            }
        });
        let factory = ConnFactory::new(addr, Duration::from_secs(5), None, 1, false)
            .await
            .unwrap();
        (Arc::new(factory), server)
    }

    #[tokio::test]
    async fn test_write_never_blocks_on_full_queue() {
        let (factory, server) = stalled_factory().await;
        let sessfact =
            ClientSessionFactory::new(String::new(), Duration::from_secs(60), 1, factory);
        let sess = sessfact.session(Arc::new(|data: &[u8]| Ok(data.len())));

        // Overfill the queue; the excess must be dropped, not awaited
        let start = Instant::now();
        for _ in 0..(MAX_DGRAM_QLEN + 64) {
            sess.write(b"payload");
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        sess.stop();
        server.abort();
    }

    #[tokio::test]
    async fn test_oversize_payload_dropped() {
        let (factory, server) = stalled_factory().await;
        let sessfact =
            ClientSessionFactory::new(String::new(), Duration::from_secs(60), 1, factory);
        let sess = sessfact.session(Arc::new(|data: &[u8]| Ok(data.len())));

        // Must be rejected before enqueue and must not panic
        sess.write(&vec![0u8; wire_proto::MAX_DGRAM_LEN + 1]);

        sess.stop();
        server.abort();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (factory, server) = stalled_factory().await;
        let sessfact =
            ClientSessionFactory::new(String::new(), Duration::from_secs(60), 2, factory);
        let sess = sessfact.session(Arc::new(|data: &[u8]| Ok(data.len())));

        assert!(!sess.stopped());
        sess.stop();
        sess.stop();
        assert!(sess.stopped());

        // Writes after stop are silently discarded
        sess.write(b"late");
        server.abort();
    }
}
