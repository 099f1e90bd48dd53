//! UDP listener that demultiplexes local peers into sessions

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info};

use wire_proto::DGRAM_BUF;

use crate::{ClientSessionFactory, ClientSession, ReplySink};

/// A session paired with its expiry deadline.
///
/// The deadline is advanced on every successful datagram in either
/// direction: the receive loop stamps it on ingress, the reply sink stamps
/// it on egress.
struct SessionEntry {
    expire_at: Arc<Mutex<Instant>>,
    sess: ClientSession,
}

/// Owns the local UDP socket, the peer-address session map, and the single
/// expiry sweeper.
pub struct ClientListener {
    expire: Duration,
    sessfact: ClientSessionFactory,
    socket: Arc<UdpSocket>,
    sessions: RwLock<HashMap<SocketAddr, Arc<SessionEntry>>>,
    wakeup: Notify,
}

impl ClientListener {
    /// Bind the local UDP socket
    pub async fn bind(
        bind: &str,
        expire: Duration,
        sessfact: ClientSessionFactory,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        Ok(Self {
            expire,
            sessfact,
            socket,
            sessions: RwLock::new(HashMap::new()),
            wakeup: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Receive datagrams forever, creating and expiring sessions as needed.
    /// Does not return; run it as its own task.
    pub async fn serve(self: Arc<Self>) {
        tokio::spawn(self.clone().sweep());
        let mut buf = vec![0u8; DGRAM_BUF];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, peer)) => self.dispatch(&buf[..n], peer),
                Err(e) => error!("UDP receive error: {}", e),
            }
        }
    }

    fn dispatch(&self, payload: &[u8], peer: SocketAddr) {
        let entry = {
            let sessions = self.sessions.read();
            sessions.get(&peer).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None => self.new_session(peer),
        };
        *entry.expire_at.lock() = Instant::now() + self.expire;
        entry.sess.write(payload);
    }

    fn new_session(&self, peer: SocketAddr) -> Arc<SessionEntry> {
        info!("Creating new session for {}", peer);
        let expire_at = Arc::new(Mutex::new(Instant::now() + self.expire));
        let sink: ReplySink = {
            let expire_at = expire_at.clone();
            let socket = self.socket.clone();
            let interval = self.expire;
            Arc::new(move |data: &[u8]| {
                *expire_at.lock() = Instant::now() + interval;
                socket.try_send_to(data, peer)
            })
        };
        let entry = Arc::new(SessionEntry {
            expire_at,
            sess: self.sessfact.session(sink),
        });
        self.sessions.write().insert(peer, entry.clone());
        self.wakeup.notify_one();
        entry
    }

    /// Single long-lived sweeper task.
    ///
    /// Sleeps until the closest expiry deadline, removes expired entries
    /// from the map first, and only then stops their sessions, so no
    /// datagram can be enqueued into a stopped session by the receive loop.
    async fn sweep(self: Arc<Self>) {
        loop {
            self.wakeup.notified().await;
            loop {
                let now = Instant::now();
                let mut closest: Option<Instant> = None;
                let mut expired: Vec<(SocketAddr, Arc<SessionEntry>)> = Vec::new();
                {
                    let sessions = self.sessions.read();
                    for (peer, entry) in sessions.iter() {
                        let expire_at = *entry.expire_at.lock();
                        if expire_at <= now {
                            expired.push((*peer, entry.clone()));
                        } else if closest.is_none_or(|c| expire_at < c) {
                            closest = Some(expire_at);
                        }
                    }
                }

                if !expired.is_empty() {
                    {
                        let mut sessions = self.sessions.write();
                        for (peer, _) in &expired {
                            if sessions.remove(peer).is_some() {
                                info!("Session for {} expired", peer);
                            }
                        }
                    }
                    for (_, entry) in &expired {
                        entry.sess.stop();
                    }
                }

                match closest {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnFactory;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_sessions_expire() {
        // Upstream that accepts and stalls; the data path is irrelevant here
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((conn, _)) = upstream.accept().await {
                    held.push(conn);
                }
            }
        });

        let factory = Arc::new(
            ConnFactory::new(upstream_addr, Duration::from_secs(5), None, 1, false)
                .await
                .unwrap(),
        );
        let sessfact =
            ClientSessionFactory::new(String::new(), Duration::from_secs(60), 1, factory);
        let listener = Arc::new(
            ClientListener::bind("127.0.0.1:0", Duration::from_millis(100), sessfact)
                .await
                .unwrap(),
        );
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.clone().serve());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hello", addr).await.unwrap();

        // Session appears, then expires after the idle interval
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(listener.session_count(), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(listener.session_count(), 0);

        // A fresh datagram from the same peer creates a new session
        peer.send_to(b"again", addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(listener.session_count(), 1);

        server.abort();
    }
}
