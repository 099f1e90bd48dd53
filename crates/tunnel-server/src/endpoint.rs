//! Reference-counted UDP endpoints keyed by session id

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::debug;

use wire_proto::SessionId;

use crate::{EndpointError, EndpointResult};

/// One session's shared UDP socket and its user count.
///
/// The first connector dials through the `OnceCell`; concurrent connectors
/// wait on it and inherit the stored result, including a failed dial.
struct ConnEntry {
    refcount: Mutex<usize>,
    conn: OnceCell<EndpointResult<Arc<UdpSocket>>>,
}

/// Per-process map of UDP sockets toward the configured remote, one per
/// session id, shared by every byte-stream connection of that session.
pub struct DgramEndpoint {
    remote: String,
    connect_timeout: Duration,
    sessions: tokio::sync::Mutex<HashMap<SessionId, Arc<ConnEntry>>>,
}

impl DgramEndpoint {
    /// Build an endpoint toward `remote` (`host:port`).
    ///
    /// With `resolve_once` the hostname is resolved here, once; a failure
    /// is fatal at startup.
    pub async fn new(
        remote: String,
        connect_timeout: Duration,
        resolve_once: bool,
    ) -> EndpointResult<Self> {
        let remote = if resolve_once {
            resolve_addr(&remote).await?.to_string()
        } else {
            remote
        };
        Ok(Self {
            remote,
            connect_timeout,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Attach one more user to the session's endpoint, dialing it if this
    /// is the first.
    ///
    /// A failed dial stays mapped and is handed to every further connector
    /// until the refcount drops back to zero, at which point the entry is
    /// forgotten and a fresh session may re-dial.
    pub async fn connect_session(&self, id: SessionId) -> EndpointResult<Arc<UdpSocket>> {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&id) {
                Some(entry) => {
                    *entry.refcount.lock() += 1;
                    entry.clone()
                }
                None => {
                    let entry = Arc::new(ConnEntry {
                        refcount: Mutex::new(1),
                        conn: OnceCell::new(),
                    });
                    sessions.insert(id, entry.clone());
                    entry
                }
            }
        };
        entry.conn.get_or_init(|| self.dial()).await.clone()
    }

    /// Detach one user; the mapping is removed when the last one leaves.
    /// The socket itself closes once every bridge has dropped its handle.
    pub async fn disconnect_session(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(&id) {
            let last = {
                let mut refcount = entry.refcount.lock();
                *refcount -= 1;
                *refcount < 1
            };
            if last {
                sessions.remove(&id);
                debug!("endpoint for session {} released", id);
            }
        }
    }

    /// Number of live endpoint entries
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn dial(&self) -> EndpointResult<Arc<UdpSocket>> {
        let connect = async {
            let remote = resolve_addr(&self.remote).await?;
            let bind: SocketAddr = if remote.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|e| EndpointError::Dial(e.to_string()))?;
            socket
                .connect(remote)
                .await
                .map_err(|e| EndpointError::Dial(e.to_string()))?;
            Ok(Arc::new(socket))
        };
        match timeout(self.connect_timeout, connect).await {
            Ok(res) => res,
            Err(_) => Err(EndpointError::Timeout(self.connect_timeout)),
        }
    }
}

async fn resolve_addr(addr: &str) -> EndpointResult<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| EndpointError::Resolve(e.to_string()))?
        .next()
        .ok_or_else(|| EndpointError::Resolve(format!("no addresses for {addr}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refcount_shares_one_socket() {
        let endpoint = DgramEndpoint::new(
            "127.0.0.1:9".to_string(),
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();
        let id = SessionId::generate();

        let a = endpoint.connect_session(id).await.unwrap();
        let b = endpoint.connect_session(id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(endpoint.session_count().await, 1);

        // Entry survives until the last user leaves
        endpoint.disconnect_session(id).await;
        assert_eq!(endpoint.session_count().await, 1);
        endpoint.disconnect_session(id).await;
        assert_eq!(endpoint.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_distinct_sessions_get_distinct_sockets() {
        let endpoint = DgramEndpoint::new(
            "127.0.0.1:9".to_string(),
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();

        let a = endpoint.connect_session(SessionId::generate()).await.unwrap();
        let b = endpoint.connect_session(SessionId::generate()).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(endpoint.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_dial_is_shared() {
        let endpoint = DgramEndpoint::new(
            "does-not-resolve.invalid:1".to_string(),
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap();
        let id = SessionId::generate();

        assert!(endpoint.connect_session(id).await.is_err());
        // The failed entry stays mapped and every connector sees the error
        assert!(endpoint.connect_session(id).await.is_err());
        assert_eq!(endpoint.session_count().await, 1);

        endpoint.disconnect_session(id).await;
        endpoint.disconnect_session(id).await;
        assert_eq!(endpoint.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_once_failure_is_fatal() {
        let res = DgramEndpoint::new(
            "does-not-resolve.invalid:1".to_string(),
            Duration::from_secs(1),
            true,
        )
        .await;
        assert!(matches!(res, Err(EndpointError::Resolve(_))));
    }
}
