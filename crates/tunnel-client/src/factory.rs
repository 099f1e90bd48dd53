//! Outbound connection factory

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wire_proto::RESOLVE_ATTEMPTS;

use crate::{ClientError, ClientResult};

/// A byte stream carrying both directions, boxable behind one trait object
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// TLS parameters applied to every outbound connection
pub struct TlsParams {
    pub config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
}

/// Produces authenticated byte-stream connections toward the server
///
/// Applies a per-call connect timeout and bounds the number of in-flight
/// dials. Errors are handed to the caller unchanged; retry policy lives in
/// the pump workers.
pub struct ConnFactory {
    addr: String,
    connect_timeout: Duration,
    tls: Option<TlsParams>,
    dialers: Semaphore,
}

impl ConnFactory {
    /// Build a factory toward `addr` (`host:port`).
    ///
    /// With `resolve_once` the hostname is resolved here, once, by probing a
    /// TCP connection; a failure is fatal at startup.
    pub async fn new(
        addr: String,
        connect_timeout: Duration,
        tls: Option<TlsParams>,
        dialers: usize,
        resolve_once: bool,
    ) -> ClientResult<Self> {
        let addr = if resolve_once {
            let resolved = probe_resolve_tcp(&addr, connect_timeout).await?;
            debug!("resolved {} to {}", addr, resolved);
            resolved
        } else {
            addr
        };
        Ok(Self {
            addr,
            connect_timeout,
            tls,
            dialers: Semaphore::new(dialers.max(1)),
        })
    }

    /// Dial one connection, wrapping it in TLS when configured.
    ///
    /// Waits for a dialer slot, then drives the TCP connect and the TLS
    /// handshake under the connect timeout. Cancellation aborts at any
    /// suspension point.
    pub async fn dial(&self, cancel: &CancellationToken) -> ClientResult<Box<dyn ByteStream>> {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            permit = self.dialers.acquire() => permit.map_err(|_| ClientError::Cancelled)?,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            res = timeout(self.connect_timeout, self.connect()) => match res {
                Ok(res) => res,
                Err(_) => Err(ClientError::DialTimeout(self.connect_timeout)),
            },
        }
    }

    async fn connect(&self) -> ClientResult<Box<dyn ByteStream>> {
        let tcp = TcpStream::connect(&self.addr)
            .await
            .map_err(ClientError::Dial)?;
        match &self.tls {
            Some(params) => {
                let connector = TlsConnector::from(params.config.clone());
                let stream = connector
                    .connect(params.server_name.clone(), tcp)
                    .await
                    .map_err(ClientError::Dial)?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

/// Resolve `addr` by completing a TCP connection and keeping the peer
/// address the OS dialed. Retried a fixed number of times; the last error
/// wins.
pub async fn probe_resolve_tcp(addr: &str, connect_timeout: Duration) -> ClientResult<String> {
    let mut last_err = None;
    for attempt in 1..=RESOLVE_ATTEMPTS {
        let res = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "resolve probe timed out",
            )),
        };
        match res.and_then(|conn| conn.peer_addr()) {
            Ok(peer) => return Ok(peer.to_string()),
            Err(e) => {
                debug!("resolve probe {}/{} failed: {}", attempt, RESOLVE_ATTEMPTS, e);
                last_err = Some(e);
            }
        }
    }
    Err(ClientError::Resolve(last_err.unwrap_or_else(|| {
        std::io::Error::other("no resolve attempts made")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_plain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let factory = ConnFactory::new(addr, Duration::from_secs(1), None, 1, false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        factory.dial(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to find a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let factory = ConnFactory::new(addr, Duration::from_secs(1), None, 1, false)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(
            factory.dial(&cancel).await,
            Err(ClientError::Dial(_)) | Err(ClientError::DialTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let factory = ConnFactory::new(
            "127.0.0.1:1".to_string(),
            Duration::from_secs(1),
            None,
            1,
            false,
        )
        .await
        .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            factory.dial(&cancel).await,
            Err(ClientError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_probe_resolve() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let resolved = probe_resolve_tcp(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resolved, addr.to_string());
    }
}
