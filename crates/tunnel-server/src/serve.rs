//! Accept loop for the byte-stream listener

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::ServerHandler;

/// Accept connections forever, driving the optional TLS handshake and
/// spawning one handler task per connection.
///
/// Returns only when the listener itself fails. TLS accept failures are
/// logged and do not affect the loop.
pub async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<ServerHandler>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    loop {
        let (conn, peer) = listener.accept().await?;
        let handler = handler.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(conn).await {
                    Ok(tls) => {
                        let client_cert_verified =
                            tls.get_ref().1.peer_certificates().is_some();
                        handler.handle(tls, peer, client_cert_verified).await;
                    }
                    Err(e) => warn!("TLS accept from {} failed: {}", peer, e),
                },
                None => handler.handle(conn, peer, false).await,
            }
        });
    }
}
