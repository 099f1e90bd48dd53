//! Symmetric duplex copy between a framed stream and a datagram socket

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use wire_proto::{DGRAM_BUF, DGRAM_LEN_BYTES};

/// Shuttle datagrams between the two sides until one terminates.
///
/// The first side to exit ends the bridge; the caller tears down the
/// stream, while the socket is shared with other bridges of the same
/// session and stays open until its endpoint refcount drops.
pub async fn bridge<R, W>(stream_rd: R, stream_wr: W, socket: Arc<UdpSocket>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        res = stream_to_dgram(stream_rd, &socket) => {
            if let Err(e) = res {
                debug!("stream to datagram side ended: {}", e);
            }
        }
        res = dgram_to_stream(stream_wr, &socket) => {
            if let Err(e) = res {
                debug!("datagram to stream side ended: {}", e);
            }
        }
    }
}

async fn stream_to_dgram<R>(mut stream: R, socket: &UdpSocket) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; DGRAM_BUF];
    loop {
        let len = wire_proto::read_frame(&mut stream, &mut buf).await?;
        let n = socket.send(&buf[..len]).await?;
        if n != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short datagram write",
            ));
        }
    }
}

async fn dgram_to_stream<W>(mut stream: W, socket: &UdpSocket) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Buffer layout [len:2][data], datagrams landing at offset
    // DGRAM_LEN_BYTES, so the length prefix and the payload go out in a
    // single write.
    let mut buf = vec![0u8; DGRAM_BUF];
    loop {
        let len = socket.recv(&mut buf[DGRAM_LEN_BYTES..]).await?;
        buf[..DGRAM_LEN_BYTES].copy_from_slice(&(len as u16).to_be_bytes());
        stream.write_all(&buf[..DGRAM_LEN_BYTES + len]).await?;
    }
}
