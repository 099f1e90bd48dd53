//! Length-prefixed datagram framing
//!
//! A frame is a 2-byte big-endian payload length followed by exactly that
//! many payload bytes. Frames are contiguous on the stream; there is no
//! other header.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{DGRAM_LEN_BYTES, MAX_DGRAM_LEN, WireError, WireResult};

/// Encode one datagram payload into a length-prefixed frame.
///
/// Payloads longer than [`MAX_DGRAM_LEN`] cannot be framed and are rejected
/// before they ever reach a send queue.
pub fn encode(payload: &[u8]) -> WireResult<Bytes> {
    if payload.len() > MAX_DGRAM_LEN {
        return Err(WireError::Oversize {
            size: payload.len(),
            max: MAX_DGRAM_LEN,
        });
    }
    let mut frame = BytesMut::with_capacity(DGRAM_LEN_BYTES + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Read one frame from `stream`, placing the payload at the start of `buf`.
///
/// Returns the payload length. `buf` must hold at least [`MAX_DGRAM_LEN`]
/// bytes. A short read on either the length prefix or the payload is
/// terminal for the stream and surfaces as `UnexpectedEof`.
pub async fn read_frame<R>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut lenbuf = [0u8; DGRAM_LEN_BYTES];
    stream.read_exact(&mut lenbuf).await?;
    let len = u16::from_be_bytes(lenbuf) as usize;
    stream.read_exact(&mut buf[..len]).await?;
    Ok(len)
}
