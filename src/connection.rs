// ABOUTME: Frame-at-a-time I/O over the control channel's transport
// ABOUTME: Reads the length prefix, reads exactly that many bytes, and decodes the tagged body

use crate::codec::{self, CodecError, Message};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Anything a `ControlLink` or `DataStream` can be built on: an ordered, reliable byte-stream.
/// `TcpStream` is the only real implementor used outside tests; `tokio::io::duplex` halves
/// satisfy it for in-memory loopback tests.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Transport for T {}

/// One failed frame read: either the transport ended cleanly with no partial frame pending
/// (`Eof`), or it produced bytes that don't parse as a frame (`Codec`), or the transport itself
/// errored (`Io`). All three are fatal to the enclosing `ControlLink`'s frame loop.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("control transport closed")]
    Eof,
    #[error("control transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
}

/// Read exactly one frame off `reader`: a 4-byte big-endian length, then that many bytes,
/// decoded as a [`Message`]. A length read that hits EOF with zero bytes consumed is reported
/// as a clean `ReadError::Eof`; any other truncation is an `io::Error` from `read_exact`.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ReadError> {
    let mut len_buf = [0u8; 4];
    let n = reader.read(&mut len_buf[..1]).await?;
    if n == 0 {
        return Err(ReadError::Eof);
    }
    reader.read_exact(&mut len_buf[1..]).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(codec::decode_frame(&body)?)
}

/// Write one frame to `writer` and flush it. Flushing here (rather than relying on the caller)
/// keeps every write atomic from the reader's point of view, since writers share one
/// `ControlLink` under a single mutex (see [`crate::control_link::ControlLink`]).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> std::io::Result<()> {
    let frame: Bytes = codec::encode_frame(msg);
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    #[tokio::test]
    async fn round_trips_a_message_through_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let msg = Message::TunnelDisconnectRequest { peer_handle: 42 };

        write_message(&mut a, &msg).await.unwrap();
        let decoded = read_message(&mut b).await.unwrap();

        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn clean_close_before_any_bytes_is_eof() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, ReadError::Eof));
    }

    #[tokio::test]
    async fn close_mid_frame_is_an_io_error_not_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10]).await.unwrap();
        drop(a);

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, ReadError::Io(_)));
    }
}
