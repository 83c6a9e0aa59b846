// ABOUTME: Wire framing for the tunnel's control protocol, length-prefixed, tagged messages
// ABOUTME: Separates the byte-level encoding from the message values and the connection that carries them

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// One of the seven control-protocol message variants, already separated from its length
/// prefix and type tag by the caller (see [`crate::connection::read_message`]).
///
/// Address fields (`proxy_address`, `client_address`, `tunnel_address`) are opaque byte
/// strings on the wire, not guaranteed to be valid UTF-8 by the protocol, so they are kept
/// as [`Bytes`] here rather than `String`. Callers that need a hostname convert at the point
/// of use.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Sent by the connector once its control connection is up: "expose
    /// `proxy_address:proxy_port` to the public Internet".
    ListenRequest { proxy_address: Bytes, proxy_port: u32 },

    /// The listener's reply once it has bound an ephemeral public port.
    ListenResponse {
        proxy_address: Bytes,
        proxy_port: u32,
        tunnel_address: Bytes,
        tunnel_port: u32,
    },

    /// Sent by the listener when a public client connects: "dial the target and pair it with
    /// my stream `data_handle`". `client_address` is carried on the wire for compatibility;
    /// unused by either peer.
    TunnelConnectRequest {
        data_handle: u32,
        client_address: Bytes,
        proxy_address: Bytes,
        proxy_port: u32,
    },

    /// The connector's reply: "I dialed the target; my stream is `proxy_handle`, pair it with
    /// your `data_handle`".
    TunnelConnectResponse { data_handle: u32, proxy_handle: u32 },

    /// One chunk of application bytes, addressed to the *receiver's own* handle for the
    /// stream (i.e. the sender's `peer_handle`, per the DataStream attribute of the same name).
    TunnelDataIndication { peer_handle: u32, data: Bytes },

    /// "Close the stream you know as `peer_handle`; I already have." No reply obligation beyond
    /// the one `TunnelDisconnectResponse`.
    TunnelDisconnectRequest { peer_handle: u32 },

    /// Acknowledges a `TunnelDisconnectRequest`, or a locally observed close, addressed the
    /// same way.
    TunnelDisconnectResponse { peer_handle: u32 },
}

impl Message {
    /// The single-byte type tag this message encodes as on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            Message::ListenRequest { .. } => 1,
            Message::ListenResponse { .. } => 2,
            Message::TunnelConnectRequest { .. } => 3,
            Message::TunnelConnectResponse { .. } => 4,
            Message::TunnelDataIndication { .. } => 5,
            Message::TunnelDisconnectRequest { .. } => 6,
            Message::TunnelDisconnectResponse { .. } => 7,
        }
    }
}

/// Framing/parsing failures. Every variant is fatal to the enclosing `ControlLink`. There is
/// no partial-recovery path once a frame fails to decode (classified as `MalformedFrame`).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown frame type tag {0:#x}")]
    UnknownTag(u8),

    #[error("frame body truncated: needed {needed} more byte(s)")]
    Truncated { needed: usize },

    #[error("frame body has {0} trailing byte(s) after the message")]
    TrailingBytes(usize),
}

fn put_bytes_field(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn get_u32(buf: &mut Cursor<&[u8]>) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated {
            needed: 4 - buf.remaining(),
        });
    }
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut Cursor<&[u8]>, len: usize) -> Result<Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(buf.copy_to_bytes(len))
}

/// Reads a length-prefixed, opaque byte-string field: a 4-byte byte count followed by the raw
/// bytes. No encoding is assumed or validated; a non-UTF-8 address is not a framing error.
fn get_bytes_field(buf: &mut Cursor<&[u8]>) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    get_bytes(buf, len)
}

fn get_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::Truncated { needed: 1 });
    }
    Ok(buf.get_u8())
}

/// Encode `msg` as a complete frame: 4-byte big-endian length, 1-byte tag, body. `length`
/// counts the tag byte plus the body, never itself.
pub fn encode_frame(msg: &Message) -> Bytes {
    let mut body = BytesMut::new();
    match msg {
        Message::ListenRequest {
            proxy_address,
            proxy_port,
        } => {
            put_bytes_field(&mut body, proxy_address);
            body.put_u32(*proxy_port);
        }
        Message::ListenResponse {
            proxy_address,
            proxy_port,
            tunnel_address,
            tunnel_port,
        } => {
            put_bytes_field(&mut body, proxy_address);
            body.put_u32(*proxy_port);
            put_bytes_field(&mut body, tunnel_address);
            body.put_u32(*tunnel_port);
        }
        Message::TunnelConnectRequest {
            data_handle,
            client_address,
            proxy_address,
            proxy_port,
        } => {
            body.put_u32(*data_handle);
            put_bytes_field(&mut body, client_address);
            put_bytes_field(&mut body, proxy_address);
            body.put_u32(*proxy_port);
        }
        Message::TunnelConnectResponse {
            data_handle,
            proxy_handle,
        } => {
            body.put_u32(*data_handle);
            body.put_u32(*proxy_handle);
        }
        Message::TunnelDataIndication { peer_handle, data } => {
            body.put_u32(*peer_handle);
            body.put_u32(data.len() as u32);
            body.put_slice(data);
        }
        Message::TunnelDisconnectRequest { peer_handle } => {
            body.put_u32(*peer_handle);
        }
        Message::TunnelDisconnectResponse { peer_handle } => {
            body.put_u32(*peer_handle);
        }
    }

    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u32(1 + body.len() as u32);
    out.put_u8(msg.tag());
    out.put(body);
    out.freeze()
}

/// Decode a `Message` from `payload`, which must be exactly the tag byte followed by the body
/// (the 4-byte length prefix has already been consumed and used to size this slice by the
/// caller). Fails if the tag is unrecognized, a field runs past the end of `payload`, or bytes
/// remain once the message's own fields are fully read.
pub fn decode_frame(payload: &[u8]) -> Result<Message, CodecError> {
    let mut cur = Cursor::new(payload);
    let tag = get_u8(&mut cur)?;

    let msg = match tag {
        1 => Message::ListenRequest {
            proxy_address: get_bytes_field(&mut cur)?,
            proxy_port: get_u32(&mut cur)?,
        },
        2 => Message::ListenResponse {
            proxy_address: get_bytes_field(&mut cur)?,
            proxy_port: get_u32(&mut cur)?,
            tunnel_address: get_bytes_field(&mut cur)?,
            tunnel_port: get_u32(&mut cur)?,
        },
        3 => Message::TunnelConnectRequest {
            data_handle: get_u32(&mut cur)?,
            client_address: get_bytes_field(&mut cur)?,
            proxy_address: get_bytes_field(&mut cur)?,
            proxy_port: get_u32(&mut cur)?,
        },
        4 => Message::TunnelConnectResponse {
            data_handle: get_u32(&mut cur)?,
            proxy_handle: get_u32(&mut cur)?,
        },
        5 => {
            let peer_handle = get_u32(&mut cur)?;
            let byte_count = get_u32(&mut cur)? as usize;
            let data = get_bytes(&mut cur, byte_count)?;
            Message::TunnelDataIndication { peer_handle, data }
        }
        6 => Message::TunnelDisconnectRequest {
            peer_handle: get_u32(&mut cur)?,
        },
        7 => Message::TunnelDisconnectResponse {
            peer_handle: get_u32(&mut cur)?,
        },
        other => return Err(CodecError::UnknownTag(other)),
    };

    if cur.has_remaining() {
        return Err(CodecError::TrailingBytes(cur.remaining()));
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_listen_request_exact_bytes() {
        let msg = Message::ListenRequest {
            proxy_address: Bytes::from_static(b"www.google.com"),
            proxy_port: 443,
        };
        let encoded = encode_frame(&msg);

        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x00, 0x17]);
        assert_eq!(encoded[4], 0x01);
        assert_eq!(&encoded[5..9], &[0x00, 0x00, 0x00, 0x0E]);
        assert_eq!(&encoded[9..23], b"www.google.com".as_slice());
        assert_eq!(&encoded[23..27], &[0x00, 0x00, 0x01, 0xBB]);
        assert_eq!(encoded.len(), 27);
    }

    fn round_trip(msg: Message) {
        let encoded = encode_frame(&msg);
        let len = u32::from_be_bytes(encoded[0..4].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 4);
        let decoded = decode_frame(&encoded[4..]).expect("decode");
        assert_eq!(msg, decoded);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::ListenRequest {
            proxy_address: Bytes::from_static(b"example.test"),
            proxy_port: 80,
        });
        round_trip(Message::ListenResponse {
            proxy_address: Bytes::from_static(b"example.test"),
            proxy_port: 80,
            tunnel_address: Bytes::from_static(b"0.0.0.0"),
            tunnel_port: 51000,
        });
        round_trip(Message::TunnelConnectRequest {
            data_handle: 7,
            client_address: Bytes::from_static(b"0.0.0.0"),
            proxy_address: Bytes::from_static(b"example.test"),
            proxy_port: 80,
        });
        round_trip(Message::TunnelConnectResponse {
            data_handle: 7,
            proxy_handle: 9,
        });
        round_trip(Message::TunnelDataIndication {
            peer_handle: 9,
            data: Bytes::from_static(b"PING"),
        });
        round_trip(Message::TunnelDisconnectRequest { peer_handle: 7 });
        round_trip(Message::TunnelDisconnectResponse { peer_handle: 9 });
    }

    #[test]
    fn round_trips_empty_data_indication() {
        round_trip(Message::TunnelDataIndication {
            peer_handle: 1,
            data: Bytes::new(),
        });
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let payload = [9u8, 0, 0, 0, 0];
        let err = decode_frame(&payload).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(9)));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let msg = Message::TunnelDisconnectRequest { peer_handle: 1 };
        let mut encoded = encode_frame(&msg).to_vec();
        encoded.push(0xFF);
        // Drop the length prefix the way the connection layer would before decoding, but
        // leave the stray trailing byte in the payload passed to decode_frame.
        let payload = &encoded[4..];
        let err = decode_frame(payload).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes(1)));
    }

    #[test]
    fn truncated_body_is_malformed() {
        let payload = [1u8, 0, 0, 0, 100, b'a', b'b']; // claims a 100-byte string, has 2
        let err = decode_frame(&payload).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn non_utf8_address_decodes_as_raw_bytes_not_malformed() {
        let mut payload = vec![1u8]; // tag = ListenRequest
        payload.extend_from_slice(&2u32.to_be_bytes()); // string len = 2
        payload.extend_from_slice(&[0xFF, 0xFE]); // not valid utf-8, still a legal byte string
        payload.extend_from_slice(&443u32.to_be_bytes());

        let msg = decode_frame(&payload).expect("non-utf8 address bytes must decode cleanly");
        match msg {
            Message::ListenRequest { proxy_address, proxy_port } => {
                assert_eq!(&proxy_address[..], &[0xFF, 0xFE]);
                assert_eq!(proxy_port, 443);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
