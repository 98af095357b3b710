//! Framed codec for the dlex wire protocol.
//!
//! Frame layout: 4-byte big-endian protocol version, 4-byte big-endian
//! payload length, then a JSON payload. Works over any AsyncRead/AsyncWrite
//! (anonymous pipes, unix sockets).

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Version word carried in every frame header. A peer speaking any other
/// version is treated as corrupt and the connection is dropped.
pub const PROTOCOL_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;

/// Ceiling on the declared payload length. A corrupt header otherwise turns
/// into an unbounded allocation.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Errors raised while framing or deframing the wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The stream closed with a partial frame still buffered.
    #[error("stream closed mid-frame with {buffered} byte(s) pending")]
    TruncatedFrame { buffered: usize },

    #[error("frame of {length} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { length: usize },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec that frames one serializable message type per frame.
pub struct MessageCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> MessageCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for MessageCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = T;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = u32::from_be_bytes(src[0..4].try_into().expect("4-byte slice"));
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }

        let length = u32::from_be_bytes(src[4..8].try_into().expect("4-byte slice")) as usize;
        if length > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { length });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length);
        let item = serde_json::from_slice(&payload)?;
        Ok(Some(item))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            // An empty buffer at EOF is the peer's orderly shutdown.
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::TruncatedFrame {
                buffered: src.len(),
            }),
        }
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec<T> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { length: json.len() });
        }
        tracing::trace!(payload_bytes = json.len(), "encoding frame");

        dst.reserve(HEADER_LEN + json.len());
        dst.put_u32(PROTOCOL_VERSION);
        dst.put_u32(json.len() as u32);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RpcMessage;
    use serde_json::{Map, json};

    fn encode_to_bytes<T: Serialize>(item: T) -> BytesMut {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(item, &mut buf).unwrap();
        buf
    }

    #[test]
    fn roundtrip_value() {
        let mut codec = MessageCodec::<serde_json::Value>::new();
        let value = json!({"lr": 0.01, "layers": [64, 64], "name": "mlp"});

        let mut buf = encode_to_bytes(value.clone());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, value);
        assert!(buf.is_empty());
    }

    #[test]
    fn set_loss_call_has_exact_wire_bytes() {
        let call = RpcMessage::Call {
            method: "set_loss".to_string(),
            args: vec![json!(1)],
            kwargs: Map::new(),
        };
        let buf = encode_to_bytes(call.clone());

        let payload = br#"["rpc","set_loss",[1],{}]"#;
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]);
        assert_eq!(&buf[4..8], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&buf[8..], payload);

        let mut codec = MessageCodec::<RpcMessage>::new();
        let mut buf = buf;
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn version_mismatch_is_rejected_before_payload() {
        let mut buf = encode_to_bytes(json!("ok"));
        buf[0..4].copy_from_slice(&2u32.to_be_bytes());

        let mut codec = MessageCodec::<serde_json::Value>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::VersionMismatch {
                expected: 1,
                found: 2
            }
        ));
    }

    #[test]
    fn partial_header_waits_for_more_bytes() {
        let mut codec = MessageCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 1, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn eof_mid_frame_is_truncated() {
        let full = encode_to_bytes(json!([1, 2, 3]));
        let mut buf = BytesMut::from(&full[..full.len() - 2]);

        let mut codec = MessageCodec::<serde_json::Value>::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::TruncatedFrame { .. }));
    }

    #[test]
    fn eof_with_empty_buffer_is_clean() {
        let mut codec = MessageCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(PROTOCOL_VERSION);
        buf.put_u32(u32::MAX);

        let mut codec = MessageCodec::<serde_json::Value>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn frames_decode_one_at_a_time() {
        let mut codec = MessageCodec::<serde_json::Value>::new();
        let mut buf = encode_to_bytes(json!(1));
        buf.extend_from_slice(&encode_to_bytes(json!(2)));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!(1));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), json!(2));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
