//! Milter wire codec — Decoder / Encoder for `tokio_util::codec::Framed`.
//!
//! Framing is a 4-byte big-endian unsigned payload length followed by
//! exactly that many payload bytes. The decoder buffers partial input
//! across reads and yields one opaque payload per complete frame; command
//! interpretation happens one layer up.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::definitions::{BASE_LEN_BYTES, MAX_DATA_SIZE};
use crate::error::MilterError;

/// Stateless codec for milter packets.
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = MilterError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need the full length prefix to proceed.
        if src.len() < BASE_LEN_BYTES {
            return Ok(None);
        }

        let mut prefix = [0u8; BASE_LEN_BYTES];
        prefix.copy_from_slice(&src[..BASE_LEN_BYTES]);
        let payload_len = u32::from_be_bytes(prefix) as usize;

        if payload_len == 0 || payload_len > MAX_DATA_SIZE {
            return Err(MilterError::ProtocolViolationPacket(format!(
                "invalid packet data length {payload_len} (boundaries: > 0, <= {MAX_DATA_SIZE})"
            )));
        }

        let total = BASE_LEN_BYTES + payload_len;
        if src.len() < total {
            // Reserve capacity to avoid repeated allocations.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(BASE_LEN_BYTES);
        Ok(Some(src.split_to(payload_len).freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = MilterError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.is_empty() || payload.len() > MAX_DATA_SIZE {
            return Err(MilterError::ProtocolViolationPacket(format!(
                "refusing to encode payload of length {}",
                payload.len()
            )));
        }
        dst.reserve(BASE_LEN_BYTES + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Encode a single payload into a standalone framed packet.
pub fn encode_payload(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(BASE_LEN_BYTES + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn decode_requires_full_length_prefix() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0u8; 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_slice(b"ab");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"cde");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"abcde"[..]);
    }

    #[test]
    fn decode_rejects_zero_length() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, MilterError::ProtocolViolationPacket(_)));
    }

    #[test]
    fn decode_accepts_length_one() {
        let mut codec = PacketCodec;
        let mut buf = frame(b"Q");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"Q"[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_accepts_max_length() {
        let mut codec = PacketCodec;
        let payload = vec![b'B'; MAX_DATA_SIZE];
        let mut buf = frame(&payload);
        let out = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(out.len(), MAX_DATA_SIZE);
    }

    #[test]
    fn decode_rejects_over_max_length() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_DATA_SIZE + 1) as u32);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, MilterError::ProtocolViolationPacket(_)));
    }

    #[test]
    fn decode_emits_pipelined_frames_in_order() {
        let mut codec = PacketCodec;
        let mut buf = frame(b"A");
        buf.unsplit(frame(b"Q"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"A"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"Q"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn framing_roundtrip() {
        let mut codec = PacketCodec;
        let payload = Bytes::from_static(b"O\x00\x00\x00\x06");
        let mut buf = BytesMut::new();
        codec.encode(payload.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn encode_rejects_empty_payload() {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        assert!(codec.encode(Bytes::new(), &mut buf).is_err());
    }

    #[test]
    fn encode_payload_prefixes_length() {
        let packet = encode_payload(b"c");
        assert_eq!(&packet[..], b"\x00\x00\x00\x01c");
    }
}
