//! Length-prefixed frame codec shared by the client listener and the TLC
//! client.
//!
//! Wire format, 5 bytes of overhead per frame:
//!
//! ```text
//! [u8: protocol version][u32 BE: payload_len][payload bytes]
//! ```
//!
//! The decoder is stateful to support partial reception; payloads come out
//! as zero-copy [`Bytes`] slices of the receive buffer.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

const HEADER_SIZE: usize = 1 + 4;

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    AwaitingHeader,
    AwaitingPayload { len: u32 },
}

/// Frame codec parameterized by the expected protocol version byte.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    version: u8,
    state: DecodeState,
}

impl EnvelopeCodec {
    pub fn new(version: u8) -> Self {
        Self {
            version,
            state: DecodeState::AwaitingHeader,
        }
    }

    fn check_len(len: u32) -> io::Result<()> {
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
            ));
        }
        Ok(())
    }
}

/// Error raised when the peer speaks a different protocol version.
///
/// Mapped to `-EPROTONOSUPPORT` at the router; the connection stays open.
#[derive(Debug)]
pub struct VersionMismatch {
    pub received: u8,
    pub expected: u8,
}

impl std::fmt::Display for VersionMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unsupported protocol version {} (expected {})",
            self.received, self.expected
        )
    }
}

impl std::error::Error for VersionMismatch {}

impl Decoder for EnvelopeCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let version = src[0];
                    if version != self.version {
                        // Leave the buffer consumed past the bad frame
                        // header so the caller can answer and keep the
                        // connection; resynchronization is the peer's
                        // problem.
                        src.advance(1);
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            VersionMismatch {
                                received: version,
                                expected: self.version,
                            },
                        ));
                    }
                    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
                    Self::check_len(len)?;
                    src.advance(HEADER_SIZE);
                    self.state = DecodeState::AwaitingPayload { len };
                }
                DecodeState::AwaitingPayload { len } => {
                    if src.len() < len as usize {
                        return Ok(None);
                    }
                    let payload = src.split_to(len as usize).freeze();
                    self.state = DecodeState::AwaitingHeader;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

impl Encoder<Bytes> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = payload.len() as u32;
        Self::check_len(len)?;
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(self.version);
        dst.put_u32(len);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_buf(codec: &mut EnvelopeCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_round_trip() {
        let mut codec = EnvelopeCodec::new(0x01);
        let mut buf = encode_to_buf(&mut codec, b"payload-bytes");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"payload-bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_layout() {
        let mut codec = EnvelopeCodec::new(0x01);
        let buf = encode_to_buf(&mut codec, b"abc");
        assert_eq!(buf[0], 0x01);
        assert_eq!(u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]), 3);
        assert_eq!(&buf[5..], b"abc");
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = EnvelopeCodec::new(0x01);
        let full = encode_to_buf(&mut codec, b"partial-payload");

        let mut buf = BytesMut::from(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..HEADER_SIZE + 4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[HEADER_SIZE + 4..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"partial-payload");
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = EnvelopeCodec::new(0x01);
        let mut buf = encode_to_buf(&mut codec, b"first");
        buf.extend_from_slice(&encode_to_buf(&mut codec, b"second"));

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_version_mismatch() {
        let mut codec = EnvelopeCodec::new(0x01);
        let mut wrong = EnvelopeCodec::new(0x02);
        let mut buf = encode_to_buf(&mut wrong, b"v2-payload");

        let err = codec.decode(&mut buf).unwrap_err();
        let inner = err.get_ref().expect("inner error");
        assert!(inner.downcast_ref::<VersionMismatch>().is_some());
        assert!(inner.to_string().contains("unsupported protocol version"));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = EnvelopeCodec::new(0x01);
        let mut buf = BytesMut::new();
        buf.put_u8(0x01);
        buf.put_u32(MAX_FRAME_SIZE + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = EnvelopeCodec::new(0x01);
        let mut buf = encode_to_buf(&mut codec, b"");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(decoded.is_empty());
    }
}
