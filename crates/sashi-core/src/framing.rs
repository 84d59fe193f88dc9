//! Length-prefixed frame codec for daemon socket replies.
//!
//! Outbound daemon messages carry an 8-byte header: a 4-byte big-endian
//! length followed by 4 reserved bytes. The reserved bytes are written
//! as zeros and ignored on receive. Inbound requests are raw JSON (no
//! header) and are read by the server in a single receive, so only the
//! reply direction goes through this codec.
//!
//! The codec validates the announced length against [`MAX_MESSAGE_SIZE`]
//! before allocating.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum message size in either direction (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Length of the frame header: 4 length bytes + 4 reserved bytes.
pub const HEADER_LEN: usize = 8;

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The announced or supplied payload exceeds the size cap.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge {
        /// Announced or actual payload size.
        size: usize,
        /// The configured cap.
        max: usize,
    },

    /// Underlying transport error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frame codec for the daemon reply channel.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with the protocol-wide 1 MiB cap.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Codec with a custom cap, for tests.
    #[must_use]
    pub const fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Length is the first four bytes; the remaining four are
        // reserved and deliberately not inspected.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before allocating.
        if length > self.max_size {
            return Err(FrameError::TooLarge {
                size: length,
                max: self.max_size,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > self.max_size {
            return Err(FrameError::TooLarge {
                size: item.len(),
                max: self.max_size,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by max_size
        dst.put_u32(item.len() as u32);
        dst.put_u32(0); // reserved
        dst.extend_from_slice(item);
        Ok(())
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        self.encode(item.as_ref(), dst)
    }
}

/// Frame a message for the reply channel without going through a
/// [`tokio_util::codec::Framed`] wrapper. Used by synchronous clients.
#[must_use]
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&b"{\"type\":\"list_res\"}"[..], &mut buf).unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 19]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 0]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"{\"type\":\"list_res\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_needs_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 5, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn partial_body_needs_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 0, 0, 0, 0, b'x'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn reserved_bytes_ignored_on_receive() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_u32(0xdead_beef); // nonzero reserved bytes from a peer
        buf.extend_from_slice(b"ok");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"ok");
    }

    #[test]
    fn oversized_announcement_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2 * 1024 * 1024);
        buf.put_u32(0);
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { size, max })
                if size == 2 * 1024 * 1024 && max == MAX_MESSAGE_SIZE
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_send() {
        let mut codec = FrameCodec::with_max_size(8);
        let mut buf = BytesMut::new();
        assert!(codec.encode(&[0u8; 16][..], &mut buf).is_err());
    }

    #[test]
    fn frame_message_matches_codec() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&b"abc"[..], &mut buf).unwrap();
        assert_eq!(frame_message(b"abc"), buf.to_vec());
    }
}
