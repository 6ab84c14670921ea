//! Wire framing for channel transports.
//!
//! Frame format: `[metadataLen:4][metadata:N][bodyLen:4][body:M]`, with
//! both length prefixes big-endian u32. Metadata and body are opaque byte
//! sections produced independently by the channel's codec; the framing
//! layer adds no compression and no checksum; integrity is the
//! transport's responsibility.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of one length prefix in bytes.
pub const SECTION_LEN_SIZE: usize = 4;

/// Default upper bound for a single metadata or body section (16 MiB).
///
/// Frames claiming more are rejected to prevent memory exhaustion from a
/// corrupt or hostile peer.
pub const DEFAULT_MAX_SECTION_SIZE: usize = 16 * 1024 * 1024;

/// Wire framing error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    /// A section length prefix exceeds the configured bound.
    #[error("frame section too large: {size} bytes (max {max})")]
    SectionTooLarge {
        /// Claimed section size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// One decoded frame: metadata and body sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Metadata section (message class, session, content type, ...).
    pub metadata: Bytes,
    /// Body section (the payload proper).
    pub body: Bytes,
}

impl Frame {
    /// Build a frame from owned sections.
    pub fn new(metadata: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            metadata: metadata.into(),
            body: body.into(),
        }
    }

    /// Total encoded size of the frame, prefixes included.
    pub fn encoded_len(&self) -> usize {
        2 * SECTION_LEN_SIZE + self.metadata.len() + self.body.len()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.metadata.len() as u32);
        buf.put_slice(&self.metadata);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
    }

    /// Encode the frame to a fresh byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame;
    /// the caller keeps buffering and retries after the next read. On
    /// success the frame's bytes are consumed from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::SectionTooLarge`] when a length prefix
    /// exceeds `max_section`; the stream is desynchronized beyond
    /// recovery at that point and the channel must close.
    pub fn decode(buf: &mut BytesMut, max_section: usize) -> Result<Option<Frame>, FrameError> {
        // Peek both length prefixes without consuming, so a partial
        // frame leaves the buffer untouched.
        if buf.len() < SECTION_LEN_SIZE {
            return Ok(None);
        }
        let metadata_len = read_len(&buf[0..SECTION_LEN_SIZE]);
        if metadata_len > max_section {
            return Err(FrameError::SectionTooLarge {
                size: metadata_len,
                max: max_section,
            });
        }
        let body_len_at = SECTION_LEN_SIZE + metadata_len;
        if buf.len() < body_len_at + SECTION_LEN_SIZE {
            return Ok(None);
        }
        let body_len = read_len(&buf[body_len_at..body_len_at + SECTION_LEN_SIZE]);
        if body_len > max_section {
            return Err(FrameError::SectionTooLarge {
                size: body_len,
                max: max_section,
            });
        }
        let total = body_len_at + SECTION_LEN_SIZE + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(SECTION_LEN_SIZE);
        let metadata = buf.split_to(metadata_len).freeze();
        buf.advance(SECTION_LEN_SIZE);
        let body = buf.split_to(body_len).freeze();
        Ok(Some(Frame { metadata, body }))
    }
}

fn read_len(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::from(&frame.encode()[..]);
        Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE)
            .expect("decode should succeed")
            .expect("frame should be complete")
    }

    #[test]
    fn test_roundtrip_simple() {
        let frame = Frame::new(&b"meta"[..], &b"body"[..]);
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn test_roundtrip_empty_sections() {
        let frame = Frame::new(Bytes::new(), Bytes::new());
        assert_eq!(roundtrip(&frame), frame);
        assert_eq!(frame.encoded_len(), 8);
    }

    #[test]
    fn test_roundtrip_randomized_binary() {
        for i in 0..16 {
            let metadata: Vec<u8> = (0..(i * 37) % 256).map(|_| rand::random()).collect();
            let body: Vec<u8> = (0..(i * 251) % 4096).map(|_| rand::random()).collect();
            let frame = Frame::new(metadata, body);
            assert_eq!(roundtrip(&frame), frame);
        }
    }

    #[test]
    fn test_length_prefixes_are_big_endian() {
        let frame = Frame::new(&b"ab"[..], &b"xyz"[..]);
        let encoded = frame.encode();
        assert_eq!(&encoded[0..4], &[0, 0, 0, 2]);
        assert_eq!(&encoded[4..6], b"ab");
        assert_eq!(&encoded[6..10], &[0, 0, 0, 3]);
        assert_eq!(&encoded[10..13], b"xyz");
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let frame = Frame::new(&b"metadata"[..], &b"body bytes"[..]);
        let encoded = frame.encode();

        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE)
                .expect("decode should not error");
            if i + 1 < encoded.len() {
                assert!(decoded.is_none(), "byte {i} should not complete the frame");
            } else {
                assert_eq!(decoded.expect("final byte completes the frame"), frame);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let first = Frame::new(&b"m1"[..], &b"b1"[..]);
        let second = Frame::new(&b"m2"[..], &b"b2"[..]);
        let mut buf = BytesMut::new();
        first.encode_into(&mut buf);
        second.encode_into(&mut buf);

        let one = Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE)
            .expect("decode")
            .expect("first frame");
        let two = Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE)
            .expect("decode")
            .expect("second frame");
        assert_eq!(one, first);
        assert_eq!(two, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_section_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let result = Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE);
        assert!(matches!(result, Err(FrameError::SectionTooLarge { .. })));
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xaa);
        buf.put_u32((DEFAULT_MAX_SECTION_SIZE + 1) as u32);
        let result = Frame::decode(&mut buf, DEFAULT_MAX_SECTION_SIZE);
        assert!(matches!(result, Err(FrameError::SectionTooLarge { .. })));
    }
}
