//! Tokio codec framing packets over a byte stream.
//!
//! The decoder keeps partial frames in the read buffer and remembers how far
//! it has already scanned, so a frame trickling in over many reads is searched
//! for its terminator only once per byte.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{FRAME_TERMINATOR, MAX_FRAME_SIZE};
use crate::core::packet::{find_terminator, Packet};
use crate::error::{ProtocolError, Result};

/// Terminator-delimited JSON frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Bytes of the read buffer already known to hold no terminator
    scanned: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scanned: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        // A terminator may straddle the previous scan boundary
        let start = self
            .scanned
            .saturating_sub(FRAME_TERMINATOR.len() - 1)
            .min(src.len());

        match find_terminator(&src[start..]) {
            Some(offset) => {
                let end = start + offset;
                self.scanned = 0;

                if end > self.max_frame_size {
                    return Err(ProtocolError::OversizedFrame(end));
                }

                let frame = src.split_to(end);
                src.advance(FRAME_TERMINATOR.len());
                Packet::from_payload(&frame).map(Some)
            }
            None => {
                // A maximal payload may already be followed by a partial terminator
                if src.len() > self.max_frame_size + FRAME_TERMINATOR.len() - 1 {
                    return Err(ProtocolError::OversizedFrame(src.len()));
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::OversizedFrame(payload.len()));
        }

        dst.reserve(payload.len() + FRAME_TERMINATOR.len());
        dst.put_slice(&payload);
        dst.put_slice(FRAME_TERMINATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Body;
    use std::net::SocketAddr;

    fn ping(port: u16) -> Packet {
        let host = SocketAddr::from(([127, 0, 0, 1], port));
        Packet::new(None, host, None, host, Body::Ping)
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let mut codec = FrameCodec::default();
        let bytes = ping(1).to_bytes().unwrap();
        let (head, tail) = bytes.split_at(bytes.len() - 1);

        let mut buf = BytesMut::from(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), head.len());

        buf.extend_from_slice(tail);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(ping(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_several_frames_in_order() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for port in 1..=3 {
            codec.encode(ping(port), &mut buf).unwrap();
        }

        for port in 1..=3 {
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(ping(port)));
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unterminated_oversized_input_rejected() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&[b'x'; 32][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedFrame(32))
        ));
    }

    #[test]
    fn test_encode_respects_limit() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(ping(1), &mut buf),
            Err(ProtocolError::OversizedFrame(_))
        ));
        assert!(buf.is_empty());
    }
}
