//! Length-prefixed framing for Noise messages on a byte stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "DVSH"
//! - 4 bytes: body length (big-endian)
//! - N bytes: body (one Noise handshake or transport message)
//!
//! [`FrameCodec`] implements the `tokio_util` codec traits so a transport can
//! be wrapped in `FramedRead`/`FramedWrite`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::noise::MAX_NOISE_MESSAGE_SIZE;

/// Magic bytes identifying a devshell frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DVSH";

/// Frame header size: 4 (magic) + 4 (length).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest body a frame may carry: exactly one Noise message.
pub const MAX_FRAME_BODY: usize = MAX_NOISE_MESSAGE_SIZE;

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_body: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec accepting bodies up to [`MAX_FRAME_BODY`].
    pub fn new() -> Self {
        Self {
            max_body: MAX_FRAME_BODY,
        }
    }

    /// Create a codec with a smaller body limit.
    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            max_body: max_body.min(MAX_FRAME_BODY),
        }
    }

    /// Encode one body into a complete frame.
    pub fn encode_frame(&self, body: &[u8]) -> Result<Vec<u8>> {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        self.write_frame(body, &mut out)?;
        Ok(out.to_vec())
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns `None` if `data` does not yet hold a whole frame, otherwise the
    /// body and the number of bytes consumed.
    pub fn decode_frame(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        let Some(len) = self.peek_length(data)? else {
            return Ok(None);
        };
        if data.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        let body = data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        Ok(Some((body, FRAME_HEADER_SIZE + len)))
    }

    fn write_frame(&self, body: &[u8], dst: &mut BytesMut) -> Result<()> {
        if body.len() > self.max_body {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: self.max_body,
            });
        }
        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u32(body.len() as u32);
        dst.put_slice(body);
        Ok(())
    }

    /// Validates the header and returns the body length, if a header is present.
    fn peek_length(&self, data: &[u8]) -> Result<Option<usize>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [data[0], data[1], data[2], data[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if len > self.max_body {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_body,
            });
        }
        Ok(Some(len))
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(len) = self.peek_length(src)? else {
            src.reserve(FRAME_HEADER_SIZE);
            return Ok(None);
        };

        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Vec<u8>, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&body, dst)
    }
}
