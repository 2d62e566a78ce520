//! Length-prefixed JSON framing.
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed` for async transports.
//! [`FrameBuffer`] exposes the same decoding for callers that receive raw
//! chunks themselves.

use crate::error::ProtocolError;
use crate::messages::WireMessage;
use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Frames larger than this are rejected unless the codec is configured
/// otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Serialize `message` into a complete frame (prefix + payload).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Codec decoding frames into `M` and encoding any serializable value.
///
/// The decoder drains every complete frame already buffered before reporting
/// that it needs more input; a partial frame stays in the buffer untouched.
#[derive(Debug)]
pub struct FrameCodec<M> {
    max_frame_len: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> FrameCodec<M> {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            _message: PhantomData,
        }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl<M> Default for FrameCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for FrameCodec<M> {
    fn clone(&self) -> Self {
        Self::with_max_frame_len(self.max_frame_len)
    }
}

impl<M: WireMessage> Decoder for FrameCodec<M> {
    type Item = M;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, ProtocolError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len);
        M::from_slice(&payload).map(Some)
    }
}

impl<M, T: Serialize> Encoder<T> for FrameCodec<M> {
    type Error = ProtocolError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > self.max_frame_len || payload.len() > u32::MAX as usize {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Accumulates raw chunks and yields decoded messages as frames complete.
#[derive(Debug)]
pub struct FrameBuffer<M> {
    codec: FrameCodec<M>,
    buffer: BytesMut,
}

impl<M: WireMessage> FrameBuffer<M> {
    pub fn new() -> Self {
        Self {
            codec: FrameCodec::new(),
            buffer: BytesMut::new(),
        }
    }

    /// Append one delivery from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete message, or `None` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<M>, ProtocolError> {
        self.codec.decode(&mut self.buffer)
    }

    /// Every complete message currently buffered.
    pub fn drain(&mut self) -> Result<Vec<M>, ProtocolError> {
        let mut out = Vec::new();
        while let Some(message) = self.next_message()? {
            out.push(message);
        }
        Ok(out)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl<M: WireMessage> Default for FrameBuffer<M> {
    fn default() -> Self {
        Self::new()
    }
}
