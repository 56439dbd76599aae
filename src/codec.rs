//! Length-prefixed framing for the control connection.
//!
//! Frame format: `[length: u32 BE] [body: length bytes]`, where the body
//! starts with a 4-byte ASCII command tag. The length excludes itself and
//! is never zero.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::msg::Command;
use crate::{Error, Result};

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest body accepted. Anything larger means the stream is out of sync.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    body: Bytes,
}

impl Frame {
    /// Wrap a body. Fails if the body is empty or over [`MAX_FRAME_LEN`].
    pub fn new(body: impl Into<Bytes>) -> Result<Self> {
        let body = body.into();
        let len = body.len() as u32;
        if body.is_empty() || body.len() > MAX_FRAME_LEN as usize {
            return Err(Error::MalformedFrame { len });
        }
        Ok(Self { body })
    }

    /// Declared length: the exact byte count of the body.
    pub fn length(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The 4-byte command tag, if the body is long enough to hold one.
    pub fn tag(&self) -> Option<[u8; 4]> {
        self.body.get(..4).and_then(|t| t.try_into().ok())
    }

    /// Body bytes following the tag.
    pub fn payload(&self) -> Bytes {
        if self.body.len() >= 4 {
            self.body.slice(4..)
        } else {
            Bytes::new()
        }
    }

    /// Serialize with its length prefix.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + self.body.len());
        buf.put_u32(self.length());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Encode a command into a complete wire frame.
///
/// A body over [`MAX_FRAME_LEN`] is refused rather than sent, since the
/// peer would drop the connection on it.
pub fn encode(cmd: &Command) -> Result<Bytes> {
    let body = cmd.encode_body()?;
    if body.len() > MAX_FRAME_LEN as usize {
        let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
        warn!(len, max = MAX_FRAME_LEN, "TX: Frame too large");
        return Err(Error::MalformedFrame { len });
    }
    trace!(tag = %String::from_utf8_lossy(&body[..4]), len = body.len(), "TX: Frame");
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode the first frame in `buffer`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and
/// the unconsumed rest of the buffer. A zero or oversized length is
/// `MalformedFrame`; the caller must reconnect rather than resynchronize.
pub fn decode(buffer: &[u8]) -> Result<Option<(Frame, &[u8])>> {
    let Some(prefix) = buffer.get(..LEN_PREFIX) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    check_len(len)?;

    let end = LEN_PREFIX + len as usize;
    if buffer.len() < end {
        return Ok(None);
    }
    let frame = Frame {
        body: Bytes::copy_from_slice(&buffer[LEN_PREFIX..end]),
    };
    Ok(Some((frame, &buffer[end..])))
}

fn check_len(len: u32) -> Result<()> {
    if len == 0 || len > MAX_FRAME_LEN {
        warn!(len, max = MAX_FRAME_LEN, "RX: Invalid frame length");
        return Err(Error::MalformedFrame { len });
    }
    Ok(())
}

/// Accumulating receive buffer.
///
/// Bytes from successive reads are appended; complete frames are split off
/// the front without copying.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Split the next complete frame off the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        check_len(len)?;
        if self.buf.len() < LEN_PREFIX + len as usize {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        let body = self.buf.split_to(len as usize).freeze();
        trace!(len, "RX: Frame");
        Ok(Some(Frame { body }))
    }
}
