//! Typed protocol commands and their body layouts.
//!
//! Every body is `[tag: 4 ASCII bytes] [payload]`; integers are big-endian.
//! Commands are decoded once at the boundary and all internal code works
//! on [`Command`], never on raw payloads.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::Frame;
use crate::error::DispatchError;
use crate::types::{FormatTag, StatusKind, StreamCode};
use crate::Error;

/// Command tags.
pub mod tag {
    /// Client handshake.
    pub const HANDSHAKE: [u8; 4] = *b"HELO";
    /// Stream control directive.
    pub const STREAM: [u8; 4] = *b"strm";
    /// Player setting request/response.
    pub const SETTING: [u8; 4] = *b"setd";
    /// Output gain.
    pub const GAIN: [u8; 4] = *b"audg";
    /// Client status report.
    pub const STATUS: [u8; 4] = *b"STAT";
}

/// Capability set announced once per physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub device_id: [u8; 16],
    /// Set when this connection replaces an earlier one in the same process.
    pub reconnect: bool,
    pub model: String,
    pub name: String,
    pub formats: Vec<FormatTag>,
}

/// Server stream control instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDirective {
    pub code: StreamCode,
    pub url: Option<String>,
    pub format: FormatTag,
    pub start_offset: Duration,
}

/// Per-channel output gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gain {
    pub left: f32,
    pub right: f32,
}

/// Status report sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub kind: StatusKind,
    pub position: Duration,
}

impl StatusReport {
    pub fn new(kind: StatusKind, position: Duration) -> Self {
        Self { kind, position }
    }
}

/// A decoded protocol command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Client -> server.
    Handshake { capabilities: Capabilities },
    /// Server -> client.
    StreamDirective(StreamDirective),
    /// Server -> client; the client answers name queries with the same tag.
    SettingRequest { id: u16, payload: Bytes },
    /// Server -> client.
    GainUpdate(Gain),
    /// Client -> server.
    StatusReport(StatusReport),
}

impl Command {
    pub fn tag(&self) -> [u8; 4] {
        match self {
            Command::Handshake { .. } => tag::HANDSHAKE,
            Command::StreamDirective(_) => tag::STREAM,
            Command::SettingRequest { .. } => tag::SETTING,
            Command::GainUpdate(_) => tag::GAIN,
            Command::StatusReport(_) => tag::STATUS,
        }
    }

    /// Serialize to a frame body (tag + payload).
    ///
    /// Fails when a field does not fit its length prefix, or when a
    /// format byte that has a named variant is carried as `Other`.
    pub fn encode_body(&self) -> crate::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(&self.tag());
        match self {
            Command::Handshake { capabilities: c } => {
                buf.put_slice(&c.device_id);
                buf.put_u8(c.reconnect as u8);
                put_short_str(&mut buf, &c.model, "model")?;
                put_short_str(&mut buf, &c.name, "name")?;
                let count = u8::try_from(c.formats.len()).map_err(|_| {
                    Error::Protocol(format!("{} formats exceed 255", c.formats.len()))
                })?;
                buf.put_u8(count);
                for f in &c.formats {
                    buf.put_u8(format_byte(*f)?);
                }
            }
            Command::StreamDirective(d) => {
                buf.put_u8(d.code.as_byte());
                buf.put_u8(format_byte(d.format)?);
                buf.put_u32(millis_u32(d.start_offset));
                let url = d.url.as_deref().unwrap_or("");
                let len = u16::try_from(url.len()).map_err(|_| {
                    Error::Protocol(format!("url of {} bytes exceeds 65535", url.len()))
                })?;
                buf.put_u16(len);
                buf.put_slice(url.as_bytes());
            }
            Command::SettingRequest { id, payload } => {
                buf.put_u16(*id);
                buf.put_slice(payload);
            }
            Command::GainUpdate(g) => {
                buf.put_f32(g.left);
                buf.put_f32(g.right);
            }
            Command::StatusReport(r) => {
                buf.put_slice(r.kind.code());
                buf.put_u32(millis_u32(r.position));
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a frame into a command.
    pub fn decode(frame: &Frame) -> Result<Self, DispatchError> {
        let Some(tag) = frame.tag() else {
            return Err(DispatchError::Payload {
                tag: [0; 4],
                reason: format!("body of {} bytes has no tag", frame.length()),
            });
        };
        let payload = frame.payload();
        let mut r = Reader::new(tag, &payload);

        let cmd = match tag {
            tag::HANDSHAKE => {
                let device_id: [u8; 16] = r
                    .bytes(16, "device id")?
                    .try_into()
                    .map_err(|_| r.fail("device id"))?;
                let reconnect = r.u8("reconnect flag")? != 0;
                let model = r.short_str("model")?;
                let name = r.short_str("name")?;
                let count = r.u8("format count")? as usize;
                let formats = r
                    .bytes(count, "formats")?
                    .iter()
                    .map(|&b| FormatTag::from(b))
                    .collect();
                Command::Handshake {
                    capabilities: Capabilities {
                        device_id,
                        reconnect,
                        model,
                        name,
                        formats,
                    },
                }
            }
            tag::STREAM => {
                let raw = r.u8("code")?;
                let code = StreamCode::from_byte(raw)
                    .ok_or_else(|| r.fail(&format!("stream code {:?}", raw as char)))?;
                let format = FormatTag::from(r.u8("format")?);
                let start_offset = Duration::from_millis(r.u32("start offset")? as u64);
                let url_len = r.u16("url length")? as usize;
                let url = r.string(url_len, "url")?;
                Command::StreamDirective(StreamDirective {
                    code,
                    url: (!url.is_empty()).then_some(url),
                    format,
                    start_offset,
                })
            }
            tag::SETTING => {
                let id = r.u16("setting id")?;
                Command::SettingRequest {
                    id,
                    payload: payload.slice(2..),
                }
            }
            tag::GAIN => {
                let left = f32::from_bits(r.u32("left gain")?);
                let right = f32::from_bits(r.u32("right gain")?);
                if !left.is_finite() || !right.is_finite() {
                    return Err(r.fail("non-finite gain"));
                }
                Command::GainUpdate(Gain { left, right })
            }
            tag::STATUS => {
                let code = r.bytes(4, "event code")?;
                let kind = StatusKind::from_code(code).ok_or_else(|| {
                    r.fail(&format!("event code {}", String::from_utf8_lossy(code)))
                })?;
                let position = Duration::from_millis(r.u32("position")? as u64);
                Command::StatusReport(StatusReport { kind, position })
            }
            other => return Err(DispatchError::UnknownCommand(other)),
        };
        Ok(cmd)
    }
}

fn millis_u32(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn format_byte(format: FormatTag) -> crate::Result<u8> {
    let byte = format.as_byte();
    if let FormatTag::Other(_) = format
        && FormatTag::from(byte) != format
    {
        return Err(Error::Protocol(format!(
            "format byte {:?} must use its named variant",
            byte as char
        )));
    }
    Ok(byte)
}

fn put_short_str(buf: &mut BytesMut, s: &str, what: &str) -> crate::Result<()> {
    let len = u8::try_from(s.len())
        .map_err(|_| Error::Protocol(format!("{what} of {} bytes exceeds 255", s.len())))?;
    buf.put_u8(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked payload reader.
struct Reader<'a> {
    tag: [u8; 4],
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(tag: [u8; 4], data: &'a [u8]) -> Self {
        Self { tag, data }
    }

    fn fail(&self, what: &str) -> DispatchError {
        DispatchError::Payload {
            tag: self.tag,
            reason: what.to_string(),
        }
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8], DispatchError> {
        if self.data.len() < n {
            return Err(self.fail(&format!(
                "truncated {what}: need {n}, have {}",
                self.data.len()
            )));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> Result<u8, DispatchError> {
        Ok(self.bytes(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, DispatchError> {
        let b = self.bytes(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, DispatchError> {
        let b = self.bytes(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self, n: usize, what: &str) -> Result<String, DispatchError> {
        let b = self.bytes(n, what)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| self.fail(&format!("{what} is not UTF-8")))
    }

    fn short_str(&mut self, what: &str) -> Result<String, DispatchError> {
        let n = self.u8(what)? as usize;
        self.string(n, what)
    }
}
