//! Routing of decoded frames to their handlers.
//!
//! Each inbound frame is decoded into a [`Command`] and handed to exactly
//! one [`CommandHandler`] method. Unknown tags and undecodable payloads
//! are logged and dropped; neither ends the connection.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::codec::Frame;
use crate::error::DispatchError;
use crate::msg::{Command, Gain, StreamDirective};

/// Receiver of server commands.
pub trait CommandHandler {
    fn on_stream_directive(&mut self, directive: StreamDirective);

    fn on_setting_request(&mut self, id: u16, payload: Bytes);

    fn on_gain_update(&mut self, gain: Gain);
}

/// Counters for inbound traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub unknown: u64,
    pub malformed: u64,
}

/// Frame router. Keeps counts of what it has seen.
#[derive(Debug, Default)]
pub struct Dispatcher {
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Decode `frame` and route it. Errors are informational: the frame
    /// has already been dropped and the caller should carry on.
    pub fn dispatch<H: CommandHandler + ?Sized>(
        &mut self,
        frame: &Frame,
        handler: &mut H,
    ) -> Result<(), DispatchError> {
        let result = dispatch(frame, handler);
        match &result {
            Ok(()) => self.stats.dispatched += 1,
            Err(DispatchError::UnknownCommand(_)) => self.stats.unknown += 1,
            Err(DispatchError::Payload { .. }) => self.stats.malformed += 1,
        }
        result
    }
}

/// Decode `frame` and route it to `handler`.
pub fn dispatch<H: CommandHandler + ?Sized>(
    frame: &Frame,
    handler: &mut H,
) -> Result<(), DispatchError> {
    let cmd = match Command::decode(frame) {
        Ok(cmd) => cmd,
        Err(e @ DispatchError::UnknownCommand(_)) => {
            debug!(len = frame.length(), "RX: {e}, dropping");
            return Err(e);
        }
        Err(e) => {
            warn!(len = frame.length(), "RX: {e}, dropping");
            return Err(e);
        }
    };

    match cmd {
        Command::StreamDirective(directive) => {
            debug!(
                code = ?directive.code,
                format = ?directive.format,
                offset_ms = directive.start_offset.as_millis() as u64,
                url = directive.url.as_deref().unwrap_or(""),
                "RX: strm"
            );
            handler.on_stream_directive(directive);
        }
        Command::SettingRequest { id, payload } => {
            debug!(id, len = payload.len(), "RX: setd");
            handler.on_setting_request(id, payload);
        }
        Command::GainUpdate(gain) => {
            debug!(left = gain.left, right = gain.right, "RX: audg");
            handler.on_gain_update(gain);
        }
        // Client-to-server commands echoed back have no meaning here.
        other @ (Command::Handshake { .. } | Command::StatusReport(_)) => {
            let tag = other.tag();
            debug!(tag = %String::from_utf8_lossy(&tag), "RX: Upstream-only command, dropping");
            return Err(DispatchError::UnknownCommand(tag));
        }
    }
    Ok(())
}
