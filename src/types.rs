//! Core data types for slimlink.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Audio container/codec tag carried in stream directives and the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatTag {
    Mp3,
    Flac,
    Pcm,
    Ogg,
    Aac,
    Alac,
    Opus,
    /// A format byte this client has no name for. Bytes that have a named
    /// variant are never carried here and are refused on encode.
    Other(u8),
}

impl FormatTag {
    pub fn as_byte(self) -> u8 {
        match self {
            FormatTag::Mp3 => b'm',
            FormatTag::Flac => b'f',
            FormatTag::Pcm => b'p',
            FormatTag::Ogg => b'o',
            FormatTag::Aac => b'a',
            FormatTag::Alac => b'l',
            FormatTag::Opus => b'u',
            FormatTag::Other(b) => b,
        }
    }
}

impl From<u8> for FormatTag {
    fn from(value: u8) -> Self {
        match value {
            b'm' => FormatTag::Mp3,
            b'f' => FormatTag::Flac,
            b'p' => FormatTag::Pcm,
            b'o' => FormatTag::Ogg,
            b'a' => FormatTag::Aac,
            b'l' => FormatTag::Alac,
            b'u' => FormatTag::Opus,
            other => FormatTag::Other(other),
        }
    }
}

/// Stream directive sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamCode {
    Start,
    Pause,
    Unpause,
    Stop,
    StatusQuery,
}

impl StreamCode {
    pub fn as_byte(self) -> u8 {
        match self {
            StreamCode::Start => b's',
            StreamCode::Pause => b'p',
            StreamCode::Unpause => b'u',
            StreamCode::Stop => b'q',
            StreamCode::StatusQuery => b't',
        }
    }

    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            b's' => Some(StreamCode::Start),
            b'p' => Some(StreamCode::Pause),
            b'u' => Some(StreamCode::Unpause),
            b'q' => Some(StreamCode::Stop),
            b't' => Some(StreamCode::StatusQuery),
            _ => None,
        }
    }
}

/// Kind of status report sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Heartbeat,
    Connected,
    Started,
    Paused,
    Resumed,
    Flushed,
    Disconnected,
}

impl StatusKind {
    /// Four-character event code used on the wire.
    pub fn code(self) -> &'static [u8; 4] {
        match self {
            StatusKind::Heartbeat => b"STMt",
            StatusKind::Connected => b"STMc",
            StatusKind::Started => b"STMs",
            StatusKind::Paused => b"STMp",
            StatusKind::Resumed => b"STMr",
            StatusKind::Flushed => b"STMf",
            StatusKind::Disconnected => b"STMn",
        }
    }

    pub fn from_code(code: &[u8]) -> Option<Self> {
        match code {
            b"STMt" => Some(StatusKind::Heartbeat),
            b"STMc" => Some(StatusKind::Connected),
            b"STMs" => Some(StatusKind::Started),
            b"STMp" => Some(StatusKind::Paused),
            b"STMr" => Some(StatusKind::Resumed),
            b"STMf" => Some(StatusKind::Flushed),
            b"STMn" => Some(StatusKind::Disconnected),
            _ => None,
        }
    }
}

/// Opaque identity of the track a stream belongs to.
///
/// Derived from the stream URL; two `Start` directives for the same URL
/// refer to the same track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TrackId(Arc<str>);

impl TrackId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The stream currently owned by the playback state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSession {
    pub track_id: TrackId,
    pub format: FormatTag,
    pub declared_duration: Option<Duration>,
    pub is_playing: bool,
}

/// What caused a recovery snapshot to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryTrigger {
    Pause,
    Backgrounded,
    Disconnect,
    RouteChange,
    Stall,
    Suspend,
    Interruption,
}

/// Persisted playlist position used to reposition the server after a discontinuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub playlist_index: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub position: Duration,
    /// Wall-clock milliseconds since the Unix epoch.
    pub saved_at: u64,
    pub trigger: RecoveryTrigger,
    pub was_playing: bool,
}

impl RecoverySnapshot {
    /// Whether the snapshot may still be acted on at `now_ms`.
    pub fn is_fresh(&self, now_ms: u64, grace: Duration) -> bool {
        now_ms.saturating_sub(self.saved_at) < grace.as_millis() as u64
    }
}

/// Wall-clock source for snapshot timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The host system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// A manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(AtomicU64::new(start_ms))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Get current time in milliseconds since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_bytes_map_both_ways() {
        for tag in [
            FormatTag::Mp3,
            FormatTag::Flac,
            FormatTag::Pcm,
            FormatTag::Ogg,
            FormatTag::Aac,
            FormatTag::Alac,
            FormatTag::Opus,
        ] {
            assert_eq!(FormatTag::from(tag.as_byte()), tag);
        }
        assert_eq!(FormatTag::from(b'z'), FormatTag::Other(b'z'));
    }

    #[test]
    fn track_id_is_keyed_by_url() {
        let a = TrackId::new("http://s/a.flac");
        let b = a.clone();
        assert_eq!(a, TrackId::new(String::from("http://s/a.flac")));
        assert_eq!(b.as_str(), "http://s/a.flac");
        assert_eq!(a.to_string(), "http://s/a.flac");
        assert_ne!(a, TrackId::new("http://s/b.flac"));
    }

    #[test]
    fn status_codes_are_distinct() {
        let kinds = [
            StatusKind::Heartbeat,
            StatusKind::Connected,
            StatusKind::Started,
            StatusKind::Paused,
            StatusKind::Resumed,
            StatusKind::Flushed,
            StatusKind::Disconnected,
        ];
        for k in kinds {
            assert_eq!(StatusKind::from_code(k.code()), Some(k));
        }
        assert_eq!(StatusKind::from_code(b"STMx"), None);
    }

    #[test]
    fn snapshot_grace_window_edges() {
        let grace = Duration::from_secs(300);
        let snap = RecoverySnapshot {
            playlist_index: 2,
            position: Duration::from_secs(45),
            saved_at: 1_000_000,
            trigger: RecoveryTrigger::Pause,
            was_playing: false,
        };
        assert!(snap.is_fresh(1_000_000 + 300_000 - 1, grace));
        assert!(!snap.is_fresh(1_000_000 + 300_000 + 1, grace));
    }
}
