//! Events flowing between the session and its host.
//!
//! - [`SessionEvent`] - what the session tells the presentation layer
//! - [`LifecycleEvent`] - what the host platform tells the session
//! - [`DisplayState`] - a snapshot for rendering

use std::time::Duration;

use bytes::Bytes;

use crate::connection::ConnectionState;
use crate::msg::Gain;
use crate::playback::PlaybackState;
use crate::recovery::RecoveryMode;
use crate::types::{PlaybackSession, RecoverySnapshot, TrackId};

// ============================================================================
// Session Events (session -> host)
// ============================================================================

/// Notifications from a running session.
///
/// Handle what you need, ignore the rest.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SessionEvent {
    /// The control connection changed state.
    ConnectionChanged(ConnectionState),

    /// Reconnect attempts are exhausted. The session stays disconnected
    /// until [`SessionCoordinator::reconnect`](crate::SessionCoordinator::reconnect).
    ConnectionLost { attempts: u32 },

    /// A new stream was handed to the audio engine.
    TrackStarted { session: PlaybackSession },

    /// The playback state machine moved.
    PlaybackChanged(PlaybackState),

    /// The current stream failed and was torn down.
    StreamFailed { track_id: TrackId, reason: String },

    /// Server volume update.
    GainChanged(Gain),

    /// The server renamed this player.
    PlayerRenamed(String),

    /// A setting the session does not interpret itself.
    Setting { id: u16, payload: Bytes },

    /// A recovery sequence repositioned the server.
    RecoveryCompleted {
        mode: RecoveryMode,
        snapshot: RecoverySnapshot,
    },

    /// The session task exited.
    SessionClosed,
}

// ============================================================================
// Lifecycle (host -> session)
// ============================================================================

/// Platform lifecycle and audio-route notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// App moved to the background. Heartbeats slow down.
    Backgrounded,
    Foregrounded,
    /// Process is about to be suspended.
    Suspended,
    /// Process resumed after suspension. The connection may be stale.
    Resumed,
    /// Audio route changed; `paused_playback` is set when the platform
    /// stopped output (e.g. headphones unplugged).
    RouteChanged { paused_playback: bool },
    InterruptionBegan,
    InterruptionEnded { should_resume: bool },
}

// ============================================================================
// Display State
// ============================================================================

/// What the presentation layer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    /// Current stream, if any.
    pub session: Option<PlaybackSession>,
    pub playback: PlaybackState,
    /// Interpolated position.
    pub position: Duration,
    pub is_playing: bool,
    pub connection: ConnectionState,
}
