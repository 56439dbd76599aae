//! Audio engine interface.
//!
//! The engine fetches and plays a URL; it has no protocol awareness. Calls
//! return once the engine has acted, which is what the playback state
//! machine treats as confirmation. Asynchronous happenings (audible start,
//! stalls, end of stream) come back as [`EngineEvent`]s on the channel
//! created by [`channel`].

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::AudioEngineError;
use crate::msg::Gain;
use crate::types::FormatTag;

/// Identifies one stream started with [`AudioEngine::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

/// Audio output driven by the playback state machine.
pub trait AudioEngine: Send + Sync {
    /// Start fetching and playing `url` from `start_offset`.
    fn begin(
        &self,
        url: &str,
        start_offset: Duration,
        format: FormatTag,
    ) -> Result<EngineHandle, AudioEngineError>;

    fn pause(&self, handle: EngineHandle) -> Result<(), AudioEngineError>;

    fn resume(&self, handle: EngineHandle) -> Result<(), AudioEngineError>;

    fn stop(&self, handle: EngineHandle) -> Result<(), AudioEngineError>;

    /// Apply a server gain update. Engines without software gain ignore it.
    fn set_gain(&self, _gain: Gain) {}
}

/// Something the engine observed about a stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    /// Audio is audible.
    PlaybackStarted,
    /// Buffer underrun; output stopped.
    Stalled,
    /// Data flows again after a stall.
    FlowResumed,
    /// End of stream reached.
    Ended,
    Error(AudioEngineError),
    /// Engine's own elapsed time. Advisory: used for stall detection only.
    ElapsedTick(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub handle: EngineHandle,
    pub kind: EngineEventKind,
}

/// Sender half given to the engine implementation.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEvents {
    /// Report an event. Returns `false` once the session has shut down.
    pub fn send(&self, handle: EngineHandle, kind: EngineEventKind) -> bool {
        self.tx.send(EngineEvent { handle, kind }).is_ok()
    }
}

/// Create the engine event channel.
pub fn channel() -> (EngineEvents, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EngineEvents { tx }, rx)
}
