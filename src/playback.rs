//! Playback state machine.
//!
//! Translates stream directives and audio-engine events into engine calls,
//! anchor updates and upstream status reports. It never touches the
//! network: everything it wants sent or done is queued as an [`Output`]
//! and drained by the session runner.
//!
//! ```text
//!            Start            PlaybackStarted
//!   Idle ───────────▶ Starting ───────────▶ Playing ◀──┐
//!    ▲                   │                  │  ▲  │    │ FlowResumed
//!    │ Stop / error      │            Pause │  │  │    │
//!    │ / stall expiry    │                  ▼  │  ▼    │
//!    └───────────────────┴──────────────── Paused   Stalled
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{AudioEngine, EngineEvent, EngineEventKind, EngineHandle};
use crate::error::AudioEngineError;
use crate::event::SessionEvent;
use crate::msg::{Command, StatusReport, StreamDirective};
use crate::timesync::TimeSync;
use crate::types::{PlaybackSession, RecoveryTrigger, StatusKind, StreamCode, TrackId};

/// Consecutive non-advancing elapsed ticks treated as a stall.
const FLAT_TICKS_FOR_STALL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Starting,
    Playing,
    Paused,
    Stalled,
}

/// Work produced by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Send upstream if connected; dropped otherwise.
    Send(Command),
    /// Write a recovery snapshot.
    Snapshot(RecoveryTrigger),
    /// The server has moved on; any stored snapshot no longer applies.
    ClearSnapshot,
    /// Forward to the presentation layer.
    Event(SessionEvent),
}

pub struct PlaybackMachine {
    engine: Arc<dyn AudioEngine>,
    time: TimeSync,
    state: PlaybackState,
    session: Option<PlaybackSession>,
    handle: Option<EngineHandle>,
    stall_window: Duration,
    stalled_since: Option<Instant>,
    last_elapsed: Option<Duration>,
    flat_ticks: u8,
    /// `STMs` already sent for the current stream.
    started_reported: bool,
    outputs: Vec<Output>,
}

impl PlaybackMachine {
    pub fn new(engine: Arc<dyn AudioEngine>, stall_window: Duration) -> Self {
        Self {
            engine,
            time: TimeSync::new(),
            state: PlaybackState::Idle,
            session: None,
            handle: None,
            stall_window,
            stalled_since: None,
            last_elapsed: None,
            flat_ticks: 0,
            started_reported: false,
            outputs: Vec::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn time(&self) -> &TimeSync {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut TimeSync {
        &mut self.time
    }

    pub fn position(&self) -> Duration {
        self.time.current_position()
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackState::Playing
    }

    /// Drain queued outputs in the order they were produced.
    pub fn take_outputs(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    /// When an unresolved stall becomes fatal.
    pub fn stall_deadline(&self) -> Option<Instant> {
        self.stalled_since.map(|t| t + self.stall_window)
    }

    // ------------------------------------------------------------------
    // Server directives
    // ------------------------------------------------------------------

    pub fn handle_directive(&mut self, directive: StreamDirective) {
        debug!(code = ?directive.code, "Stream directive");
        match directive.code {
            StreamCode::Start => self.start(directive),
            StreamCode::Pause => self.pause(),
            StreamCode::Unpause => self.unpause(),
            StreamCode::Stop => self.stop(),
            StreamCode::StatusQuery => {
                let position = self.position();
                self.report(StatusKind::Heartbeat, position);
            }
        }
    }

    fn start(&mut self, directive: StreamDirective) {
        let previous = self.position();
        self.teardown();
        // Old session is gone whether or not the new one starts.
        self.report(StatusKind::Flushed, previous);
        self.outputs.push(Output::ClearSnapshot);

        let Some(url) = directive.url.filter(|u| !u.is_empty()) else {
            warn!("Start directive without URL");
            self.report(StatusKind::Disconnected, Duration::ZERO);
            self.set_state(PlaybackState::Idle);
            return;
        };
        let track_id = TrackId::new(&url);

        match self
            .engine
            .begin(&url, directive.start_offset, directive.format)
        {
            Ok(handle) => {
                info!(track = %track_id, format = ?directive.format, offset_ms = directive.start_offset.as_millis() as u64, "Stream starting");
                let session = PlaybackSession {
                    track_id: track_id.clone(),
                    format: directive.format,
                    declared_duration: None,
                    is_playing: false,
                };
                self.handle = Some(handle);
                self.session = Some(session.clone());
                self.time
                    .update_from_server(directive.start_offset, false, track_id);
                self.outputs
                    .push(Output::Event(SessionEvent::TrackStarted { session }));
                self.set_state(PlaybackState::Starting);
            }
            Err(e) => {
                warn!(track = %track_id, error = %e, "Engine refused stream");
                self.time.clear();
                self.report(StatusKind::Disconnected, directive.start_offset);
                self.outputs.push(Output::Event(SessionEvent::StreamFailed {
                    track_id,
                    reason: e.to_string(),
                }));
                self.set_state(PlaybackState::Idle);
            }
        }
    }

    fn pause(&mut self) {
        let Some(handle) = self.handle else {
            debug!("Pause with no stream");
            return;
        };
        if !matches!(
            self.state,
            PlaybackState::Playing | PlaybackState::Starting | PlaybackState::Stalled
        ) {
            debug!(state = ?self.state, "Pause ignored");
            return;
        }
        match self.engine.pause(handle) {
            Ok(()) => {
                self.enter_paused();
                let position = self.position();
                self.report(StatusKind::Paused, position);
                self.outputs.push(Output::Snapshot(RecoveryTrigger::Pause));
            }
            Err(e) => self.fail_stream(e),
        }
    }

    fn unpause(&mut self) {
        let Some(handle) = self.handle else {
            debug!("Unpause with no stream");
            return;
        };
        if self.state != PlaybackState::Paused {
            debug!(state = ?self.state, "Unpause ignored");
            return;
        }
        match self.engine.resume(handle) {
            Ok(()) => {
                self.enter_playing();
                let position = self.position();
                self.report(StatusKind::Resumed, position);
                self.outputs.push(Output::ClearSnapshot);
            }
            Err(e) => self.fail_stream(e),
        }
    }

    fn stop(&mut self) {
        let position = self.position();
        self.teardown();
        self.time.freeze_or_resume(false);
        self.report(StatusKind::Flushed, position);
        self.outputs.push(Output::ClearSnapshot);
        self.set_state(PlaybackState::Idle);
    }

    // ------------------------------------------------------------------
    // Local control
    // ------------------------------------------------------------------

    /// Pause without a server directive (route change, offline user pause).
    ///
    /// Returns whether playback was actually paused.
    pub fn pause_locally(&mut self) -> bool {
        let Some(handle) = self.handle else {
            return false;
        };
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Stalled) {
            return false;
        }
        match self.engine.pause(handle) {
            Ok(()) => {
                self.enter_paused();
                let position = self.position();
                self.report(StatusKind::Paused, position);
                true
            }
            Err(e) => {
                self.fail_stream(e);
                false
            }
        }
    }

    /// Resume without a server directive. Returns whether playback resumed.
    pub fn resume_locally(&mut self) -> bool {
        let Some(handle) = self.handle else {
            return false;
        };
        if self.state != PlaybackState::Paused {
            return false;
        }
        match self.engine.resume(handle) {
            Ok(()) => {
                self.enter_playing();
                let position = self.position();
                self.report(StatusKind::Resumed, position);
                true
            }
            Err(e) => {
                self.fail_stream(e);
                false
            }
        }
    }

    /// Stop the engine for session shutdown. No report is queued.
    pub fn shutdown(&mut self) {
        self.teardown();
        self.time.freeze_or_resume(false);
        self.set_state(PlaybackState::Idle);
        self.outputs.retain(|o| !matches!(o, Output::Send(_)));
    }

    // ------------------------------------------------------------------
    // Engine events
    // ------------------------------------------------------------------

    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        if self.handle != Some(event.handle) {
            debug!(handle = event.handle.0, kind = ?event.kind, "Event for stale stream");
            return;
        }
        match event.kind {
            EngineEventKind::PlaybackStarted => match self.state {
                PlaybackState::Starting => {
                    self.enter_playing();
                    self.report_started();
                }
                PlaybackState::Stalled => self.end_stall(),
                // Paused (or already resumed) before the first audio.
                _ if !self.started_reported => self.report_started(),
                _ => {}
            },
            EngineEventKind::Stalled => self.begin_stall(),
            EngineEventKind::FlowResumed => {
                if self.state == PlaybackState::Stalled {
                    self.end_stall();
                }
            }
            EngineEventKind::Ended => {
                info!("Stream ended");
                let position = self.position();
                self.teardown();
                self.time.freeze_or_resume(false);
                self.report(StatusKind::Flushed, position);
                self.set_state(PlaybackState::Idle);
            }
            EngineEventKind::Error(e) => self.fail_stream(e),
            EngineEventKind::ElapsedTick(elapsed) => self.observe_elapsed(elapsed),
        }
    }

    /// Expire an unresolved stall. Emits `Disconnected` at most once per stall.
    pub fn check_stall(&mut self, now: Instant) {
        if self.state != PlaybackState::Stalled {
            return;
        }
        if self.stall_deadline().is_some_and(|deadline| now >= deadline) {
            warn!(window_ms = self.stall_window.as_millis() as u64, "Stall unresolved");
            self.fail_stream(AudioEngineError::Stalled);
        }
    }

    fn observe_elapsed(&mut self, elapsed: Duration) {
        if self.state != PlaybackState::Playing {
            self.last_elapsed = Some(elapsed);
            self.flat_ticks = 0;
            return;
        }
        match self.last_elapsed {
            Some(last) if elapsed <= last => {
                self.flat_ticks += 1;
                if self.flat_ticks >= FLAT_TICKS_FOR_STALL {
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "Engine clock not advancing");
                    self.begin_stall();
                }
            }
            _ => self.flat_ticks = 0,
        }
        self.last_elapsed = Some(elapsed);
    }

    fn begin_stall(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        warn!("Stream stalled");
        self.time.freeze_or_resume(false);
        self.stalled_since = Some(Instant::now());
        self.flat_ticks = 0;
        self.set_state(PlaybackState::Stalled);
        self.outputs.push(Output::Snapshot(RecoveryTrigger::Stall));
    }

    fn end_stall(&mut self) {
        info!("Stall resolved");
        self.enter_playing();
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn enter_playing(&mut self) {
        self.stalled_since = None;
        self.flat_ticks = 0;
        self.time.freeze_or_resume(true);
        if let Some(session) = self.session.as_mut() {
            session.is_playing = true;
        }
        self.set_state(PlaybackState::Playing);
    }

    fn enter_paused(&mut self) {
        self.stalled_since = None;
        self.time.freeze_or_resume(false);
        if let Some(session) = self.session.as_mut() {
            session.is_playing = false;
        }
        self.set_state(PlaybackState::Paused);
    }

    /// Tear down the current stream and report it lost.
    fn fail_stream(&mut self, error: AudioEngineError) {
        let position = self.position();
        let track_id = self.session.as_ref().map(|s| s.track_id.clone());
        warn!(error = %error, "Stream failed");
        self.teardown();
        self.time.freeze_or_resume(false);
        self.report(StatusKind::Disconnected, position);
        if let Some(track_id) = track_id {
            self.outputs.push(Output::Event(SessionEvent::StreamFailed {
                track_id,
                reason: error.to_string(),
            }));
        }
        self.set_state(PlaybackState::Idle);
    }

    /// Stop the engine stream, if any, and forget the session.
    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = self.engine.stop(handle)
        {
            debug!(handle = handle.0, error = %e, "Engine stop failed");
        }
        self.session = None;
        self.stalled_since = None;
        self.last_elapsed = None;
        self.flat_ticks = 0;
        self.started_reported = false;
    }

    fn report_started(&mut self) {
        self.started_reported = true;
        let position = self.position();
        self.report(StatusKind::Started, position);
    }

    fn report(&mut self, kind: StatusKind, position: Duration) {
        self.outputs.push(Output::Send(Command::StatusReport(StatusReport::new(
            kind, position,
        ))));
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Playback state");
            self.state = state;
            self.outputs
                .push(Output::Event(SessionEvent::PlaybackChanged(state)));
        }
    }
}
