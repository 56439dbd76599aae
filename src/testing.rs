//! Fakes for the session's collaborators.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::DuplexStream;

use crate::codec::Frame;
use crate::engine::{AudioEngine, EngineEventKind, EngineEvents, EngineHandle};
use crate::error::AudioEngineError;
use crate::msg::{Command, Gain};
use crate::remote::{Control, RemoteStore};
use crate::transport::{BoxedReader, BoxedWriter, Connector, FrameReader, FrameWriter};
use crate::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ============================================================================
// Audio engine
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Begin(String, Duration),
    Pause(EngineHandle),
    Resume(EngineHandle),
    Stop(EngineHandle),
    Gain(Gain),
}

#[derive(Default)]
struct EngineState {
    next: u64,
    calls: Vec<EngineCall>,
    fail_next: Option<AudioEngineError>,
    events: Option<EngineEvents>,
}

/// Records calls; optionally reports `PlaybackStarted` right after `begin`.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine that confirms every stream as audible immediately.
    pub fn auto_start(events: EngineEvents) -> Self {
        let engine = Self::default();
        lock(&engine.state).events = Some(events);
        engine
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        lock(&self.state).calls.clone()
    }

    pub fn last_handle(&self) -> Option<EngineHandle> {
        let state = lock(&self.state);
        (state.next > 0).then(|| EngineHandle(state.next))
    }

    /// Report `kind` for the most recent stream, as the engine would.
    pub fn emit(&self, kind: EngineEventKind) {
        let state = lock(&self.state);
        if let Some(events) = &state.events
            && state.next > 0
        {
            events.send(EngineHandle(state.next), kind);
        }
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: AudioEngineError) {
        lock(&self.state).fail_next = Some(error);
    }

    fn record(&self, call: EngineCall) -> std::result::Result<(), AudioEngineError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        match state.fail_next.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl AudioEngine for FakeEngine {
    fn begin(
        &self,
        url: &str,
        start_offset: Duration,
        _format: crate::types::FormatTag,
    ) -> std::result::Result<EngineHandle, AudioEngineError> {
        self.record(EngineCall::Begin(url.to_string(), start_offset))?;
        let mut state = lock(&self.state);
        state.next += 1;
        let handle = EngineHandle(state.next);
        if let Some(events) = &state.events {
            events.send(handle, EngineEventKind::PlaybackStarted);
        }
        Ok(handle)
    }

    fn pause(&self, handle: EngineHandle) -> std::result::Result<(), AudioEngineError> {
        self.record(EngineCall::Pause(handle))
    }

    fn resume(&self, handle: EngineHandle) -> std::result::Result<(), AudioEngineError> {
        self.record(EngineCall::Resume(handle))
    }

    fn stop(&self, handle: EngineHandle) -> std::result::Result<(), AudioEngineError> {
        self.record(EngineCall::Stop(handle))
    }

    fn set_gain(&self, gain: Gain) {
        let _ = self.record(EngineCall::Gain(gain));
    }
}

// ============================================================================
// Server side channel
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    GetPref(String),
    SetPref(String, String),
    Index,
    Jump {
        index: u32,
        offset: Duration,
        paused: bool,
    },
    Volume,
    SetVolume(u8),
    Time,
    Control(Control),
}

struct RemoteState {
    prefs: HashMap<String, String>,
    index: Option<u32>,
    volume: u8,
    time: Duration,
    calls: Vec<RemoteCall>,
    offline: bool,
    fail_jumps: bool,
    delay: Option<Duration>,
}

/// In-memory server. Records every call, including failed ones.
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RemoteState {
                prefs: HashMap::new(),
                index: None,
                volume: 50,
                time: Duration::ZERO,
                calls: Vec::new(),
                offline: false,
                fail_jumps: false,
                delay: None,
            }),
        }
    }

    pub fn set_index(&self, index: Option<u32>) {
        lock(&self.state).index = index;
    }

    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        lock(&self.state).delay = delay;
    }

    pub fn fail_jumps(&self, fail: bool) {
        lock(&self.state).fail_jumps = fail;
    }

    pub fn set_volume_level(&self, volume: u8) {
        lock(&self.state).volume = volume;
    }

    pub fn volume_level(&self) -> u8 {
        lock(&self.state).volume
    }

    pub fn set_time(&self, time: Duration) {
        lock(&self.state).time = time;
    }

    pub fn set_pref(&self, key: &str, value: &str) {
        lock(&self.state)
            .prefs
            .insert(key.to_string(), value.to_string());
    }

    pub fn pref(&self, key: &str) -> Option<String> {
        lock(&self.state).prefs.get(key).cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn jumps(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, RemoteCall::Jump { .. }))
            .collect()
    }

    /// Record `call`, wait out any configured delay, then fail if offline.
    async fn enter(&self, call: RemoteCall) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push(call);
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.state).offline {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "server offline",
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn get_preference(&self, _player: &str, key: &str) -> Result<Option<String>> {
        self.enter(RemoteCall::GetPref(key.to_string())).await?;
        Ok(self.pref(key))
    }

    async fn set_preference(&self, _player: &str, key: &str, value: &str) -> Result<()> {
        self.enter(RemoteCall::SetPref(key.to_string(), value.to_string()))
            .await?;
        let mut state = lock(&self.state);
        if value.is_empty() {
            state.prefs.remove(key);
        } else {
            state.prefs.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn playlist_index(&self, _player: &str) -> Result<u32> {
        self.enter(RemoteCall::Index).await?;
        lock(&self.state)
            .index
            .ok_or_else(|| Error::Protocol("empty playlist".into()))
    }

    async fn playlist_jump(
        &self,
        _player: &str,
        index: u32,
        offset: Duration,
        paused: bool,
    ) -> Result<()> {
        self.enter(RemoteCall::Jump {
            index,
            offset,
            paused,
        })
        .await?;
        let mut state = lock(&self.state);
        if state.fail_jumps {
            return Err(Error::Protocol("jump refused".into()));
        }
        state.index = Some(index);
        state.time = offset;
        Ok(())
    }

    async fn volume(&self, _player: &str) -> Result<u8> {
        self.enter(RemoteCall::Volume).await?;
        Ok(self.volume_level())
    }

    async fn set_volume(&self, _player: &str, volume: u8) -> Result<()> {
        self.enter(RemoteCall::SetVolume(volume)).await?;
        self.set_volume_level(volume);
        Ok(())
    }

    async fn current_time(&self, _player: &str) -> Result<Duration> {
        self.enter(RemoteCall::Time).await?;
        Ok(lock(&self.state).time)
    }

    async fn control(&self, _player: &str, control: Control) -> Result<()> {
        self.enter(RemoteCall::Control(control)).await
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Hands out pre-arranged in-memory links, then refuses.
#[derive(Default)]
pub struct ScriptedConnector {
    links: Mutex<VecDeque<(BoxedReader, BoxedWriter)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a link and return the server's end of it.
    pub fn push_link(&self) -> FakeServer {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let (rd, wr) = tokio::io::split(client);
        lock(&self.links).push_back((Box::new(rd), Box::new(wr)));
        FakeServer::new(server)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<(BoxedReader, BoxedWriter)> {
        lock(&self.links).pop_front().ok_or_else(|| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no link scripted",
            ))
        })
    }
}

/// Server end of an in-memory link.
pub struct FakeServer {
    frames: Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>,
    writer: FrameWriter,
}

impl FakeServer {
    fn new(io: DuplexStream) -> Self {
        let (rd, wr) = tokio::io::split(io);
        Self {
            frames: Box::pin(FrameReader::new(Box::new(rd)).into_stream()),
            writer: FrameWriter::new(Box::new(wr)),
        }
    }

    /// Next command from the client. Panics after five seconds of silence.
    pub async fn recv(&mut self) -> Command {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.frames.next())
            .await
            .expect("client silent")
            .expect("client closed")
            .expect("bad frame");
        Command::decode(&frame).expect("undecodable frame")
    }

    /// Skip commands until one matches.
    pub async fn recv_until(&mut self, mut pred: impl FnMut(&Command) -> bool) -> Command {
        loop {
            let cmd = self.recv().await;
            if pred(&cmd) {
                return cmd;
            }
        }
    }

    pub async fn send(&mut self, cmd: &Command) {
        self.writer.send(cmd).await.expect("send to client");
    }
}
