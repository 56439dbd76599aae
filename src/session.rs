//! Session coordinator handle.
//!
//! This module provides [`SessionCoordinator`], the host-facing handle for
//! one player session. Starting it spawns the session actor; every method
//! is a message to that actor, so the handle is cheap to share behind an
//! `Arc` and never blocks on network I/O.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::SessionConfig;
use crate::connection::ConnectionState;
use crate::engine::{AudioEngine, EngineEvent};
use crate::event::{DisplayState, LifecycleEvent, SessionEvent};
use crate::remote::{Control, RemoteStore};
use crate::runner::{PlaybackView, SessionRunner};
use crate::store::KeyValueStore;
use crate::timesync::PositionReader;
use crate::transport::Connector;
use crate::types::{Clock, SystemClock};
use crate::{Error, Result};

const COMMAND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 100;

// ============================================================================
// Session Commands (host -> actor)
// ============================================================================

pub(crate) type Reply = oneshot::Sender<Result<()>>;

pub(crate) enum SessionCommand {
    User { control: Control, reply: Reply },
    Lifecycle { event: LifecycleEvent, reply: Reply },
    Reconnect { reply: Reply },
    Stop { reply: Reply },
    Shutdown,
}

// ============================================================================
// Collaborators
// ============================================================================

/// Host-provided services the session drives.
pub struct Collaborators {
    pub(crate) engine: Arc<dyn AudioEngine>,
    pub(crate) engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// `engine_events` is the receiving end of [`crate::engine::channel`]
    /// whose sender was given to `engine`.
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        store: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
    ) -> Self {
        Self {
            engine,
            engine_events,
            store,
            remote,
            connector: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the default TCP connector.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ============================================================================
// Coordinator Handle
// ============================================================================

/// Handle to a running player session.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use slimlink::{Collaborators, JsonRpcStore, FileStore, SessionConfig, SessionCoordinator};
///
/// let config = SessionConfig::load("player.toml")?;
/// let (events_tx, events_rx) = slimlink::engine::channel();
/// let engine = Arc::new(MyEngine::new(events_tx));
/// let remote = Arc::new(JsonRpcStore::new(&config.rpc_url)?);
/// let store = Arc::new(FileStore::new("/var/lib/player"));
///
/// let (session, mut events) =
///     SessionCoordinator::start(config, Collaborators::new(engine, events_rx, store, remote));
///
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// ```
pub struct SessionCoordinator {
    command_tx: mpsc::Sender<SessionCommand>,
    position: PositionReader,
    view: watch::Receiver<PlaybackView>,
    connection: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionCoordinator {
    /// Spawn the session and start connecting.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// yields [`SessionEvent`]s until the session shuts down.
    pub fn start(
        config: SessionConfig,
        collaborators: Collaborators,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

        let runner = SessionRunner::new(config, collaborators, command_rx, event_tx);
        let position = runner.position_reader();
        let view = runner.watch_view();
        let connection = runner.watch_connection();
        let task = tokio::spawn(runner.run());

        let coordinator = Self {
            command_tx,
            position,
            view,
            connection,
            task,
        };
        (coordinator, event_rx)
    }

    async fn request(&self, make: impl FnOnce(Reply) -> SessionCommand) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    async fn control(&self, control: Control) -> Result<()> {
        self.request(|reply| SessionCommand::User { control, reply })
            .await
    }

    /// Start or resume playback.
    ///
    /// After a route change or an interruption this repositions the server
    /// at the saved point instead of resuming the held stream.
    pub async fn user_play(&self) -> Result<()> {
        self.control(Control::Play).await
    }

    /// Pause. Falls back to a local pause when the server is unreachable.
    pub async fn user_pause(&self) -> Result<()> {
        self.control(Control::Pause).await
    }

    pub async fn user_seek(&self, position: Duration) -> Result<()> {
        self.control(Control::Seek(position)).await
    }

    pub async fn user_skip_next(&self) -> Result<()> {
        self.control(Control::Skip(1)).await
    }

    pub async fn user_skip_previous(&self) -> Result<()> {
        self.control(Control::Skip(-1)).await
    }

    /// Report a host lifecycle change.
    pub async fn lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        self.request(|reply| SessionCommand::Lifecycle { event, reply })
            .await
    }

    /// Connect now, resetting the retry budget.
    ///
    /// No-op while connected.
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Reconnect { reply })
            .await
    }

    /// Stop playback and disconnect without scheduling a reconnect.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| SessionCommand::Stop { reply }).await
    }

    /// Current state for rendering. Never blocks on the network.
    pub fn current_display_state(&self) -> DisplayState {
        let view = self.view.borrow().clone();
        DisplayState {
            session: view.session,
            playback: view.state,
            position: self.position.current_position(),
            is_playing: self.position.is_playing(),
            connection: *self.connection.borrow(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Watch connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Lock-free position reads for a UI thread.
    pub fn position_reader(&self) -> PositionReader {
        self.position.clone()
    }

    /// Stop the session and wait for the actor to exit.
    pub async fn shutdown(self) {
        if self.command_tx.send(SessionCommand::Shutdown).await.is_err() {
            debug!("Session already stopped");
        }
        if let Err(e) = self.task.await {
            debug!(error = %e, "Session task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{self, EngineEventKind};
    use crate::msg::{Command, StreamDirective};
    use crate::playback::PlaybackState;
    use crate::recovery::{RecoveryMode, SNAPSHOT_KEY};
    use crate::store::MemoryStore;
    use crate::testing::{FakeEngine, FakeRemote, FakeServer, RemoteCall, ScriptedConnector};
    use crate::types::{FormatTag, RecoverySnapshot, RecoveryTrigger, StatusKind, StreamCode};
    use bytes::Bytes;

    struct Harness {
        session: SessionCoordinator,
        events: mpsc::Receiver<SessionEvent>,
        connector: Arc<ScriptedConnector>,
        engine: Arc<FakeEngine>,
        remote: Arc<FakeRemote>,
        store: Arc<MemoryStore>,
    }

    fn config() -> SessionConfig {
        let mut config = SessionConfig::new("Kitchen", "127.0.0.1");
        config.cold_open_recovery = false;
        config.timing.backoff_base = Duration::from_millis(10);
        config.timing.backoff_cap = Duration::from_millis(40);
        config
    }

    /// Start a session with one link already scripted.
    fn start(config: SessionConfig, remote: FakeRemote, store: MemoryStore) -> (Harness, FakeServer) {
        let connector = Arc::new(ScriptedConnector::new());
        let server = connector.push_link();
        let (events_tx, events_rx) = engine::channel();
        let engine = Arc::new(FakeEngine::auto_start(events_tx));
        let remote = Arc::new(remote);
        let store = Arc::new(store);
        let collaborators =
            Collaborators::new(engine.clone(), events_rx, store.clone(), remote.clone())
                .with_connector(connector.clone());
        let (session, events) = SessionCoordinator::start(config, collaborators);
        let harness = Harness {
            session,
            events,
            connector,
            engine,
            remote,
            store,
        };
        (harness, server)
    }

    fn status(cmd: &Command) -> Option<StatusKind> {
        match cmd {
            Command::StatusReport(r) => Some(r.kind),
            _ => None,
        }
    }

    fn directive(code: StreamCode, offset_ms: u64) -> Command {
        Command::StreamDirective(StreamDirective {
            code,
            url: (code == StreamCode::Start).then(|| "http://server/stream.flac".to_string()),
            format: FormatTag::Flac,
            start_offset: Duration::from_millis(offset_ms),
        })
    }

    async fn connect(server: &mut FakeServer) {
        assert!(matches!(server.recv().await, Command::Handshake { .. }));
        let next = server.recv().await;
        assert_eq!(status(&next), Some(StatusKind::Connected));
    }

    async fn start_stream(server: &mut FakeServer, offset_ms: u64) {
        server.send(&directive(StreamCode::Start, offset_ms)).await;
        assert_eq!(status(&server.recv().await), Some(StatusKind::Flushed));
        assert_eq!(status(&server.recv().await), Some(StatusKind::Started));
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn stored_snapshot(store: &MemoryStore) -> Option<RecoverySnapshot> {
        crate::store::load_json(store, SNAPSHOT_KEY).await.unwrap()
    }

    /// Wait until a snapshot is stored (`present`) or gone (`!present`).
    async fn wait_for_snapshot(store: &MemoryStore, present: bool) -> Option<RecoverySnapshot> {
        for _ in 0..500 {
            let snapshot = stored_snapshot(store).await;
            if snapshot.is_some() == present {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("snapshot presence never became {present}");
    }

    async fn next_event(
        events: &mut mpsc::Receiver<SessionEvent>,
        mut pred: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        let wait = async {
            while let Some(event) = events.recv().await {
                if pred(&event) {
                    return event;
                }
            }
            panic!("event stream ended");
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("event not seen")
    }

    #[tokio::test]
    async fn handshake_precedes_connected_report() {
        let (h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());

        match server.recv().await {
            Command::Handshake { capabilities } => {
                assert_eq!(capabilities.name, "Kitchen");
                assert!(!capabilities.reconnect);
                assert!(capabilities.formats.contains(&FormatTag::Flac));
            }
            other => panic!("expected HELO, got {other:?}"),
        }
        assert_eq!(status(&server.recv().await), Some(StatusKind::Connected));
        assert_eq!(h.session.connection_state(), ConnectionState::Connected);

        h.session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connected_report_follows_handshake_without_waiting() {
        let (h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        let began = tokio::time::Instant::now();

        connect(&mut server).await;
        assert_eq!(tokio::time::Instant::now(), began);

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn status_query_gets_heartbeat() {
        let (h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;

        server.send(&directive(StreamCode::StatusQuery, 0)).await;
        assert_eq!(status(&server.recv().await), Some(StatusKind::Heartbeat));

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn start_directive_plays_and_streams() {
        let (mut h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 5_000).await;

        next_event(&mut h.events, |e| matches!(e, SessionEvent::TrackStarted { .. })).await;
        next_event(&mut h.events, |e| {
            *e == SessionEvent::ConnectionChanged(ConnectionState::Streaming)
        })
        .await;

        let display = h.session.current_display_state();
        assert_eq!(display.playback, PlaybackState::Playing);
        assert_eq!(display.connection, ConnectionState::Streaming);
        assert!(display.is_playing);
        assert!(display.position >= Duration::from_secs(5));
        assert!(display.session.is_some());

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn name_query_and_rename() {
        let (mut h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;

        server
            .send(&Command::SettingRequest {
                id: 0,
                payload: Bytes::new(),
            })
            .await;
        assert_eq!(
            server.recv().await,
            Command::SettingRequest {
                id: 0,
                payload: Bytes::from_static(b"Kitchen"),
            }
        );

        server
            .send(&Command::SettingRequest {
                id: 0,
                payload: Bytes::from_static(b"Den\0"),
            })
            .await;
        let event = next_event(&mut h.events, |e| matches!(e, SessionEvent::PlayerRenamed(_))).await;
        assert_eq!(event, SessionEvent::PlayerRenamed("Den".into()));

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_jumps_back_to_saved_position() {
        let remote = FakeRemote::new();
        remote.set_index(Some(3));
        let (mut h, mut server) = start(config(), remote, MemoryStore::new());
        let mut second = h.connector.push_link();

        connect(&mut server).await;
        start_stream(&mut server, 10_000).await;
        wait_for(|| h.remote.calls().contains(&RemoteCall::Index)).await;
        drop(server);

        match second.recv().await {
            Command::Handshake { capabilities } => assert!(capabilities.reconnect),
            other => panic!("expected HELO, got {other:?}"),
        }
        second
            .recv_until(|c| status(c) == Some(StatusKind::Connected))
            .await;

        let jumps = h.remote.jumps();
        assert_eq!(jumps.len(), 1);
        match &jumps[0] {
            RemoteCall::Jump {
                index,
                offset,
                paused,
            } => {
                assert_eq!(*index, 3);
                assert!(*offset >= Duration::from_secs(10));
                assert!(*offset < Duration::from_secs(15));
                assert!(!paused);
            }
            other => panic!("unexpected call {other:?}"),
        }

        let event = next_event(&mut h.events, |e| {
            matches!(e, SessionEvent::RecoveryCompleted { .. })
        })
        .await;
        assert!(matches!(
            event,
            SessionEvent::RecoveryCompleted {
                mode: RecoveryMode::Reconnect,
                ..
            }
        ));
        assert_eq!(h.store.load(SNAPSHOT_KEY).await.unwrap(), None);

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget_then_reconnects_on_request() {
        let mut config = config();
        config.timing.max_reconnect_attempts = Some(2);
        let (mut h, mut server) = start(config, FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        drop(server);

        let event = next_event(&mut h.events, |e| matches!(e, SessionEvent::ConnectionLost { .. })).await;
        assert_eq!(event, SessionEvent::ConnectionLost { attempts: 2 });
        assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);

        let mut server = h.connector.push_link();
        h.session.reconnect().await.unwrap();
        match server.recv().await {
            Command::Handshake { capabilities } => assert!(capabilities.reconnect),
            other => panic!("expected HELO, got {other:?}"),
        }

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn route_change_pauses_then_play_recovers() {
        let remote = FakeRemote::new();
        remote.set_index(Some(1));
        let (h, mut server) = start(config(), remote, MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 2_000).await;

        h.session
            .lifecycle(LifecycleEvent::RouteChanged {
                paused_playback: true,
            })
            .await
            .unwrap();
        assert_eq!(status(&server.recv().await), Some(StatusKind::Paused));
        assert_eq!(h.session.current_display_state().playback, PlaybackState::Paused);

        let store = h.store.clone();
        let mut saved = None;
        for _ in 0..500 {
            if let Some(bytes) = store.load(SNAPSHOT_KEY).await.unwrap() {
                saved = Some(bytes);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot: RecoverySnapshot = serde_json::from_slice(&saved.expect("snapshot saved")).unwrap();
        assert_eq!(snapshot.trigger, RecoveryTrigger::RouteChange);
        assert_eq!(snapshot.playlist_index, 1);

        h.session.user_play().await.unwrap();
        wait_for(|| !h.remote.jumps().is_empty()).await;
        assert!(matches!(
            h.remote.jumps()[0],
            RemoteCall::Jump {
                index: 1,
                paused: false,
                ..
            }
        ));
        assert!(!h.remote.calls().contains(&RemoteCall::Control(Control::Play)));

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn route_change_without_pause_still_snapshots() {
        let remote = FakeRemote::new();
        remote.set_index(Some(6));
        let (h, mut server) = start(config(), remote, MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 3_000).await;

        h.session
            .lifecycle(LifecycleEvent::RouteChanged {
                paused_playback: false,
            })
            .await
            .unwrap();

        let snapshot = wait_for_snapshot(&h.store, true).await.unwrap();
        assert_eq!(snapshot.trigger, RecoveryTrigger::RouteChange);
        assert_eq!(snapshot.playlist_index, 6);
        assert!(snapshot.was_playing);
        assert_eq!(h.session.current_display_state().playback, PlaybackState::Playing);

        // Play goes to the server as usual, not through a recovery jump.
        h.session.user_play().await.unwrap();
        wait_for(|| h.remote.calls().contains(&RemoteCall::Control(Control::Play))).await;
        assert!(h.remote.jumps().is_empty());

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn server_resume_discards_pause_snapshot() {
        let remote = FakeRemote::new();
        remote.set_index(Some(2));
        let (h, mut server) = start(config(), remote, MemoryStore::new());
        let mut second = h.connector.push_link();
        connect(&mut server).await;
        start_stream(&mut server, 0).await;

        server.send(&directive(StreamCode::Pause, 0)).await;
        assert_eq!(status(&server.recv().await), Some(StatusKind::Paused));
        let snapshot = wait_for_snapshot(&h.store, true).await.unwrap();
        assert_eq!(snapshot.trigger, RecoveryTrigger::Pause);

        server.send(&directive(StreamCode::Unpause, 0)).await;
        assert_eq!(status(&server.recv().await), Some(StatusKind::Resumed));
        wait_for_snapshot(&h.store, false).await;

        start_stream(&mut server, 0).await;
        server.send(&directive(StreamCode::Stop, 0)).await;
        assert_eq!(status(&server.recv().await), Some(StatusKind::Flushed));
        drop(server);

        assert!(matches!(second.recv().await, Command::Handshake { .. }));
        second
            .recv_until(|c| status(c) == Some(StatusKind::Connected))
            .await;
        assert!(h.remote.jumps().is_empty());
        assert_eq!(stored_snapshot(&h.store).await, None);

        h.session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn position_refresh_reanchors_to_server_time() {
        let (h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 0).await;
        h.remote.set_time(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(9_500)).await;

        assert!(h.remote.calls().contains(&RemoteCall::Time));
        let position = h.session.current_display_state().position;
        assert!(position >= Duration::from_secs(60), "{position:?}");
        assert!(position < Duration::from_secs(61), "{position:?}");

        h.session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_stall_reports_disconnected_once() {
        let (mut h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 0).await;

        h.engine.emit(EngineEventKind::Stalled);
        next_event(&mut h.events, |e| {
            *e == SessionEvent::PlaybackChanged(PlaybackState::Stalled)
        })
        .await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.session.current_display_state().playback, PlaybackState::Idle);

        server.send(&directive(StreamCode::StatusQuery, 0)).await;
        let mut reports = Vec::new();
        loop {
            let kind = status(&server.recv().await);
            reports.push(kind);
            if kind == Some(StatusKind::Heartbeat) {
                break;
            }
        }
        assert_eq!(
            reports,
            vec![Some(StatusKind::Disconnected), Some(StatusKind::Heartbeat)]
        );
        next_event(&mut h.events, |e| matches!(e, SessionEvent::StreamFailed { .. })).await;

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn cold_open_recovers_silently_before_connected_report() {
        let now = SystemClock.now_ms();
        let store = MemoryStore::new();
        let snapshot = RecoverySnapshot {
            playlist_index: 4,
            position: Duration::from_secs(42),
            saved_at: now - 1_000,
            trigger: RecoveryTrigger::Backgrounded,
            was_playing: true,
        };
        crate::store::save_json(&store, SNAPSHOT_KEY, &snapshot)
            .await
            .unwrap();
        let remote = FakeRemote::new();
        remote.set_volume_level(70);

        let mut config = config();
        config.cold_open_recovery = true;
        let (h, mut server) = start(config, remote, store);
        connect(&mut server).await;

        let jumps = h.remote.jumps();
        assert_eq!(
            jumps,
            vec![RemoteCall::Jump {
                index: 4,
                offset: Duration::from_secs(42),
                paused: true,
            }]
        );
        assert_eq!(h.remote.volume_level(), 70);

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn stop_disconnects_without_retry() {
        let (mut h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        start_stream(&mut server, 0).await;

        h.session.stop().await.unwrap();
        next_event(&mut h.events, |e| {
            *e == SessionEvent::ConnectionChanged(ConnectionState::Disconnected)
        })
        .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(h.session.current_display_state().playback, PlaybackState::Idle);

        h.session.shutdown().await;
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let (h, mut server) = start(config(), FakeRemote::new(), MemoryStore::new());
        connect(&mut server).await;
        let tx = h.session.command_tx.clone();
        h.session.shutdown().await;

        let (reply, _rx) = oneshot::channel();
        assert!(tx.send(SessionCommand::Stop { reply }).await.is_err());
    }
}
