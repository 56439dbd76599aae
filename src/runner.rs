//! The session actor.
//!
//! [`SessionRunner`] owns every piece of mutable session state and runs in
//! its own task. Server frames, engine events, handle commands, timers and
//! the results of background round-trips are all serialized through one
//! `select!` loop, so nothing else ever writes the anchor, the playback
//! state or the connection state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::{MAX_NAME_LEN, SessionConfig};
use crate::connection::{Connection, ConnectionState, Disconnect, Retry};
use crate::dispatch::{CommandHandler, Dispatcher};
use crate::engine::{AudioEngine, EngineEvent};
use crate::event::{LifecycleEvent, SessionEvent};
use crate::msg::{Capabilities, Command, Gain, StatusReport, StreamDirective};
use crate::playback::{Output, PlaybackMachine, PlaybackState};
use crate::recovery::{RecoveryManager, RecoveryMode, RecoveryOutcome};
use crate::remote::{Control, RemoteStore, bounded};
use crate::session::{Collaborators, SessionCommand};
use crate::timesync::PositionReader;
use crate::transport::{
    self, BoxedReader, BoxedWriter, Connector, FrameReader, FrameWriter, TcpConnector,
};
use crate::types::{PlaybackSession, RecoveryTrigger, StatusKind};
use crate::{Error, Result};

/// Setting id of the player name.
const SETTING_PLAYER_NAME: u16 = 0;

/// What the presentation layer sees of the playback machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PlaybackView {
    pub session: Option<PlaybackSession>,
    pub state: PlaybackState,
}

/// Results of work spawned off the loop.
enum TaskResult {
    Recovery {
        epoch: u64,
        mode: RecoveryMode,
        result: Result<RecoveryOutcome>,
    },
    Position {
        generation: u64,
        result: Result<Duration>,
    },
    Control {
        control: Control,
        result: Result<()>,
    },
}

/// Snapshot writes, applied in the order they were issued.
enum SnapshotJob {
    Save {
        trigger: RecoveryTrigger,
        position: Duration,
        was_playing: bool,
    },
    Clear,
}

/// What the loop should do after handling one input.
enum Flow {
    Continue,
    /// Connect now, resetting the retry budget.
    Reconnect,
    /// Treat the connection as failed.
    Fail(Error),
    /// Expected teardown; stay disconnected.
    Stop,
    Shutdown,
}

enum Offline {
    Connect,
    Halt,
    Shutdown,
}

enum Served {
    Failed(Error),
    Stopped,
    Shutdown,
}

enum Exit {
    Retry(Duration),
    Halted,
    Shutdown,
}

pub(crate) struct SessionRunner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    engine: Arc<dyn AudioEngine>,
    remote: Arc<dyn RemoteStore>,
    recovery: Arc<RecoveryManager>,
    machine: PlaybackMachine,
    connection: Connection,
    dispatcher: Dispatcher,
    command_rx: mpsc::Receiver<SessionCommand>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
    task_tx: mpsc::UnboundedSender<TaskResult>,
    task_rx: mpsc::UnboundedReceiver<TaskResult>,
    view_tx: watch::Sender<PlaybackView>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotJob>,
    snapshot_rx: Option<mpsc::UnboundedReceiver<SnapshotJob>>,
    queued: Vec<Output>,
    reported_connection: ConnectionState,
    background: bool,
    first_connection: bool,
    /// `STAT STMc` is held back until the connect-time recovery finishes.
    connected_pending: bool,
    /// Next user play goes through a recovery jump (route change, interruption).
    resume_by_recovery: bool,
    /// Bumped on every new connection and on stop; stale task results are dropped.
    epoch: u64,
}

impl SessionRunner {
    pub(crate) fn new(
        config: SessionConfig,
        collaborators: Collaborators,
        command_rx: mpsc::Receiver<SessionCommand>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let Collaborators {
            engine,
            engine_events,
            store,
            remote,
            connector,
            clock,
        } = collaborators;
        let connector = connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(config.server_addr.clone())));
        let recovery = Arc::new(RecoveryManager::new(
            config.player_id(),
            store,
            remote.clone(),
            clock,
            &config.timing,
        ));
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (view_tx, _) = watch::channel(PlaybackView::default());
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        Self {
            machine: PlaybackMachine::new(engine.clone(), config.timing.stall_window),
            connection: Connection::new(),
            dispatcher: Dispatcher::new(),
            config,
            connector,
            engine,
            remote,
            recovery,
            command_rx,
            engine_rx: engine_events,
            event_tx,
            task_tx,
            task_rx,
            view_tx,
            snapshot_tx,
            snapshot_rx: Some(snapshot_rx),
            queued: Vec::new(),
            reported_connection: ConnectionState::Disconnected,
            background: false,
            first_connection: true,
            connected_pending: false,
            resume_by_recovery: false,
            epoch: 0,
        }
    }

    pub(crate) fn position_reader(&self) -> PositionReader {
        self.machine.time().reader()
    }

    pub(crate) fn watch_view(&self) -> watch::Receiver<PlaybackView> {
        self.view_tx.subscribe()
    }

    pub(crate) fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Run until shutdown.
    pub(crate) async fn run(mut self) {
        info!(
            name = %self.config.name,
            server = %self.config.server_addr,
            "Session runner starting"
        );
        if let Some(jobs) = self.snapshot_rx.take() {
            tokio::spawn(snapshot_worker(self.recovery.clone(), jobs));
        }

        let mut next_attempt = Some(Instant::now());
        loop {
            match self.wait_offline(next_attempt).await {
                Offline::Connect => {}
                Offline::Halt => {
                    next_attempt = None;
                    continue;
                }
                Offline::Shutdown => break,
            }
            next_attempt = match self.attempt().await {
                Exit::Retry(delay) => Some(Instant::now() + delay),
                Exit::Halted => None,
                Exit::Shutdown => break,
            };
        }

        self.machine.shutdown();
        self.flush_offline().await;
        let stats = self.dispatcher.stats();
        info!(
            dispatched = stats.dispatched,
            unknown = stats.unknown,
            malformed = stats.malformed,
            "Session runner stopped"
        );
        self.emit(SessionEvent::SessionClosed);
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    async fn attempt(&mut self) -> Exit {
        self.connection.begin_connect();
        self.sync_connection();

        let link =
            transport::connect_with_timeout(self.connector.as_ref(), self.config.timing.connect_timeout)
                .await;
        let (reader, writer) = match link {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                return self.after_failure(false);
            }
        };

        match self.serve(reader, writer).await {
            Served::Failed(e) => {
                warn!(error = %e, "Connection lost");
                self.after_failure(true)
            }
            Served::Stopped => {
                self.connection.fail(Disconnect::Expected, &self.config.timing);
                self.sync_connection();
                Exit::Halted
            }
            Served::Shutdown => Exit::Shutdown,
        }
    }

    fn after_failure(&mut self, was_connected: bool) -> Exit {
        self.connected_pending = false;
        let retry = self
            .connection
            .fail(Disconnect::Unexpected, &self.config.timing);
        self.sync_connection();
        if was_connected {
            self.snapshot(RecoveryTrigger::Disconnect);
        }
        match retry {
            Retry::After(delay) => Exit::Retry(delay),
            Retry::GiveUp => {
                let attempts = self.connection.retry_count().saturating_sub(1);
                self.emit(SessionEvent::ConnectionLost { attempts });
                self.connection.rearm();
                Exit::Halted
            }
        }
    }

    /// Handle inputs while disconnected until it is time to connect.
    async fn wait_offline(&mut self, deadline: Option<Instant>) -> Offline {
        loop {
            let stall = self.machine.stall_deadline();
            let flow = tokio::select! {
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    return Offline::Connect;
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => Flow::Shutdown,
                },
                Some(event) = self.engine_rx.recv() => {
                    self.machine.handle_engine_event(event);
                    Flow::Continue
                }
                Some(result) = self.task_rx.recv() => self.handle_task(result),
                _ = sleep_until(stall.unwrap_or_else(far_future)), if stall.is_some() => {
                    self.machine.check_stall(Instant::now());
                    Flow::Continue
                }
            };
            self.flush_offline().await;
            match flow {
                Flow::Continue | Flow::Fail(_) => {}
                Flow::Reconnect => return Offline::Connect,
                Flow::Stop => return Offline::Halt,
                Flow::Shutdown => return Offline::Shutdown,
            }
        }
    }

    /// Drive one physical connection until it ends.
    async fn serve(&mut self, reader: BoxedReader, writer: BoxedWriter) -> Served {
        let mut writer = FrameWriter::new(writer);
        let frames = FrameReader::new(reader).into_stream();
        tokio::pin!(frames);

        let hello = Command::Handshake {
            capabilities: self.capabilities(),
        };
        if let Err(e) = writer.send(&hello).await {
            return Served::Failed(e);
        }
        self.epoch += 1;
        self.connection.connected(Instant::now());
        self.connection
            .set_streaming(self.machine.session().is_some());
        self.sync_connection();

        let mode = if self.first_connection {
            self.config
                .cold_open_recovery
                .then_some(RecoveryMode::Silent)
        } else {
            Some(RecoveryMode::Reconnect)
        };
        self.first_connection = false;
        match mode {
            Some(mode) => {
                self.connected_pending = true;
                self.spawn_recovery(mode);
            }
            None => self.queue_connected(),
        }
        if let Err(e) = self.flush(Some(&mut writer)).await {
            return Served::Failed(e);
        }

        let timing = self.config.timing.clone();
        let mut next_heartbeat = Instant::now() + timing.heartbeat_for(self.background);
        let mut next_refresh = Instant::now() + timing.position_refresh;

        loop {
            let streaming = self.connection.state() == ConnectionState::Streaming;
            let inactivity = self
                .connection
                .inactivity_deadline(timing.inactivity_timeout(self.background));
            let stall = self.machine.stall_deadline();

            let flow = tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        self.connection.record_activity(Instant::now());
                        let mut inbound = Inbound {
                            machine: &mut self.machine,
                            engine: self.engine.as_ref(),
                            name: &mut self.config.name,
                            queued: &mut self.queued,
                        };
                        if let Err(e) = self.dispatcher.dispatch(&frame, &mut inbound) {
                            debug!(error = %e, "Frame dropped");
                        }
                        Flow::Continue
                    }
                    Some(Err(e)) => Flow::Fail(e),
                    None => Flow::Fail(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "server closed the connection",
                    ))),
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => Flow::Shutdown,
                },
                Some(event) = self.engine_rx.recv() => {
                    self.machine.handle_engine_event(event);
                    Flow::Continue
                }
                Some(result) = self.task_rx.recv() => self.handle_task(result),
                _ = sleep_until(next_heartbeat), if streaming => {
                    next_heartbeat = Instant::now() + timing.heartbeat_for(self.background);
                    let report = StatusReport::new(StatusKind::Heartbeat, self.machine.position());
                    self.queued.push(Output::Send(Command::StatusReport(report)));
                    Flow::Continue
                }
                _ = sleep_until(inactivity.unwrap_or_else(far_future)), if inactivity.is_some() => {
                    Flow::Fail(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no inbound traffic",
                    )))
                }
                _ = sleep_until(stall.unwrap_or_else(far_future)), if stall.is_some() => {
                    self.machine.check_stall(Instant::now());
                    Flow::Continue
                }
                _ = sleep_until(next_refresh) => {
                    next_refresh = Instant::now() + timing.position_refresh;
                    if self.machine.is_playing() {
                        self.spawn_position_refresh();
                    }
                    Flow::Continue
                }
            };

            if let Err(e) = self.flush(Some(&mut writer)).await {
                return Served::Failed(e);
            }
            match flow {
                Flow::Continue | Flow::Reconnect => {}
                Flow::Fail(e) => return Served::Failed(e),
                Flow::Stop => {
                    if let Err(e) = writer.close().await {
                        debug!(error = %e, "Close failed");
                    }
                    return Served::Stopped;
                }
                Flow::Shutdown => {
                    if let Err(e) = writer.close().await {
                        debug!(error = %e, "Close failed");
                    }
                    return Served::Shutdown;
                }
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            device_id: self.config.device_id,
            reconnect: !self.first_connection,
            model: self.config.model.clone(),
            name: self.config.name.clone(),
            formats: self.config.formats.clone(),
        }
    }

    fn queue_connected(&mut self) {
        self.connected_pending = false;
        let report = StatusReport::new(StatusKind::Connected, self.machine.position());
        self.queued
            .push(Output::Send(Command::StatusReport(report)));
    }

    // ------------------------------------------------------------------
    // Handle commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::User { control, reply } => {
                let result = self.user_control(control);
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionCommand::Lifecycle { event, reply } => {
                let flow = self.lifecycle(event);
                let _ = reply.send(Ok(()));
                flow
            }
            SessionCommand::Reconnect { reply } => {
                let _ = reply.send(Ok(()));
                if self.connection.is_connected() {
                    Flow::Continue
                } else {
                    info!("Reconnect requested");
                    self.connection.rearm();
                    Flow::Reconnect
                }
            }
            SessionCommand::Stop { reply } => {
                info!("Stop requested");
                self.recovery.cancel();
                self.epoch += 1;
                self.connected_pending = false;
                self.resume_by_recovery = false;
                self.machine.shutdown();
                let _ = reply.send(Ok(()));
                Flow::Stop
            }
            SessionCommand::Shutdown => Flow::Shutdown,
        }
    }

    fn user_control(&mut self, control: Control) -> Result<()> {
        debug!(?control, "User control");
        let online = self.connection.is_connected();
        match control {
            Control::Play if self.resume_by_recovery => {
                self.resume_by_recovery = false;
                self.spawn_recovery(RecoveryMode::Resume);
            }
            Control::Play if !online => {
                self.machine.resume_locally();
            }
            Control::Pause if !online => {
                if self.machine.pause_locally() {
                    self.snapshot(RecoveryTrigger::Pause);
                }
            }
            Control::Seek(_) | Control::Skip(_) if !online => {
                return Err(Error::Protocol("not connected".into()));
            }
            control => self.spawn_control(control),
        }
        Ok(())
    }

    fn lifecycle(&mut self, event: LifecycleEvent) -> Flow {
        info!(?event, "Lifecycle");
        match event {
            LifecycleEvent::Backgrounded => {
                self.background = true;
                self.snapshot(RecoveryTrigger::Backgrounded);
            }
            LifecycleEvent::Foregrounded => {
                self.background = false;
                if !self.connection.is_connected() {
                    self.connection.rearm();
                    return Flow::Reconnect;
                }
            }
            LifecycleEvent::Suspended => self.snapshot(RecoveryTrigger::Suspend),
            LifecycleEvent::Resumed => {
                let timeout = self.config.timing.inactivity_timeout(self.background);
                if self.connection.is_stale(Instant::now(), timeout) {
                    return Flow::Fail(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connection stale after suspension",
                    )));
                }
                if !self.connection.is_connected() {
                    return Flow::Reconnect;
                }
            }
            LifecycleEvent::RouteChanged { paused_playback } => {
                if paused_playback {
                    self.hold_for_recovery(RecoveryTrigger::RouteChange);
                } else {
                    self.snapshot(RecoveryTrigger::RouteChange);
                }
            }
            LifecycleEvent::InterruptionBegan => {
                self.hold_for_recovery(RecoveryTrigger::Interruption);
            }
            LifecycleEvent::InterruptionEnded { should_resume } => {
                if should_resume && let Err(e) = self.user_control(Control::Play) {
                    warn!(error = %e, "Resume after interruption failed");
                }
            }
        }
        Flow::Continue
    }

    /// Pause locally, keep the stream, and resume through a recovery jump.
    fn hold_for_recovery(&mut self, trigger: RecoveryTrigger) {
        if self.machine.pause_locally() {
            self.resume_by_recovery = true;
            self.snapshot(trigger);
        }
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    fn handle_task(&mut self, result: TaskResult) -> Flow {
        match result {
            TaskResult::Recovery {
                epoch,
                mode,
                result,
            } => {
                if epoch != self.epoch {
                    debug!(?mode, "Discarding stale recovery result");
                    return Flow::Continue;
                }
                if self.connected_pending {
                    self.queue_connected();
                }
                let recovered = match result {
                    Ok(RecoveryOutcome::Recovered(snapshot)) => {
                        info!(?mode, index = snapshot.playlist_index, "Recovery complete");
                        self.emit(SessionEvent::RecoveryCompleted { mode, snapshot });
                        true
                    }
                    Ok(outcome) => {
                        debug!(?mode, ?outcome, "No recovery performed");
                        false
                    }
                    Err(e) => {
                        warn!(?mode, error = %e, "Recovery failed");
                        false
                    }
                };
                if mode == RecoveryMode::Resume && !recovered {
                    if self.connection.is_connected() {
                        self.spawn_control(Control::Play);
                    } else {
                        self.machine.resume_locally();
                    }
                }
            }
            TaskResult::Position { generation, result } => match result {
                Ok(position) => {
                    self.machine.time_mut().apply_refresh(generation, position);
                }
                Err(e) => debug!(error = %e, "Position refresh failed"),
            },
            TaskResult::Control { control, result } => {
                if let Err(e) = result {
                    warn!(?control, error = %e, "Server control failed, acting locally");
                    match control {
                        Control::Pause => {
                            if self.machine.pause_locally() {
                                self.snapshot(RecoveryTrigger::Pause);
                            }
                        }
                        Control::Play => {
                            self.machine.resume_locally();
                        }
                        Control::Seek(_) | Control::Skip(_) => {}
                    }
                }
            }
        }
        Flow::Continue
    }

    fn spawn_recovery(&self, mode: RecoveryMode) {
        let recovery = self.recovery.clone();
        let tx = self.task_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = recovery.recover(mode).await;
            let _ = tx.send(TaskResult::Recovery {
                epoch,
                mode,
                result,
            });
        });
    }

    fn spawn_control(&self, control: Control) {
        let remote = self.remote.clone();
        let tx = self.task_tx.clone();
        let player = self.config.player_id();
        let timeout = self.config.timing.remote_timeout;
        tokio::spawn(async move {
            let result = bounded(timeout, remote.control(&player, control)).await;
            let _ = tx.send(TaskResult::Control { control, result });
        });
    }

    fn spawn_position_refresh(&self) {
        let remote = self.remote.clone();
        let tx = self.task_tx.clone();
        let player = self.config.player_id();
        let timeout = self.config.timing.remote_timeout;
        let generation = self.machine.time().generation();
        tokio::spawn(async move {
            let result = bounded(timeout, remote.current_time(&player)).await;
            let _ = tx.send(TaskResult::Position { generation, result });
        });
    }

    fn spawn_index_refresh(&self) {
        let recovery = self.recovery.clone();
        tokio::spawn(async move {
            if let Err(e) = recovery.refresh_index().await {
                debug!(error = %e, "Playlist index refresh failed");
            }
        });
    }

    /// Save a snapshot of the current stream in the background.
    fn snapshot(&self, trigger: RecoveryTrigger) {
        if self.machine.session().is_none() {
            debug!(?trigger, "No stream, snapshot skipped");
            return;
        }
        let position = self.machine.position();
        let was_playing = matches!(
            self.machine.state(),
            PlaybackState::Playing | PlaybackState::Starting | PlaybackState::Stalled
        );
        let job = SnapshotJob::Save {
            trigger,
            position,
            was_playing,
        };
        if self.snapshot_tx.send(job).is_err() {
            debug!(?trigger, "Snapshot worker gone");
        }
    }

    /// Drop the stored snapshot once the server has moved past it.
    fn clear_snapshot(&self) {
        if self.connected_pending {
            debug!("Connect-time recovery pending, snapshot kept");
            return;
        }
        if self.snapshot_tx.send(SnapshotJob::Clear).is_err() {
            debug!("Snapshot worker gone");
        }
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Carry out queued outputs. Status reports are dropped when offline.
    async fn flush(&mut self, mut writer: Option<&mut FrameWriter>) -> Result<()> {
        loop {
            self.queued.extend(self.machine.take_outputs());
            if self.queued.is_empty() {
                break;
            }
            let mut pending: VecDeque<Output> = std::mem::take(&mut self.queued).into();
            while let Some(output) = pending.pop_front() {
                match output {
                    Output::Send(cmd) => match writer.as_mut() {
                        Some(w) => match w.send(&cmd).await {
                            Ok(()) => {}
                            // Refused before any byte was written; the link is intact.
                            Err(e @ (Error::Protocol(_) | Error::MalformedFrame { .. })) => {
                                warn!(error = %e, "Unencodable, dropping {}", transport::describe(&cmd));
                            }
                            Err(e) => {
                                self.queued = pending
                                    .into_iter()
                                    .filter(|o| !matches!(o, Output::Send(_)))
                                    .collect();
                                return Err(e);
                            }
                        },
                        None => debug!("Offline, dropping {}", transport::describe(&cmd)),
                    },
                    Output::Snapshot(trigger) => self.snapshot(trigger),
                    Output::ClearSnapshot => self.clear_snapshot(),
                    Output::Event(event) => {
                        if matches!(event, SessionEvent::TrackStarted { .. }) {
                            self.spawn_index_refresh();
                        }
                        self.emit(event);
                    }
                }
            }
        }

        self.connection
            .set_streaming(self.machine.session().is_some());
        self.sync_connection();
        self.publish_view();
        Ok(())
    }

    async fn flush_offline(&mut self) {
        if let Err(e) = self.flush(None).await {
            debug!(error = %e, "Flush failed");
        }
    }

    fn publish_view(&self) {
        let view = PlaybackView {
            session: self.machine.session().cloned(),
            state: self.machine.state(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn sync_connection(&mut self) {
        let state = self.connection.state();
        if state != self.reported_connection {
            self.reported_connection = state;
            self.emit(SessionEvent::ConnectionChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "Event not delivered");
        }
    }
}

/// Routes decoded server commands into session state.
struct Inbound<'a> {
    machine: &'a mut PlaybackMachine,
    engine: &'a dyn AudioEngine,
    name: &'a mut String,
    queued: &'a mut Vec<Output>,
}

impl CommandHandler for Inbound<'_> {
    fn on_stream_directive(&mut self, directive: StreamDirective) {
        self.machine.handle_directive(directive);
    }

    fn on_setting_request(&mut self, id: u16, payload: Bytes) {
        match id {
            SETTING_PLAYER_NAME if payload.is_empty() => {
                debug!(name = %self.name, "Name query");
                self.queued.push(Output::Send(Command::SettingRequest {
                    id,
                    payload: Bytes::copy_from_slice(self.name.as_bytes()),
                }));
            }
            SETTING_PLAYER_NAME => {
                let name = String::from_utf8_lossy(&payload)
                    .trim_end_matches('\0')
                    .to_string();
                if name.len() > MAX_NAME_LEN {
                    warn!(len = name.len(), "Rename ignored: name too long");
                    return;
                }
                info!(%name, "Player renamed");
                *self.name = name.clone();
                self.queued
                    .push(Output::Event(SessionEvent::PlayerRenamed(name)));
            }
            _ => self
                .queued
                .push(Output::Event(SessionEvent::Setting { id, payload })),
        }
    }

    fn on_gain_update(&mut self, gain: Gain) {
        self.engine.set_gain(gain);
        self.queued
            .push(Output::Event(SessionEvent::GainChanged(gain)));
    }
}

async fn snapshot_worker(
    recovery: Arc<RecoveryManager>,
    mut jobs: mpsc::UnboundedReceiver<SnapshotJob>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            SnapshotJob::Save {
                trigger,
                position,
                was_playing,
            } => {
                if let Err(e) = recovery.save(trigger, position, was_playing).await {
                    warn!(?trigger, error = %e, "Snapshot failed");
                }
            }
            SnapshotJob::Clear => {
                debug!("Snapshot superseded by server");
                recovery.clear().await;
            }
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365)
}
