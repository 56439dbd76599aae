//! Fake player example.
//!
//! Connects to a music server as a player whose audio engine only pretends
//! to play: streams "start" after a short buffer, tick once a second, and
//! end after a random track length.
//!
//! Run with: RUST_LOG=info cargo run --example fake_player
//! Run with debug: RUST_LOG=slimlink=debug,fake_player=debug cargo run --example fake_player
//!
//! Reads `player.toml` from the working directory when present, otherwise
//! connects to the host given as the first argument.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::{Rng, thread_rng};
use slimlink::{
    AudioEngine, AudioEngineError, Collaborators, EngineEventKind, EngineEvents, EngineHandle,
    FileStore, FormatTag, JsonRpcStore, SessionConfig, SessionCoordinator, SessionEvent,
};
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

fn load_config() -> slimlink::Result<SessionConfig> {
    let path = Path::new("player.toml");
    if path.exists() {
        return SessionConfig::load(path);
    }
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(SessionConfig::new("Fake Player", &host))
}

// ============================================================================
// Simulated Engine
// ============================================================================

struct Stream {
    playing: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Pretends to play. Elapsed time advances only while not paused.
struct SimulatedEngine {
    events: EngineEvents,
    next: AtomicU64,
    streams: Mutex<HashMap<EngineHandle, Stream>>,
}

impl SimulatedEngine {
    fn new(events: EngineEvents) -> Self {
        Self {
            events,
            next: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<EngineHandle, Stream>> {
        self.streams.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_playing(&self, handle: EngineHandle, playing: bool) -> Result<(), AudioEngineError> {
        match self.streams().get(&handle) {
            Some(stream) => {
                stream.playing.send_replace(playing);
                Ok(())
            }
            None => Err(AudioEngineError::UnknownHandle),
        }
    }
}

async fn play(
    events: EngineEvents,
    handle: EngineHandle,
    start: Duration,
    length: Duration,
    mut playing: watch::Receiver<bool>,
) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    if !events.send(handle, EngineEventKind::PlaybackStarted) {
        return;
    }

    let mut elapsed = start;
    let mut ticks = tokio::time::interval(Duration::from_secs(1));
    ticks.tick().await;
    loop {
        ticks.tick().await;
        if !*playing.borrow_and_update() {
            continue;
        }
        elapsed += Duration::from_secs(1);
        if elapsed >= length {
            info!(handle = handle.0, "Track finished");
            events.send(handle, EngineEventKind::Ended);
            return;
        }
        if !events.send(handle, EngineEventKind::ElapsedTick(elapsed)) {
            return;
        }
    }
}

impl AudioEngine for SimulatedEngine {
    fn begin(
        &self,
        url: &str,
        start_offset: Duration,
        format: FormatTag,
    ) -> Result<EngineHandle, AudioEngineError> {
        let handle = EngineHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let length = Duration::from_secs(thread_rng().gen_range(60..360)); // 1-6 minutes
        info!(handle = handle.0, %url, ?format, length_s = length.as_secs(), "Begin stream");

        let (playing, playing_rx) = watch::channel(true);
        let task = tokio::spawn(play(
            self.events.clone(),
            handle,
            start_offset,
            length,
            playing_rx,
        ));
        self.streams().insert(handle, Stream { playing, task });
        Ok(handle)
    }

    fn pause(&self, handle: EngineHandle) -> Result<(), AudioEngineError> {
        debug!(handle = handle.0, "Pause");
        self.set_playing(handle, false)
    }

    fn resume(&self, handle: EngineHandle) -> Result<(), AudioEngineError> {
        debug!(handle = handle.0, "Resume");
        self.set_playing(handle, true)
    }

    fn stop(&self, handle: EngineHandle) -> Result<(), AudioEngineError> {
        debug!(handle = handle.0, "Stop");
        match self.streams().remove(&handle) {
            Some(stream) => {
                stream.task.abort();
                Ok(())
            }
            None => Err(AudioEngineError::UnknownHandle),
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    info!(name = %config.name, server = %config.server_addr, player = %config.player_id(), "Starting fake player");

    let (engine_tx, engine_rx) = slimlink::engine::channel();
    let engine = Arc::new(SimulatedEngine::new(engine_tx));
    let remote = Arc::new(JsonRpcStore::new(&config.rpc_url)?);
    let store = Arc::new(FileStore::new(".fake_player"));

    let (session, mut events) = SessionCoordinator::start(
        config,
        Collaborators::new(engine, engine_rx, store, remote),
    );

    info!("Fake player running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::ConnectionChanged(state) => info!(%state, "Connection"),
                SessionEvent::ConnectionLost { attempts } => {
                    warn!(attempts, "Server unreachable, retrying in 30s");
                    let retry = tokio::time::sleep(Duration::from_secs(30));
                    tokio::pin!(retry);
                    tokio::select! {
                        _ = &mut retry => session.reconnect().await?,
                        _ = signal::ctrl_c() => break,
                    }
                }
                SessionEvent::TrackStarted { session: s } => {
                    info!(track = %s.track_id, format = ?s.format, "Track started");
                }
                SessionEvent::PlaybackChanged(state) => {
                    let display_state = session.current_display_state();
                    info!(?state, position_ms = display_state.position.as_millis() as u64, "Playback");
                }
                SessionEvent::StreamFailed { track_id, reason } => {
                    warn!(track = %track_id, %reason, "Stream failed");
                }
                SessionEvent::RecoveryCompleted { mode, snapshot } => {
                    info!(?mode, index = snapshot.playlist_index, position_ms = snapshot.position.as_millis() as u64, "Recovered");
                }
                SessionEvent::SessionClosed => break,
                other => debug!(?other, "Event"),
            },
            _ = signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
