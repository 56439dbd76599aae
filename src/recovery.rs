//! Snapshot persistence and server repositioning after a discontinuity.
//!
//! A [`RecoverySnapshot`] records where in the server playlist playback
//! was when something interrupted it. After a reconnect or a cold start
//! the [`RecoveryManager`] moves the server back to that point.
//!
//! Recovery operations are serialized: a save and a recover never
//! interleave, and two concurrent recovers perform at most one jump.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::Timing;
use crate::remote::{RemoteStore, bounded};
use crate::store::{self, KeyValueStore};
use crate::types::{Clock, RecoverySnapshot, RecoveryTrigger};
use crate::{Error, Result};

/// Local store key of the snapshot.
pub const SNAPSHOT_KEY: &str = "slimlink.recovery";

/// Server preference holding a copy of the snapshot.
const REMOTE_PREF: &str = "slimlinkRecovery";

/// How the server is moved back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryMode {
    /// After a reconnect: jump back, playing if playback was playing.
    Reconnect,
    /// Cold start: jump with the volume muted and land paused.
    Silent,
    /// Explicit user resume after a route change or interruption.
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// No fresh snapshot.
    NothingPending,
    /// The server was repositioned; the snapshot is consumed.
    Recovered(RecoverySnapshot),
    /// [`RecoveryManager::cancel`] was called before the jump.
    Cancelled,
}

pub struct RecoveryManager {
    player: String,
    local: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
    timeout: Duration,
    last_index: Mutex<Option<u32>>,
    op: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl RecoveryManager {
    pub fn new(
        player: impl Into<String>,
        local: Arc<dyn KeyValueStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        timing: &Timing,
    ) -> Self {
        Self {
            player: player.into(),
            local,
            remote,
            clock,
            grace: timing.recovery_grace,
            timeout: timing.remote_timeout,
            last_index: Mutex::new(None),
            op: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Last playlist index the server reported.
    pub fn cached_index(&self) -> Option<u32> {
        *self.last_index.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Ask the server for the current playlist index and remember it.
    pub async fn refresh_index(&self) -> Result<u32> {
        let index = bounded(self.timeout, self.remote.playlist_index(&self.player)).await?;
        *self.last_index.lock().unwrap_or_else(|p| p.into_inner()) = Some(index);
        debug!(index, "Playlist index");
        Ok(index)
    }

    /// Abandon any recovery that has not jumped yet.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Write a snapshot at `position`.
    ///
    /// The playlist index comes from the server, or from the last known
    /// index if the server cannot be reached in time. Returns `None` when a
    /// newer snapshot is already stored.
    #[instrument(skip(self), fields(position_ms = position.as_millis() as u64))]
    pub async fn save(
        &self,
        trigger: RecoveryTrigger,
        position: Duration,
        was_playing: bool,
    ) -> Result<Option<RecoverySnapshot>> {
        let saved_at = self.clock.now_ms();
        let _op = self.op.lock().await;

        let playlist_index = match self.refresh_index().await {
            Ok(index) => index,
            Err(e) => match self.cached_index() {
                Some(index) => {
                    debug!(error = %e, index, "Using last known playlist index");
                    index
                }
                None => {
                    warn!(error = %e, "No playlist index, snapshot not written");
                    return Err(e);
                }
            },
        };

        if let Some(existing) =
            store::load_json::<RecoverySnapshot>(self.local.as_ref(), SNAPSHOT_KEY).await?
            && existing.saved_at > saved_at
        {
            debug!(existing = existing.saved_at, saved_at, "Newer snapshot already stored");
            return Ok(None);
        }

        let snapshot = RecoverySnapshot {
            playlist_index,
            position,
            saved_at,
            trigger,
            was_playing,
        };
        store::save_json(self.local.as_ref(), SNAPSHOT_KEY, &snapshot).await?;
        info!(index = playlist_index, ?trigger, "Snapshot saved");

        let json = serde_json::to_string(&snapshot)?;
        if let Err(e) = bounded(
            self.timeout,
            self.remote.set_preference(&self.player, REMOTE_PREF, &json),
        )
        .await
        {
            warn!(error = %e, "Snapshot not banked on server");
        }
        Ok(Some(snapshot))
    }

    /// The local snapshot, if still within the grace window.
    pub async fn pending(&self) -> Result<Option<RecoverySnapshot>> {
        let local = store::load_json::<RecoverySnapshot>(self.local.as_ref(), SNAPSHOT_KEY).await?;
        match self.fresh(local) {
            Ok(snapshot) => Ok(snapshot),
            Err(Error::RecoveryExpired) => {
                self.clear_stores().await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// The fresher of the local and server snapshots.
    ///
    /// An expired local copy is dropped on its own; the server copy is
    /// judged separately and may still be acted on.
    pub async fn pending_any(&self) -> Result<Option<RecoverySnapshot>> {
        let local = store::load_json::<RecoverySnapshot>(self.local.as_ref(), SNAPSHOT_KEY).await?;
        let local = match self.fresh(local) {
            Ok(snapshot) => snapshot,
            Err(Error::RecoveryExpired) => {
                if let Err(e) = self.local.clear(SNAPSHOT_KEY).await {
                    warn!(error = %e, "Local snapshot not cleared");
                }
                None
            }
            Err(e) => return Err(e),
        };
        let remote = match self.remote_snapshot().await {
            Ok(snapshot) => self.fresh(snapshot).unwrap_or(None),
            Err(e) => {
                warn!(error = %e, "Server snapshot unavailable");
                None
            }
        };
        Ok(match (local, remote) {
            (Some(l), Some(r)) if r.saved_at > l.saved_at => Some(r),
            (Some(l), _) => Some(l),
            (None, r) => r,
        })
    }

    /// Reposition the server from the pending snapshot.
    ///
    /// On success the snapshot is cleared locally and on the server. On
    /// failure it is kept for the next attempt.
    #[instrument(skip(self))]
    pub async fn recover(&self, mode: RecoveryMode) -> Result<RecoveryOutcome> {
        let generation = self.generation.load(Ordering::SeqCst);
        let _op = self.op.lock().await;

        let snapshot = match mode {
            RecoveryMode::Silent => self.pending_any().await?,
            RecoveryMode::Reconnect | RecoveryMode::Resume => self.pending().await?,
        };
        let Some(snapshot) = snapshot else {
            debug!("Nothing to recover");
            return Ok(RecoveryOutcome::NothingPending);
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            info!("Recovery cancelled");
            return Ok(RecoveryOutcome::Cancelled);
        }

        info!(
            index = snapshot.playlist_index,
            position_ms = snapshot.position.as_millis() as u64,
            trigger = ?snapshot.trigger,
            "Recovering"
        );
        match mode {
            RecoveryMode::Reconnect => self.jump(&snapshot, !snapshot.was_playing).await?,
            RecoveryMode::Resume => self.jump(&snapshot, false).await?,
            RecoveryMode::Silent => self.silent_jump(&snapshot).await?,
        }

        self.clear_stores().await;
        Ok(RecoveryOutcome::Recovered(snapshot))
    }

    /// Forget any snapshot.
    pub async fn clear(&self) {
        let _op = self.op.lock().await;
        self.clear_stores().await;
    }

    async fn jump(&self, snapshot: &RecoverySnapshot, paused: bool) -> Result<()> {
        bounded(
            self.timeout,
            self.remote.playlist_jump(
                &self.player,
                snapshot.playlist_index,
                snapshot.position,
                paused,
            ),
        )
        .await
    }

    /// Jump with output muted. The volume is restored on every path once muted.
    async fn silent_jump(&self, snapshot: &RecoverySnapshot) -> Result<()> {
        let volume = bounded(self.timeout, self.remote.volume(&self.player)).await?;
        bounded(self.timeout, self.remote.set_volume(&self.player, 0)).await?;

        let jumped = self.jump(snapshot, true).await;
        let restored = bounded(self.timeout, self.remote.set_volume(&self.player, volume)).await;
        if let Err(e) = &restored {
            warn!(error = %e, volume, "Volume not restored");
        }
        jumped?;
        restored
    }

    async fn remote_snapshot(&self) -> Result<Option<RecoverySnapshot>> {
        let value = bounded(
            self.timeout,
            self.remote.get_preference(&self.player, REMOTE_PREF),
        )
        .await?;
        Ok(value.and_then(|v| match serde_json::from_str(&v) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(error = %e, "Unreadable server snapshot");
                None
            }
        }))
    }

    fn fresh(&self, snapshot: Option<RecoverySnapshot>) -> Result<Option<RecoverySnapshot>> {
        match snapshot {
            Some(s) if !s.is_fresh(self.clock.now_ms(), self.grace) => {
                debug!(saved_at = s.saved_at, "Snapshot expired");
                Err(Error::RecoveryExpired)
            }
            other => Ok(other),
        }
    }

    async fn clear_stores(&self) {
        if let Err(e) = self.local.clear(SNAPSHOT_KEY).await {
            warn!(error = %e, "Local snapshot not cleared");
        }
        if let Err(e) = bounded(
            self.timeout,
            self.remote.set_preference(&self.player, REMOTE_PREF, ""),
        )
        .await
        {
            debug!(error = %e, "Server snapshot not cleared");
        }
    }
}
