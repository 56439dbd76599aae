//! Position interpolation between server anchors.
//!
//! The server's position is authoritative. Each time it tells us where
//! playback is, [`TimeSync`] replaces the stored [`TimeAnchor`] wholesale;
//! in between, readers extrapolate from the anchor with the monotonic
//! clock. The anchor is never mutated in place, so a reader on another
//! task sees either the old anchor or the new one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::TrackId;

/// Last authoritative position and when it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAnchor {
    pub server_position: Duration,
    pub captured_at: Instant,
    pub is_playing: bool,
    pub track_id: TrackId,
}

impl TimeAnchor {
    /// Position at `now`: frozen while paused, advancing while playing.
    pub fn position_at(&self, now: Instant) -> Duration {
        if self.is_playing {
            self.server_position + now.saturating_duration_since(self.captured_at)
        } else {
            self.server_position
        }
    }
}

type Slot = Option<Arc<TimeAnchor>>;

/// Owner of the anchor. Only the session runner holds one.
#[derive(Debug)]
pub struct TimeSync {
    tx: watch::Sender<Slot>,
    generation: u64,
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSync {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, generation: 0 }
    }

    /// Replace the anchor with a fresh server position.
    pub fn update_from_server(&mut self, position: Duration, is_playing: bool, track_id: TrackId) {
        self.generation += 1;
        trace!(
            position_ms = position.as_millis() as u64,
            is_playing,
            track = %track_id,
            generation = self.generation,
            "Anchor replaced"
        );
        self.tx.send_replace(Some(Arc::new(TimeAnchor {
            server_position: position,
            captured_at: Instant::now(),
            is_playing,
            track_id,
        })));
    }

    /// Re-anchor at the current interpolated position with a new playing flag.
    ///
    /// Used when playback freezes or resumes without the server naming a
    /// position. Does nothing before the first anchor.
    pub fn freeze_or_resume(&mut self, is_playing: bool) {
        if let Some(anchor) = self.anchor() {
            let position = anchor.position_at(Instant::now());
            self.update_from_server(position, is_playing, anchor.track_id.clone());
        }
    }

    /// Drop the anchor; the position reads as zero until the next one.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.tx.send_replace(None);
    }

    /// Apply a position fetched out-of-band.
    ///
    /// `generation` is the value of [`TimeSync::generation`] when the fetch
    /// was started. If any anchor was written since, the result is stale
    /// and discarded. Returns whether the anchor was replaced.
    pub fn apply_refresh(&mut self, generation: u64, position: Duration) -> bool {
        if generation != self.generation {
            debug!(
                requested = generation,
                current = self.generation,
                "Discarding stale position refresh"
            );
            return false;
        }
        match self.anchor() {
            Some(anchor) if anchor.is_playing => {
                self.update_from_server(position, true, anchor.track_id.clone());
                true
            }
            _ => false,
        }
    }

    /// Counter bumped by every anchor write.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn anchor(&self) -> Option<Arc<TimeAnchor>> {
        self.tx.borrow().clone()
    }

    pub fn current_position(&self) -> Duration {
        position_of(&self.tx.borrow(), Instant::now())
    }

    pub fn is_playing(&self) -> bool {
        self.tx.borrow().as_ref().is_some_and(|a| a.is_playing)
    }

    /// A read-only view for other tasks.
    pub fn reader(&self) -> PositionReader {
        PositionReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of [`TimeSync`]. Cheap to clone; usable from any task.
#[derive(Debug, Clone)]
pub struct PositionReader {
    rx: watch::Receiver<Slot>,
}

impl PositionReader {
    pub fn current_position(&self) -> Duration {
        position_of(&self.rx.borrow(), Instant::now())
    }

    pub fn is_playing(&self) -> bool {
        self.rx.borrow().as_ref().is_some_and(|a| a.is_playing)
    }

    pub fn anchor(&self) -> Option<Arc<TimeAnchor>> {
        self.rx.borrow().clone()
    }

    /// Wait until the anchor is replaced. Fails once the writer is gone.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.rx.changed().await
    }
}

fn position_of(slot: &Slot, now: Instant) -> Duration {
    slot.as_ref().map_or(Duration::ZERO, |a| a.position_at(now))
}
