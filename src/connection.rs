//! Control-connection state and reconnect policy.
//!
//! [`Connection`] tracks the lifecycle of the control connection and
//! publishes it on a watch channel. Only the session runner mutates it;
//! everything else subscribes.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected with an active stream; heartbeats and inactivity checks run.
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Why the connection went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Requested teardown. No reconnect, no snapshot.
    Expected,
    /// Transport failure, EOF, malformed frame or inactivity.
    Unexpected,
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    After(Duration),
    /// Stay disconnected.
    GiveUp,
}

/// Reconnect delay for the `retry`-th consecutive failure (1-based).
///
/// Doubles from `base` and saturates at `cap`.
pub fn backoff(retry: u32, base: Duration, cap: Duration) -> Duration {
    let shift = retry.saturating_sub(1).min(31);
    base.checked_mul(1u32 << shift).unwrap_or(cap).min(cap)
}

#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    retry_count: u32,
    last_activity: Option<Instant>,
    tx: watch::Sender<ConnectionState>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            last_activity: None,
            tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Streaming
        )
    }

    /// Disconnected -> Connecting.
    pub fn begin_connect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.set(ConnectionState::Connecting);
        }
    }

    /// Connecting -> Connected. Resets the retry budget.
    pub fn connected(&mut self, now: Instant) {
        if self.retry_count > 0 {
            info!(attempts = self.retry_count, "Reconnected");
        }
        self.retry_count = 0;
        self.last_activity = Some(now);
        self.set(ConnectionState::Connected);
    }

    /// Follow the playback session: Streaming while a stream exists.
    pub fn set_streaming(&mut self, streaming: bool) {
        match (self.state, streaming) {
            (ConnectionState::Connected, true) => self.set(ConnectionState::Streaming),
            (ConnectionState::Streaming, false) => self.set(ConnectionState::Connected),
            _ => {}
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// When silence on the wire becomes a failure. Only armed while streaming.
    pub fn inactivity_deadline(&self, timeout: Duration) -> Option<Instant> {
        if self.state != ConnectionState::Streaming {
            return None;
        }
        self.last_activity.map(|t| t + timeout)
    }

    /// Whether the connection has been silent longer than `timeout`.
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        self.is_connected()
            && self
                .last_activity
                .is_some_and(|t| now.saturating_duration_since(t) > timeout)
    }

    /// Go to Disconnected and decide whether to try again.
    pub fn fail(&mut self, reason: Disconnect, timing: &Timing) -> Retry {
        self.last_activity = None;
        self.set(ConnectionState::Disconnected);
        match reason {
            Disconnect::Expected => {
                debug!("Connection closed on request");
                Retry::GiveUp
            }
            Disconnect::Unexpected => {
                self.retry_count += 1;
                if timing
                    .max_reconnect_attempts
                    .is_some_and(|max| self.retry_count > max)
                {
                    warn!(attempts = self.retry_count - 1, "Reconnect attempts exhausted");
                    return Retry::GiveUp;
                }
                let delay = backoff(self.retry_count, timing.backoff_base, timing.backoff_cap);
                info!(
                    attempt = self.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                Retry::After(delay)
            }
        }
    }

    /// Clear the retry budget after giving up, so a manual reconnect starts fresh.
    pub fn rearm(&mut self) {
        self.retry_count = 0;
    }

    fn set(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state");
            self.state = state;
            self.tx.send_replace(state);
        }
    }
}
