//! Websocket session state machine: connection state, transition reasons,
//! and a reconnect generation token.
//!
//! Deliberately has no exponential backoff or multi-endpoint rotation: a
//! fixed 3s reconnect delay keeps missed fills during transient outages to a
//! minimum, against a single endpoint. See DESIGN.md.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);
pub const STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Connecting,
    Streaming,
    Reconnecting,
    Shutdown,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectSuccess,
    WatchdogStale,
    ServerClose,
    NetworkError,
    ListenKeyExpired,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionReason::Started => "started",
            TransitionReason::ConnectSuccess => "connect_success",
            TransitionReason::WatchdogStale => "watchdog_stale",
            TransitionReason::ServerClose => "server_close",
            TransitionReason::NetworkError => "network_error",
            TransitionReason::ListenKeyExpired => "listen_key_expired",
            TransitionReason::ShutdownRequested => "shutdown_requested",
        };
        write!(f, "{s}")
    }
}

/// Tracks connection state plus the last-message timestamp for the 5s/10s
/// watchdog, and debounces concurrent reconnect attempts with a single
/// monotonically increasing generation token: concurrent reconnect
/// attempts are debounced by a single timer token.
pub struct SessionWatchdog {
    state: RwLock<SessionState>,
    last_message_at: RwLock<Instant>,
    generation: AtomicU64,
    label: String,
}

impl SessionWatchdog {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            state: RwLock::new(SessionState::Init),
            last_message_at: RwLock::new(Instant::now()),
            generation: AtomicU64::new(0),
            label: label.into(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn transition(&self, new_state: SessionState, reason: TransitionReason) {
        let old = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old != new_state {
            info!(label = %self.label, from = %old, to = %new_state, reason = %reason, "session transition");
        }
        if new_state == SessionState::Streaming {
            *self.last_message_at.write() = Instant::now();
        }
    }

    pub fn record_message(&self) {
        *self.last_message_at.write() = Instant::now();
    }

    /// `true` if the watchdog interval has elapsed with no message for
    /// longer than [`STALE_AFTER`].
    pub fn is_stale(&self) -> bool {
        self.last_message_at.read().elapsed() > STALE_AFTER
    }

    /// Issues a new reconnect generation token and returns it; a reconnect
    /// task should bail if its captured token no longer matches
    /// [`SessionWatchdog::current_generation`] when it wakes up after the
    /// fixed delay, debouncing overlapping reconnect attempts.
    pub fn begin_reconnect(&self) -> u64 {
        self.transition(SessionState::Reconnecting, TransitionReason::NetworkError);
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current_generation(&self, token: u64) -> bool {
        token == self.current_generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_watchdog_is_not_stale() {
        let wd = SessionWatchdog::new("test");
        assert!(!wd.is_stale());
    }

    #[test]
    fn record_message_resets_staleness() {
        let wd = SessionWatchdog::new("test");
        wd.transition(SessionState::Streaming, TransitionReason::ConnectSuccess);
        wd.record_message();
        assert!(!wd.is_stale());
    }

    #[test]
    fn overlapping_reconnects_are_debounced_by_generation_token() {
        let wd = SessionWatchdog::new("test");
        let first = wd.begin_reconnect();
        let second = wd.begin_reconnect();
        assert_ne!(first, second);
        assert!(!wd.is_current_generation(first));
        assert!(wd.is_current_generation(second));
    }

    #[test]
    fn transition_updates_state() {
        let wd = SessionWatchdog::new("test");
        wd.transition(SessionState::Connecting, TransitionReason::Started);
        assert_eq!(wd.state(), SessionState::Connecting);
    }
}
