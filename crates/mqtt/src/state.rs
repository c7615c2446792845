//! Connection state and counters shared between the client facade and the
//! background connection kernel.
//!
//! The lifecycle flows `Connecting -> Connected`, drops to `Disconnected`
//! on network loss or broker shutdown, and cycles through
//! `Reconnecting -> Connecting` under the backoff policy. State changes are
//! broadcast on a watch channel so application code can react without
//! polling.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use super::manager::Subscription;

/// Current state of the broker connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// A CONNECT has been sent and the client is waiting for CONNACK.
    Connecting,

    /// CONNACK received, keep-alive active; publishes and subscribes work.
    Connected,

    /// No connection. Carries the reason (broker close, network error,
    /// explicit disconnect, exhausted retries).
    Disconnected(String),

    /// Connection lost; the kernel sleeps this many seconds before the next
    /// attempt.
    Reconnecting(f64),
}

impl ConnectionState {
    /// Short static label, useful for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
        }
    }

    /// True only while the connection is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            ConnectionState::Reconnecting(secs) => write!(f, "Reconnecting (in {secs:.1}s)"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Counters describing one client's traffic and connection history.
///
/// Mutated from both the caller task (publishes, connect attempts) and the
/// kernel task (inbound messages, failures), so access always goes through
/// the mutex in [`Shared`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub messages_published: u64,
    pub messages_received: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
}

/// Locks a mutex, recovering the guard if a panicking holder poisoned it.
/// Counters stay meaningful even after a task panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the [`BrokerClient`](super::BrokerClient) facade and
/// its spawned [`ConnectionKernel`](super::ConnectionKernel).
pub(crate) struct Shared {
    /// Registered topic filters with their handlers, re-issued on every
    /// successful (re)connection.
    pub subscriptions: RwLock<Vec<Subscription>>,

    /// Traffic and failure counters.
    pub stats: Mutex<ClientStats>,

    /// Fast-path connected flag checked before every publish.
    pub connected: AtomicBool,

    state_tx: watch::Sender<ConnectionState>,

    // Kept so that `state_tx.send` cannot fail when no caller subscribed.
    _state_rx: watch::Receiver<ConnectionState>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        let (state_tx, state_rx) =
            watch::channel(ConnectionState::Disconnected("never connected".into()));
        Arc::new(Shared {
            subscriptions: RwLock::new(Vec::new()),
            stats: Mutex::new(ClientStats::default()),
            connected: AtomicBool::new(false),
            state_tx,
            _state_rx: state_rx,
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Publishes a state change, skipping no-op transitions.
    pub(crate) fn update_state(&self, state: ConnectionState) {
        let changed = *self.state_tx.borrow() != state;
        if changed {
            debug!("connection state -> {state}");
            let _ = self.state_tx.send(state);
        }
    }

    /// Counts an unsolicited disconnect or failed attempt.
    pub(crate) fn record_failure(&self) {
        lock(&self.stats).connection_failures += 1;
    }

    pub(crate) fn stats_snapshot(&self) -> ClientStats {
        lock(&self.stats).clone()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_as_str() {
        assert_eq!(ConnectionState::Connecting.as_str(), "Connecting");
        assert_eq!(ConnectionState::Connected.as_str(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("x".into()).as_str(),
            "Disconnected"
        );
        assert_eq!(ConnectionState::Reconnecting(1.0).as_str(), "Reconnecting");
    }

    #[test]
    fn state_display_includes_details() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("broker closed".into()).to_string(),
            "Disconnected (broker closed)"
        );
        assert_eq!(
            ConnectionState::Reconnecting(2.5).to_string(),
            "Reconnecting (in 2.5s)"
        );
    }

    #[test]
    fn is_connected_only_for_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected("e".into()).is_connected());
        assert!(!ConnectionState::Reconnecting(1.0).is_connected());
    }

    #[tokio::test]
    async fn shared_state_broadcasts_changes() {
        let shared = Shared::new();
        let mut rx = shared.subscribe_state();
        assert!(matches!(
            *rx.borrow(),
            ConnectionState::Disconnected(_)
        ));

        shared.update_state(ConnectionState::Connected);
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[test]
    fn failure_counter_increments() {
        let shared = Shared::new();
        shared.record_failure();
        shared.record_failure();
        assert_eq!(shared.stats_snapshot().connection_failures, 2);
    }
}
