//! Background connection kernel.
//!
//! Once `BrokerClient::connect` has confirmed a connection, the kernel owns
//! the event loop on its own tokio task. It:
//!
//! 1. pumps MQTT packets and dispatches inbound publishes to registered
//!    topic handlers,
//! 2. re-subscribes every registered filter when the broker confirms a
//!    reconnection (CONNACK),
//! 3. classifies failures as fatal or retryable and applies exponential
//!    backoff between retries,
//! 4. tracks connection state and failure counters, and
//! 5. shuts down cleanly on cancellation, sending a best-effort DISCONNECT.
//!
//! Handler errors are logged here and never propagate: a misbehaving
//! subscriber callback cannot take down the I/O task.

use std::sync::Arc;

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    backoff::Backoff,
    error::TransferError,
    manager::resubscribe_all,
    state::{lock, ConnectionState, Shared},
};

/// Drives one broker connection's event loop until cancellation or a fatal
/// error. Created by `BrokerClient::connect`; runs on a single tokio task.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    shared: Arc<Shared>,
    qos: QoS,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl ConnectionKernel {
    pub(crate) fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        shared: Arc<Shared>,
        qos: QoS,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            event_loop,
            shared,
            qos,
            backoff,
            cancel,
        }
    }

    /// Main event loop. Returns when cancelled, when a fatal error occurs,
    /// or when the reconnect budget is exhausted.
    pub async fn run(mut self) {
        debug!("connection kernel started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }

                event = self.event_loop.poll() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(err) => {
                        self.shared.set_connected(false);
                        self.shared.record_failure();

                        if is_fatal_error(&err) {
                            error!("fatal connection error, giving up: {err}");
                            self.shared.update_state(ConnectionState::Disconnected(err.to_string()));
                            return;
                        }

                        match self.backoff.next_sleep() {
                            Ok(delay) => {
                                warn!(
                                    "connection lost ({}), reconnecting in {:.1}s",
                                    root_cause(&err),
                                    delay.as_secs_f64()
                                );
                                self.shared
                                    .update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));
                                tokio::select! {
                                    _ = self.cancel.cancelled() => {
                                        self.shutdown().await;
                                        return;
                                    }
                                    _ = tokio::time::sleep(delay) => {}
                                }
                                self.shared.update_state(ConnectionState::Connecting);
                            }
                            Err(exhausted) => {
                                let err = TransferError::from(exhausted);
                                error!("reconnect attempts exhausted: {err}");
                                self.shared
                                    .update_state(ConnectionState::Disconnected(err.to_string()));
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("connection re-established");
                    self.shared.set_connected(true);
                    self.backoff.reset();
                    self.shared.update_state(ConnectionState::Connected);
                    // The mechanism that survives broker restarts: replay
                    // every registered subscription on each CONNACK.
                    resubscribe_all(&self.client, &self.shared, self.qos).await;
                }
            }
            Event::Incoming(Packet::Publish(publish)) => {
                lock(&self.shared.stats).messages_received += 1;
                self.dispatch(&publish.topic, &publish.payload).await;
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("disconnected by broker");
                self.shared.set_connected(false);
                self.shared.record_failure();
                self.shared
                    .update_state(ConnectionState::Disconnected("disconnected by broker".into()));
            }
            Event::Incoming(packet) => trace!("incoming packet: {packet:?}"),
            Event::Outgoing(outgoing) => trace!("outgoing packet: {outgoing:?}"),
        }
    }

    /// Routes an inbound publish to every handler whose filter matches.
    /// Handler failures are logged and swallowed.
    async fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        let handlers: Vec<_> = {
            let subscriptions = self.shared.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| topic_matches(&s.filter, topic))
                .map(|s| s.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            trace!("no handler registered for topic {topic}");
            return;
        }

        for handler in handlers {
            if let Err(err) = handler(topic, payload) {
                warn!("message handler for {topic} failed: {err}");
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("connection kernel shutting down");
        self.shared.set_connected(false);
        if let Err(err) = self.client.disconnect().await {
            debug!("disconnect packet not sent: {err}");
        }
        self.shared
            .update_state(ConnectionState::Disconnected("disconnect requested".into()));
    }
}

/// Matches an MQTT topic against a subscription filter with `+` (one level)
/// and `#` (remaining levels) wildcards.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// True for errors where reconnecting cannot help: broken TLS or protocol
/// state, terminal CONNACK refusals, and io kinds that indicate local
/// misconfiguration rather than a transient network condition.
pub(crate) fn is_fatal_error(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Tls(_)
        | ConnectionError::MqttState(_)
        | ConnectionError::NotConnAck(_)
        | ConnectionError::RequestsDone => true,

        ConnectionError::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::AddrInUse
                | std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::InvalidInput
                | std::io::ErrorKind::InvalidData
        ),

        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::RefusedProtocolVersion
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
        ),

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => false,

        // Future rumqttc variants default to retrying.
        #[allow(unreachable_patterns)]
        _ => false,
    }
}

/// Innermost message of an error chain, for readable reconnect logs.
fn root_cause(err: &dyn std::error::Error) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}
