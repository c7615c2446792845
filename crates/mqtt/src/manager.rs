//! The broker client facade.
//!
//! `BrokerClient` owns one broker connection and its subscriptions:
//! connect-with-retry, publish, subscribe/unsubscribe with per-topic
//! handlers, and idempotent disconnect. Each `connect` attempt builds a
//! fresh rumqttc client/event-loop pair and waits for CONNACK under the
//! configured timeout, so the attempt count stays observable; only after a
//! confirmed connection is the background [`ConnectionKernel`] spawned to
//! keep the session alive.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet, SubscribeFilter};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    client::ClientBuilder,
    config::Config,
    connection::ConnectionKernel,
    error::TransferError,
    state::{lock, ClientStats, ConnectionState, Shared},
};

/// Error type message handlers may return; logged by the kernel, never
/// propagated to the I/O task.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked with `(topic, payload)` for every inbound publish
/// matching the registered filter. Runs on the kernel task, so it must be
/// quick: hand the payload off to a channel rather than processing inline.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync>;

/// One registered topic filter with its handler.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub filter: String,
    pub handler: MessageHandler,
}

/// One broker connection and its subscriptions.
pub struct BrokerClient {
    config: Config,
    shared: Arc<Shared>,
    client: RwLock<Option<AsyncClient>>,
    kernel_cancel: StdMutex<Option<CancellationToken>>,
}

impl BrokerClient {
    /// Creates a disconnected client. No network activity happens until
    /// [`connect`](Self::connect) is called.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: Shared::new(),
            client: RwLock::new(None),
            kernel_cancel: StdMutex::new(None),
        }
    }

    /// Connects using the retry budget from the configuration.
    pub async fn connect_with_config(&self) -> bool {
        self.connect(
            self.config.connect_retry_attempts,
            self.config.connect_retry_delay(),
        )
        .await
    }

    /// Attempts to connect up to `retry_attempts` times, sleeping
    /// `retry_delay` between failed attempts. Each attempt waits up to the
    /// configured `connection_timeout` for CONNACK.
    ///
    /// On success the connection kernel is spawned (background I/O
    /// processing) and every previously registered topic is re-subscribed.
    /// Returns `true` only if some attempt was confirmed by the broker.
    pub async fn connect(&self, retry_attempts: u32, retry_delay: Duration) -> bool {
        if self.is_connected() {
            warn!("already connected to broker");
            return true;
        }

        let attempts = retry_attempts.max(1);
        for attempt in 1..=attempts {
            lock(&self.shared.stats).connection_attempts += 1;
            info!(
                "connecting to {}:{} (attempt {attempt}/{attempts})",
                self.config.host, self.config.port
            );
            self.shared.update_state(ConnectionState::Connecting);

            match self.try_connect_once().await {
                Ok((client, event_loop)) => {
                    self.shared.set_connected(true);
                    self.shared.update_state(ConnectionState::Connected);
                    *self.client.write().await = Some(client.clone());

                    resubscribe_all(&client, &self.shared, self.config.qos()).await;

                    let cancel = CancellationToken::new();
                    *lock(&self.kernel_cancel) = Some(cancel.clone());
                    let kernel = ConnectionKernel::new(
                        client,
                        event_loop,
                        self.shared.clone(),
                        self.config.qos(),
                        self.config.reconnect_backoff(),
                        cancel,
                    );
                    tokio::spawn(kernel.run());

                    info!("connected to broker {}:{}", self.config.host, self.config.port);
                    return true;
                }
                Err(err) => {
                    warn!("connection attempt {attempt}/{attempts} failed: {err}");
                    self.shared.record_failure();
                    if attempt < attempts {
                        debug!("retrying in {}s", retry_delay.as_secs_f64());
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }

        self.shared
            .update_state(ConnectionState::Disconnected("retry budget exhausted".into()));
        error!(
            "could not connect to broker {}:{} after {attempts} attempts",
            self.config.host, self.config.port
        );
        false
    }

    /// One attempt: build a fresh client pair and wait for CONNACK.
    async fn try_connect_once(&self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let (client, mut event_loop) = ClientBuilder::from_config(&self.config)?.build();
        let timeout = self.config.connection_timeout();

        match tokio::time::timeout(timeout, await_connack(&mut event_loop)).await {
            Ok(Ok(())) => Ok((client, event_loop)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransferError::ClientSetup(format!(
                "no CONNACK within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Stops background I/O and closes the connection. Idempotent: calling
    /// it while disconnected is a no-op.
    pub async fn disconnect(&self) {
        if let Some(cancel) = lock(&self.kernel_cancel).take() {
            cancel.cancel();
        }
        if let Some(client) = self.client.write().await.take() {
            // The kernel also sends DISCONNECT on cancellation; a duplicate
            // here is harmless and covers the race where the kernel already
            // exited.
            let _ = client.disconnect().await;
            info!("disconnected from broker");
        }
        self.shared.set_connected(false);
        self.shared
            .update_state(ConnectionState::Disconnected("disconnect requested".into()));
    }

    /// Publishes `payload` to `topic` at the configured QoS.
    ///
    /// Returns `false` when not connected or when the local hand-off to the
    /// client failed. A `true` result is not an end-to-end acknowledgment
    /// beyond what the QoS level provides.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> bool {
        if !self.is_connected() {
            warn!("not connected to broker, dropping publish to {topic}");
            return false;
        }
        let client = self.client.read().await.clone();
        let Some(client) = client else {
            return false;
        };

        match client
            .publish(topic, self.config.qos(), retain, payload)
            .await
        {
            Ok(()) => {
                lock(&self.shared.stats).messages_published += 1;
                debug!("published to {topic}");
                true
            }
            Err(err) => {
                error!("failed to publish to {topic}: {err}");
                false
            }
        }
    }

    /// Registers `handler` for `topic` (MQTT wildcards allowed) and issues
    /// a SUBSCRIBE if currently connected. Registration survives broker
    /// restarts: every registered filter is re-subscribed on reconnection.
    /// A second registration for the same filter replaces the first.
    pub async fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&str, &[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let subscription = Subscription {
            filter: topic.to_string(),
            handler: Arc::new(handler),
        };
        {
            let mut subscriptions = self.shared.subscriptions.write().await;
            subscriptions.retain(|s| s.filter != topic);
            subscriptions.push(subscription);
        }

        if let Some(client) = self.connected_client().await {
            match client.subscribe(topic, self.config.qos()).await {
                Ok(()) => info!("subscribed to {topic}"),
                Err(err) => warn!("subscribe to {topic} failed (will retry on reconnect): {err}"),
            }
        } else {
            info!("not connected, {topic} will be subscribed on connect");
        }
    }

    /// Removes the registration for `topic` and issues an UNSUBSCRIBE if
    /// connected.
    pub async fn unsubscribe(&self, topic: &str) {
        self.shared
            .subscriptions
            .write()
            .await
            .retain(|s| s.filter != topic);

        if let Some(client) = self.connected_client().await {
            match client.unsubscribe(topic).await {
                Ok(()) => info!("unsubscribed from {topic}"),
                Err(err) => warn!("unsubscribe from {topic} failed: {err}"),
            }
        }
    }

    /// The set of currently registered topic filters, connected or not.
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.shared
            .subscriptions
            .read()
            .await
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Watch channel receiver for connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.subscribe_state()
    }

    /// Snapshot of the traffic and failure counters.
    pub fn stats(&self) -> ClientStats {
        self.shared.stats_snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn connected_client(&self) -> Option<AsyncClient> {
        if !self.is_connected() {
            return None;
        }
        self.client.read().await.clone()
    }
}

/// Polls the event loop until the broker answers the CONNECT.
async fn await_connack(event_loop: &mut EventLoop) -> Result<(), TransferError> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransferError::ClientSetup(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )))
                };
            }
            Ok(_) => {}
            Err(err) => return Err(err.into()),
        }
    }
}

/// Re-issues every registered subscription. Called after the initial
/// connect and by the kernel on every reconnection CONNACK.
pub(crate) async fn resubscribe_all(client: &AsyncClient, shared: &Shared, qos: rumqttc::QoS) {
    let filters: Vec<SubscribeFilter> = {
        let subscriptions = shared.subscriptions.read().await;
        subscriptions
            .iter()
            .map(|s| SubscribeFilter::new(s.filter.clone(), qos))
            .collect()
    };

    if filters.is_empty() {
        debug!("no topics to resubscribe");
        return;
    }

    let count = filters.len();
    match client.subscribe_many(filters).await {
        Ok(()) => info!("resubscribed to {count} topics"),
        Err(err) => error!("failed to resubscribe {count} topics: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> Config {
        // Loopback port 1: nothing listens there, so attempts fail fast.
        Config {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn connect_makes_exactly_the_requested_attempts() {
        let client = BrokerClient::new(unreachable_config());

        let connected = client.connect(3, Duration::from_millis(10)).await;

        assert!(!connected);
        assert!(!client.is_connected());
        let stats = client.stats();
        assert_eq!(stats.connection_attempts, 3);
        assert_eq!(stats.connection_failures, 3);
    }

    #[tokio::test]
    async fn publish_refuses_when_disconnected() {
        let client = BrokerClient::new(unreachable_config());
        assert!(!client.publish("site/status", b"online".to_vec(), true).await);
        assert_eq!(client.stats().messages_published, 0);
    }

    #[tokio::test]
    async fn subscriptions_are_registered_while_disconnected() {
        let client = BrokerClient::new(unreachable_config());

        client.subscribe("site/sensors/#", |_, _| Ok(())).await;
        client.subscribe("site/status", |_, _| Ok(())).await;
        client.subscribe("site/alerts", |_, _| Ok(())).await;

        let mut topics = client.subscribed_topics().await;
        topics.sort();
        assert_eq!(topics, vec!["site/alerts", "site/sensors/#", "site/status"]);
    }

    #[tokio::test]
    async fn resubscribing_same_filter_replaces_handler() {
        let client = BrokerClient::new(unreachable_config());

        client.subscribe("site/status", |_, _| Ok(())).await;
        client.subscribe("site/status", |_, _| Ok(())).await;

        assert_eq!(client.subscribed_topics().await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_registration() {
        let client = BrokerClient::new(unreachable_config());

        client.subscribe("site/sensors/#", |_, _| Ok(())).await;
        client.subscribe("site/status", |_, _| Ok(())).await;
        client.unsubscribe("site/status").await;

        assert_eq!(client.subscribed_topics().await, vec!["site/sensors/#"]);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let client = BrokerClient::new(unreachable_config());
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn state_starts_disconnected() {
        let client = BrokerClient::new(unreachable_config());
        let state = client.state();
        assert!(matches!(
            *state.borrow(),
            ConnectionState::Disconnected(_)
        ));
    }
}
