//! The consumer side of the pipeline.
//!
//! The subscriber connects its own broker client, subscribes to the
//! gateway's topics, and maintains a bounded in-memory view of recent
//! traffic. The broker I/O task never decodes anything: subscription
//! handlers only push `(category, payload)` onto a bounded channel, and a
//! dedicated consumer task parses envelopes, feeds the cache, updates
//! counters, and invokes user callbacks. A slow or faulty callback can
//! therefore never stall the connection kernel.
//!
//! Decode failures are dropped messages, not crashes: they increment
//! `errors` and the consumer moves on.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::Path,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use bytes::Bytes;
use parkgate_mqtt::{BrokerClient, ClientStats};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    codec::{Envelope, GatewayStatus, MessageCodec, ReadingEnvelope},
    lock,
};
use crate::config::{
    gateway::{SubscriberConfig, TopicsConfig},
    BrokerConfig,
};

/// Bound on the hand-off channel between the broker I/O task and the
/// consumer task. When full, further messages are dropped and counted.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Routing key for inbound messages and user callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    Sensor,
    Status,
    Alert,
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MessageCategory::Sensor => "sensor",
            MessageCategory::Status => "status",
            MessageCategory::Alert => "alert",
        };
        write!(f, "{label}")
    }
}

/// User-supplied handler for decoded envelopes of one category.
pub type EnvelopeCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SubscriberError {
    #[error("could not connect to broker after {attempts} attempts")]
    BrokerUnreachable { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize export: {0}")]
    Export(#[from] serde_json::Error),
}

/// Counters mutated by the consumer task (and by handlers when the queue
/// overflows).
#[derive(Debug, Default)]
struct SubscriberStats {
    sensor_readings: u64,
    status_updates: u64,
    alerts_received: u64,
    errors: u64,
    start_time: Option<OffsetDateTime>,
}

/// Immutable stats snapshot for external monitoring consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberSnapshot {
    pub client_id: String,
    pub uptime_seconds: u64,
    pub sensor_readings: u64,
    pub status_updates: u64,
    pub alerts_received: u64,
    pub errors: u64,
    pub cache_size: usize,
    pub broker: ClientStats,
}

/// Consumer-side state: the bounded cache, user callbacks, and counters.
/// Owned by the consumer task; queries lock briefly.
struct Inbox {
    max_cache_size: usize,
    cache: Mutex<VecDeque<ReadingEnvelope>>,
    callbacks: RwLock<HashMap<MessageCategory, EnvelopeCallback>>,
    stats: Mutex<SubscriberStats>,
}

impl Inbox {
    fn new(max_cache_size: usize) -> Self {
        Self {
            max_cache_size,
            cache: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(HashMap::new()),
            stats: Mutex::new(SubscriberStats::default()),
        }
    }

    /// Decodes one inbound message and routes it by category.
    fn handle(&self, category: MessageCategory, payload: &[u8]) {
        let envelope = match MessageCodec::parse(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                lock(&self.stats).errors += 1;
                warn!("dropping malformed {category} message: {err}");
                return;
            }
        };

        match (category, envelope) {
            (MessageCategory::Sensor, Envelope::Reading(reading)) => {
                {
                    let mut cache = lock(&self.cache);
                    cache.push_back(reading.clone());
                    // FIFO eviction keeps the cache bounded.
                    while cache.len() > self.max_cache_size {
                        cache.pop_front();
                    }
                }
                lock(&self.stats).sensor_readings += 1;

                if reading.data.activity == 1 {
                    info!(
                        "detection at {} [{} - {}]",
                        reading.sensor.location,
                        reading.sensor.protocol,
                        reading.sensor.serial_number
                    );
                }
                self.dispatch(MessageCategory::Sensor, &Envelope::Reading(reading));
            }
            (MessageCategory::Status, Envelope::Status(status)) => {
                lock(&self.stats).status_updates += 1;
                match status.status {
                    GatewayStatus::Online => info!(
                        "gateway {} online (sensors: {})",
                        status.gateway_id,
                        status
                            .details
                            .get("sensors_connected")
                            .cloned()
                            .unwrap_or_default()
                    ),
                    GatewayStatus::Offline => warn!("gateway {} offline", status.gateway_id),
                }
                self.dispatch(MessageCategory::Status, &Envelope::Status(status));
            }
            (MessageCategory::Alert, Envelope::Alert(alert)) => {
                lock(&self.stats).alerts_received += 1;
                warn!("alert [{}]: {}", alert.severity, alert.message);
                self.dispatch(MessageCategory::Alert, &Envelope::Alert(alert));
            }
            (category, _) => {
                lock(&self.stats).errors += 1;
                warn!("unexpected envelope on {category} topic, dropping");
            }
        }
    }

    fn dispatch(&self, category: MessageCategory, envelope: &Envelope) {
        let callback = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&category)
            .cloned();
        if let Some(callback) = callback {
            callback(envelope);
        }
    }
}

/// The consumer side of the pipeline.
pub struct Subscriber {
    config: SubscriberConfig,
    topics: TopicsConfig,
    client: Arc<BrokerClient>,
    inbox: Arc<Inbox>,
    cancel: Mutex<Option<CancellationToken>>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Creates a subscriber with its own broker connection (the configured
    /// subscriber client id overrides the shared broker table's id).
    pub fn new(config: SubscriberConfig, topics: TopicsConfig, broker: BrokerConfig) -> Self {
        let client = Arc::new(BrokerClient::new(
            broker.with_client_id(config.client_id.clone()),
        ));
        let inbox = Arc::new(Inbox::new(config.max_cache_size));
        Self {
            config,
            topics,
            client,
            inbox,
            cancel: Mutex::new(None),
            consumer_handle: Mutex::new(None),
        }
    }

    /// Connects, subscribes the sensor wildcard plus the status and alert
    /// topics, and starts the consumer task.
    pub async fn start(&self) -> Result<(), SubscriberError> {
        info!("starting subscriber '{}'...", self.config.client_id);

        if !self.client.connect_with_config().await {
            error!("failed to connect to broker, subscriber not started");
            return Err(SubscriberError::BrokerUnreachable {
                attempts: self.client.config().connect_retry_attempts,
            });
        }

        let (tx, mut rx) = mpsc::channel::<(MessageCategory, Bytes)>(INBOUND_QUEUE_CAPACITY);

        let routes = [
            (MessageCategory::Sensor, self.topics.sensors_wildcard()),
            (MessageCategory::Status, self.topics.status_topic()),
            (MessageCategory::Alert, self.topics.alerts_topic()),
        ];
        for (category, topic) in routes {
            let tx = tx.clone();
            let inbox = self.inbox.clone();
            self.client
                .subscribe(&topic, move |_topic, payload| {
                    // Hand off to the consumer task; decoding and user
                    // callbacks never run on the broker I/O task.
                    if tx
                        .try_send((category, Bytes::copy_from_slice(payload)))
                        .is_err()
                    {
                        lock(&inbox.stats).errors += 1;
                        return Err(format!("inbound queue full, dropped {category} message").into());
                    }
                    Ok(())
                })
                .await;
        }

        lock(&self.inbox.stats).start_time = Some(OffsetDateTime::now_utc());

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());
        let inbox = self.inbox.clone();
        *lock(&self.consumer_handle) = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some((category, payload)) => inbox.handle(category, &payload),
                        None => break,
                    }
                }
            }
            debug!("subscriber consumer stopped");
        }));

        info!("subscriber '{}' started, awaiting messages", self.config.client_id);
        Ok(())
    }

    /// Stops the consumer task and disconnects the broker client.
    pub async fn stop(&self) {
        info!("stopping subscriber '{}'...", self.config.client_id);
        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
        let handle = lock(&self.consumer_handle).take();
        if let Some(handle) = handle {
            let _ = timeout(Duration::from_secs(2), handle).await;
        }
        self.client.disconnect().await;
        info!("subscriber '{}' stopped", self.config.client_id);
    }

    /// Registers the user handler for one message category. Only one
    /// handler per category; a later registration replaces the earlier.
    pub fn set_callback<F>(&self, category: MessageCategory, callback: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inbox
            .callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(category, Arc::new(callback));
        info!("callback registered for {category} messages");
    }

    /// The most recent cached readings, oldest first, at most `limit`.
    pub fn get_recent_readings(&self, limit: usize) -> Vec<ReadingEnvelope> {
        let cache = lock(&self.inbox.cache);
        let skip = cache.len().saturating_sub(limit);
        cache.iter().skip(skip).cloned().collect()
    }

    /// All cached readings produced by one sensor.
    pub fn get_readings_by_sensor(&self, serial_number: &str) -> Vec<ReadingEnvelope> {
        lock(&self.inbox.cache)
            .iter()
            .filter(|r| r.sensor.serial_number == serial_number)
            .cloned()
            .collect()
    }

    /// Immutable stats snapshot for external monitoring consumers.
    pub fn get_stats(&self) -> SubscriberSnapshot {
        let cache_size = lock(&self.inbox.cache).len();
        let stats = lock(&self.inbox.stats);
        let uptime_seconds = stats
            .start_time
            .map(|start| (OffsetDateTime::now_utc() - start).whole_seconds().max(0) as u64)
            .unwrap_or(0);
        SubscriberSnapshot {
            client_id: self.config.client_id.clone(),
            uptime_seconds,
            sensor_readings: stats.sensor_readings,
            status_updates: stats.status_updates,
            alerts_received: stats.alerts_received,
            errors: stats.errors,
            cache_size,
            broker: self.client.stats(),
        }
    }

    /// Writes a JSON snapshot of the stats and the full cache to `path`.
    /// Not part of the hot path.
    pub fn export_data(&self, path: &Path) -> Result<(), SubscriberError> {
        #[derive(Serialize)]
        struct Export {
            #[serde(with = "time::serde::rfc3339")]
            export_time: OffsetDateTime,
            stats: SubscriberSnapshot,
            readings: Vec<ReadingEnvelope>,
        }

        let export = Export {
            export_time: OffsetDateTime::now_utc(),
            stats: self.get_stats(),
            readings: lock(&self.inbox.cache).iter().cloned().collect(),
        };
        let payload = serde_json::to_vec_pretty(&export)?;
        std::fs::write(path, payload)?;

        info!(
            "exported {} cached readings to {}",
            export.readings.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::sensors::Reading;

    fn reading_payload(codec: &mut MessageCodec, serial: &str) -> Vec<u8> {
        let reading = Reading {
            serial_number: serial.to_string(),
            protocol: "LoRa".to_string(),
            location: "Main entrance".to_string(),
            activity: 1,
            timestamp: OffsetDateTime::now_utc(),
            total_detections: 1,
            protocol_metadata: Default::default(),
        };
        codec.format_reading(&reading).expect("encode")
    }

    fn test_subscriber(max_cache_size: usize) -> Subscriber {
        let config = SubscriberConfig {
            max_cache_size,
            ..Default::default()
        };
        let broker = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout: 1,
            connect_retry_attempts: 1,
            connect_retry_delay: 1,
            ..Default::default()
        };
        Subscriber::new(config, TopicsConfig::default(), broker)
    }

    #[test]
    fn cache_is_bounded_with_fifo_eviction() {
        let subscriber = test_subscriber(3);
        let mut codec = MessageCodec::new("gw");

        for i in 1..=5 {
            let payload = reading_payload(&mut codec, &format!("S-{i}"));
            subscriber.inbox.handle(MessageCategory::Sensor, &payload);
        }

        let cached = subscriber.get_recent_readings(10);
        assert_eq!(cached.len(), 3);
        // The two oldest entries were evicted first.
        let serials: Vec<&str> = cached.iter().map(|r| r.sensor.serial_number.as_str()).collect();
        assert_eq!(serials, vec!["S-3", "S-4", "S-5"]);
        assert_eq!(subscriber.get_stats().sensor_readings, 5);
    }

    #[test]
    fn malformed_payloads_are_counted_and_dropped() {
        let subscriber = test_subscriber(10);

        subscriber
            .inbox
            .handle(MessageCategory::Sensor, b"{ definitely not json");

        let stats = subscriber.get_stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.sensor_readings, 0);
        assert_eq!(stats.cache_size, 0);
    }

    #[test]
    fn wrong_category_envelope_is_counted_and_dropped() {
        let subscriber = test_subscriber(10);
        let mut codec = MessageCodec::new("gw");
        let status = codec
            .format_status(GatewayStatus::Online, Default::default())
            .expect("encode");

        subscriber.inbox.handle(MessageCategory::Sensor, &status);

        let stats = subscriber.get_stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.cache_size, 0);
    }

    #[test]
    fn status_and_alert_messages_update_their_counters() {
        let subscriber = test_subscriber(10);
        let mut codec = MessageCodec::new("gw");

        let status = codec
            .format_status(GatewayStatus::Online, Default::default())
            .expect("encode");
        subscriber.inbox.handle(MessageCategory::Status, &status);

        let alert = codec
            .format_alert(
                "capacity",
                super::super::codec::AlertSeverity::High,
                "Site capacity critical: 92.0%",
                Default::default(),
            )
            .expect("encode");
        subscriber.inbox.handle(MessageCategory::Alert, &alert);

        let stats = subscriber.get_stats();
        assert_eq!(stats.status_updates, 1);
        assert_eq!(stats.alerts_received, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn callbacks_fire_and_last_registration_wins() {
        let subscriber = test_subscriber(10);
        let mut codec = MessageCodec::new("gw");

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = first.clone();
            subscriber.set_callback(MessageCategory::Sensor, move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = second.clone();
            subscriber.set_callback(MessageCategory::Sensor, move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        let payload = reading_payload(&mut codec, "S-1");
        subscriber.inbox.handle(MessageCategory::Sensor, &payload);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queries_filter_and_limit_the_cache() {
        let subscriber = test_subscriber(10);
        let mut codec = MessageCodec::new("gw");

        for serial in ["S-1", "S-2", "S-1", "S-3"] {
            let payload = reading_payload(&mut codec, serial);
            subscriber.inbox.handle(MessageCategory::Sensor, &payload);
        }

        assert_eq!(subscriber.get_recent_readings(2).len(), 2);
        assert_eq!(subscriber.get_readings_by_sensor("S-1").len(), 2);
        assert_eq!(subscriber.get_readings_by_sensor("S-9").len(), 0);
    }

    #[test]
    fn export_writes_a_parseable_snapshot() {
        let subscriber = test_subscriber(10);
        let mut codec = MessageCodec::new("gw");
        for i in 0..3 {
            let payload = reading_payload(&mut codec, &format!("S-{i}"));
            subscriber.inbox.handle(MessageCategory::Sensor, &payload);
        }

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("subscriber_data.json");
        subscriber.export_data(&path).expect("export");

        let raw = std::fs::read(&path).expect("read back");
        let value: serde_json::Value = serde_json::from_slice(&raw).expect("valid json");
        assert_eq!(value["readings"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["stats"]["sensor_readings"], 3);
        assert!(value["export_time"].is_string());
    }

    #[tokio::test]
    async fn start_against_unreachable_broker_fails_cleanly() {
        let subscriber = test_subscriber(10);

        let result = subscriber.start().await;

        assert!(matches!(
            result,
            Err(SubscriberError::BrokerUnreachable { attempts: 1 })
        ));
        // stop() after a failed start is a safe no-op.
        subscriber.stop().await;
    }
}
