//! The publishing gateway.
//!
//! Turns live sensor state into a steady stream of broker messages. A
//! dedicated loop task runs once per `publish_interval`: collect a reading
//! from every registered sensor into the buffer, drain the buffer in
//! batches to per-sensor topics while connected, publish a retained
//! heartbeat every 30 seconds, and evaluate the capacity alert threshold
//! every 60 seconds. The loop is cancellable at its wait boundary;
//! `stop()` joins it under a bounded timeout.
//!
//! Delivery is deliberately at-most-once: a reading leaves the buffer the
//! moment it is handed to the broker client and is never re-enqueued, even
//! when the publish fails. Failures of any kind inside the loop become
//! counter increments plus log output; they never abort the loop.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use parkgate_mqtt::{BrokerClient, ClientStats};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    codec::{AlertSeverity, Details, GatewayStatus, MessageCodec},
    lock,
    sensors::{Reading, SensorSource},
};
use crate::config::gateway::{GatewayConfig, TopicsConfig};

/// Wall-clock interval between retained heartbeat/status publishes,
/// tracked independently of the loop's own cadence.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Wall-clock interval between capacity alert evaluations.
const ALERT_INTERVAL: Duration = Duration::from_secs(60);

/// How long `stop()` waits for the loop task before proceeding anyway.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fatal-for-this-attempt gateway failures. The caller may retry `start()`.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("could not connect to broker after {attempts} attempts")]
    BrokerUnreachable { attempts: u32 },
}

/// Counters mutated by the loop task and read by stats consumers.
#[derive(Debug, Default)]
struct GatewayStats {
    readings_collected: u64,
    readings_published: u64,
    errors: u64,
    alerts_sent: u64,
    sensors_registered: u64,
    buffer_size: usize,
    start_time: Option<OffsetDateTime>,
}

/// Immutable stats snapshot for external monitoring consumers.
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub gateway_id: String,
    pub gateway_name: String,
    pub running: bool,
    pub uptime_seconds: u64,
    pub sensors_registered: u64,
    pub readings_collected: u64,
    pub readings_published: u64,
    pub alerts_sent: u64,
    pub errors: u64,
    pub buffer_size: usize,
    pub broker: ClientStats,
}

/// The publisher side of the pipeline.
pub struct Gateway {
    config: GatewayConfig,
    topics: TopicsConfig,
    client: Arc<BrokerClient>,
    // Shared between start/stop (this struct) and the loop task; the codec
    // itself is not thread-safe, the mutex is the required external
    // synchronization. One instance per gateway keeps message_id strictly
    // increasing across start/stop cycles within the process.
    codec: Arc<Mutex<MessageCodec>>,
    sensors: Arc<RwLock<Vec<Arc<dyn SensorSource>>>>,
    stats: Arc<Mutex<GatewayStats>>,
    running: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, topics: TopicsConfig, client: Arc<BrokerClient>) -> Self {
        let codec = Arc::new(Mutex::new(MessageCodec::new(config.id.clone())));
        Self {
            config,
            topics,
            client,
            codec,
            sensors: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(Mutex::new(GatewayStats::default())),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Appends a sensor to the managed list. Sensors may be registered
    /// before or after `start()`.
    pub fn register_sensor(&self, sensor: Arc<dyn SensorSource>) {
        info!(
            "registered sensor {} ({}) at {}",
            sensor.serial_number(),
            sensor.protocol(),
            sensor.location()
        );
        self.sensors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sensor);
        lock(&self.stats).sensors_registered += 1;
    }

    pub fn register_sensors(&self, sensors: impl IntoIterator<Item = Arc<dyn SensorSource>>) {
        for sensor in sensors {
            self.register_sensor(sensor);
        }
    }

    /// Connects to the broker and launches the publish loop.
    ///
    /// A failed connection leaves the gateway in a clean not-running state;
    /// the caller may call `start()` again later.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.running.load(Ordering::Acquire) {
            warn!("gateway '{}' is already running", self.config.name);
            return Ok(());
        }

        info!("starting gateway '{}'...", self.config.name);
        if !self.client.connect_with_config().await {
            error!("failed to connect to broker, gateway not started");
            return Err(GatewayError::BrokerUnreachable {
                attempts: self.client.config().connect_retry_attempts,
            });
        }

        lock(&self.stats).start_time = Some(OffsetDateTime::now_utc());
        self.running.store(true, Ordering::Release);

        // Initial retained status so late subscribers see us immediately.
        let details = status_details(&self.sensors, &self.stats);
        publish_status(
            &self.client,
            &self.codec,
            &self.topics,
            GatewayStatus::Online,
            details,
        )
        .await;

        let cancel = CancellationToken::new();
        *lock(&self.cancel) = Some(cancel.clone());

        let worker = PublishLoop {
            config: self.config.clone(),
            topics: self.topics.clone(),
            client: self.client.clone(),
            codec: self.codec.clone(),
            sensors: self.sensors.clone(),
            stats: self.stats.clone(),
            buffer: VecDeque::new(),
        };
        *lock(&self.loop_handle) = Some(tokio::spawn(worker.run(cancel)));

        let sensor_count = self.sensors.read().unwrap_or_else(|e| e.into_inner()).len();
        info!(
            "gateway '{}' started with {} sensors",
            self.config.name, sensor_count
        );
        Ok(())
    }

    /// Signals the loop to terminate, joins it under a bounded timeout,
    /// best-effort publishes a retained "offline" status, and disconnects.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping gateway '{}'...", self.config.name);

        if let Some(cancel) = lock(&self.cancel).take() {
            cancel.cancel();
        }
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle {
            if timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("publish loop did not stop within {STOP_TIMEOUT:?}, proceeding");
            }
        }

        // Best-effort offline status; failures here are swallowed.
        publish_status(
            &self.client,
            &self.codec,
            &self.topics,
            GatewayStatus::Offline,
            Details::new(),
        )
        .await;

        self.client.disconnect().await;
        info!("gateway '{}' stopped", self.config.name);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Immutable stats snapshot for any external monitoring layer.
    pub fn get_stats(&self) -> GatewaySnapshot {
        let stats = lock(&self.stats);
        let uptime_seconds = stats
            .start_time
            .map(|start| (OffsetDateTime::now_utc() - start).whole_seconds().max(0) as u64)
            .unwrap_or(0);
        GatewaySnapshot {
            gateway_id: self.config.id.clone(),
            gateway_name: self.config.name.clone(),
            running: self.is_running(),
            uptime_seconds,
            sensors_registered: stats.sensors_registered,
            readings_collected: stats.readings_collected,
            readings_published: stats.readings_published,
            alerts_sent: stats.alerts_sent,
            errors: stats.errors,
            buffer_size: stats.buffer_size,
            broker: self.client.stats(),
        }
    }
}

/// The loop task state. The reading buffer lives here, unshared: the
/// collect step writes it and the publish step drains it on the same task,
/// so no synchronization is needed. Splitting those steps across tasks
/// would require making the buffer a synchronized queue.
struct PublishLoop {
    config: GatewayConfig,
    topics: TopicsConfig,
    client: Arc<BrokerClient>,
    codec: Arc<Mutex<MessageCodec>>,
    sensors: Arc<RwLock<Vec<Arc<dyn SensorSource>>>>,
    stats: Arc<Mutex<GatewayStats>>,
    buffer: VecDeque<Reading>,
}

impl PublishLoop {
    async fn run(mut self, cancel: CancellationToken) {
        info!(
            "publish loop started (interval: {}s)",
            self.config.publish_interval
        );
        let interval = Duration::from_secs(self.config.publish_interval);
        let mut last_status = Instant::now();
        let mut last_alert = Instant::now();

        loop {
            self.collect_readings().await;

            if self.client.is_connected() {
                self.publish_readings().await;

                if last_status.elapsed() >= STATUS_INTERVAL {
                    self.publish_heartbeat().await;
                    last_status = Instant::now();
                }
                if last_alert.elapsed() >= ALERT_INTERVAL {
                    self.check_alerts().await;
                    last_alert = Instant::now();
                }
            }

            lock(&self.stats).buffer_size = self.buffer.len();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }

        info!("publish loop stopped");
    }

    /// Collects one reading from every registered sensor. A failing sensor
    /// is counted and logged; the remaining sensors still collect.
    async fn collect_readings(&mut self) {
        let sensors: Vec<Arc<dyn SensorSource>> = self
            .sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for sensor in sensors {
            match sensor.collect().await {
                Ok(reading) => {
                    if reading.activity == 1 {
                        debug!(
                            "detection at {} ({} - {})",
                            reading.location, reading.protocol, reading.serial_number
                        );
                    }
                    self.buffer.push_back(reading);
                    lock(&self.stats).readings_collected += 1;
                }
                Err(err) => {
                    lock(&self.stats).errors += 1;
                    error!(
                        "failed to collect from sensor {}: {err}",
                        sensor.serial_number()
                    );
                }
            }
        }
    }

    /// Takes the next FIFO chunk of at most `batch_size` readings out of
    /// the buffer.
    fn next_chunk(&mut self) -> Vec<Reading> {
        let take = self.buffer.len().min(self.config.batch_size);
        self.buffer.drain(..take).collect()
    }

    /// Drains the buffer in chunks, publishing each reading to its
    /// sensor's topic. Once drained a reading is gone: a failed publish
    /// increments `errors` and the reading is dropped.
    async fn publish_readings(&mut self) {
        while !self.buffer.is_empty() {
            let chunk = self.next_chunk();
            for reading in chunk {
                let payload = { lock(&self.codec).format_reading(&reading) };
                match payload {
                    Ok(bytes) => {
                        let topic = self.topics.sensor_topic(&reading.serial_number);
                        if self.client.publish(&topic, bytes, false).await {
                            lock(&self.stats).readings_published += 1;
                        } else {
                            lock(&self.stats).errors += 1;
                        }
                    }
                    Err(err) => {
                        lock(&self.stats).errors += 1;
                        error!("failed to encode reading: {err}");
                    }
                }
            }
        }
    }

    /// Publishes the retained heartbeat summarizing the gateway.
    async fn publish_heartbeat(&mut self) {
        lock(&self.stats).buffer_size = self.buffer.len();
        let details = status_details(&self.sensors, &self.stats);
        publish_status(
            &self.client,
            &self.codec,
            &self.topics,
            GatewayStatus::Online,
            details,
        )
        .await;
    }

    /// Evaluates the site capacity threshold and emits an alert when it is
    /// crossed.
    async fn check_alerts(&mut self) {
        let total_detections: u64 = {
            let sensors = self.sensors.read().unwrap_or_else(|e| e.into_inner());
            sensors.iter().map(|s| s.total_detections()).sum()
        };
        let percentage = (total_detections as f64 / self.config.max_capacity as f64) * 100.0;

        let Some(severity) = capacity_level(percentage) else {
            return;
        };

        let message = match severity {
            AlertSeverity::High => format!("Site capacity critical: {percentage:.1}%"),
            _ => format!("Site capacity at {percentage:.1}%"),
        };
        let data = to_details(json!({
            "current": total_detections,
            "max": self.config.max_capacity,
        }));
        self.send_alert("capacity", severity, &message, data).await;
    }

    async fn send_alert(
        &mut self,
        alert_type: &str,
        severity: AlertSeverity,
        message: &str,
        data: Details,
    ) {
        let payload = { lock(&self.codec).format_alert(alert_type, severity, message, data) };
        match payload {
            Ok(bytes) => {
                let published = self
                    .client
                    .publish(&self.topics.alerts_topic(), bytes, false)
                    .await;
                lock(&self.stats).alerts_sent += 1;
                if published {
                    warn!("alert sent [{severity}]: {message}");
                } else {
                    warn!("alert could not be published [{severity}]: {message}");
                }
            }
            Err(err) => {
                lock(&self.stats).errors += 1;
                error!("failed to encode alert: {err}");
            }
        }
    }
}

/// Maps a capacity percentage onto an alert severity: `[80, 90)` is a
/// medium alert, `>= 90` is high, below 80 no alert is emitted.
fn capacity_level(percentage: f64) -> Option<AlertSeverity> {
    if percentage >= 90.0 {
        Some(AlertSeverity::High)
    } else if percentage >= 80.0 {
        Some(AlertSeverity::Medium)
    } else {
        None
    }
}

fn to_details(value: Value) -> Details {
    match value {
        Value::Object(map) => map,
        _ => Details::new(),
    }
}

/// Builds the status details block: sensor counts, uptime, counters, and
/// current buffer size.
fn status_details(
    sensors: &RwLock<Vec<Arc<dyn SensorSource>>>,
    stats: &Mutex<GatewayStats>,
) -> Details {
    let (connected, active) = {
        let sensors = sensors.read().unwrap_or_else(|e| e.into_inner());
        let active = sensors.iter().filter(|s| s.is_active()).count();
        (sensors.len(), active)
    };
    let stats = lock(stats);
    let uptime_seconds = stats
        .start_time
        .map(|start| (OffsetDateTime::now_utc() - start).whole_seconds().max(0))
        .unwrap_or(0);

    to_details(json!({
        "sensors_connected": connected,
        "sensors_active": active,
        "uptime_seconds": uptime_seconds,
        "readings_collected": stats.readings_collected,
        "readings_published": stats.readings_published,
        "errors": stats.errors,
        "buffer_size": stats.buffer_size,
    }))
}

/// Encodes and publishes a retained status envelope. Best-effort: encode
/// and publish failures are logged and swallowed.
async fn publish_status(
    client: &BrokerClient,
    codec: &Mutex<MessageCodec>,
    topics: &TopicsConfig,
    status: GatewayStatus,
    details: Details,
) {
    let payload = { lock(codec).format_status(status, details) };
    match payload {
        Ok(bytes) => {
            if !client.publish(&topics.status_topic(), bytes, true).await {
                debug!("status message not published");
            }
        }
        Err(err) => error!("failed to encode status message: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::{config::BrokerConfig, core::sensors::SensorError};

    /// Sensor double with scripted behavior.
    struct MockSensor {
        serial: String,
        fail: bool,
        total: AtomicU64,
    }

    impl MockSensor {
        fn ok(serial: &str) -> Arc<dyn SensorSource> {
            Arc::new(Self {
                serial: serial.to_string(),
                fail: false,
                total: AtomicU64::new(0),
            })
        }

        fn failing(serial: &str) -> Arc<dyn SensorSource> {
            Arc::new(Self {
                serial: serial.to_string(),
                fail: true,
                total: AtomicU64::new(0),
            })
        }

        fn with_detections(serial: &str, detections: u64) -> Arc<dyn SensorSource> {
            Arc::new(Self {
                serial: serial.to_string(),
                fail: false,
                total: AtomicU64::new(detections),
            })
        }
    }

    #[async_trait]
    impl SensorSource for MockSensor {
        fn serial_number(&self) -> &str {
            &self.serial
        }

        fn protocol(&self) -> &str {
            "Mock"
        }

        fn location(&self) -> &str {
            "test bench"
        }

        async fn collect(&self) -> Result<Reading, SensorError> {
            if self.fail {
                return Err(SensorError::Unresponsive {
                    serial_number: self.serial.clone(),
                    reason: "scripted failure".to_string(),
                });
            }
            let total = self.total.fetch_add(1, Ordering::AcqRel) + 1;
            Ok(Reading {
                serial_number: self.serial.clone(),
                protocol: "Mock".to_string(),
                location: "test bench".to_string(),
                activity: 1,
                timestamp: OffsetDateTime::now_utc(),
                total_detections: total,
                protocol_metadata: Details::new(),
            })
        }

        fn total_detections(&self) -> u64 {
            self.total.load(Ordering::Acquire)
        }

        fn is_active(&self) -> bool {
            true
        }
    }

    fn offline_client() -> Arc<BrokerClient> {
        // Loopback port 1: never connects, publish refuses immediately.
        Arc::new(BrokerClient::new(BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            connection_timeout: 1,
            connect_retry_attempts: 1,
            connect_retry_delay: 1,
            ..Default::default()
        }))
    }

    fn test_worker(batch_size: usize, sensors: Vec<Arc<dyn SensorSource>>) -> PublishLoop {
        let config = GatewayConfig {
            batch_size,
            publish_interval: 1,
            ..Default::default()
        };
        PublishLoop {
            config,
            topics: TopicsConfig::default(),
            client: offline_client(),
            codec: Arc::new(Mutex::new(MessageCodec::new("gateway_test"))),
            sensors: Arc::new(RwLock::new(sensors)),
            stats: Arc::new(Mutex::new(GatewayStats::default())),
            buffer: VecDeque::new(),
        }
    }

    #[tokio::test]
    async fn buffer_grows_by_one_per_sensor_when_all_succeed() {
        let mut worker = test_worker(
            10,
            vec![
                MockSensor::ok("S-1"),
                MockSensor::ok("S-2"),
                MockSensor::ok("S-3"),
            ],
        );

        worker.collect_readings().await;

        assert_eq!(worker.buffer.len(), 3);
        assert_eq!(lock(&worker.stats).readings_collected, 3);
        assert_eq!(lock(&worker.stats).errors, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn one_failing_sensor_does_not_block_the_others() {
        let mut worker = test_worker(
            10,
            vec![
                MockSensor::ok("S-1"),
                MockSensor::failing("S-2"),
                MockSensor::ok("S-3"),
            ],
        );

        worker.collect_readings().await;

        assert_eq!(worker.buffer.len(), 2);
        assert_eq!(lock(&worker.stats).readings_collected, 2);
        assert_eq!(lock(&worker.stats).errors, 1);
        assert!(logs_contain("failed to collect from sensor S-2"));
    }

    #[tokio::test]
    async fn buffer_drains_in_batch_size_chunks() {
        let mut worker = test_worker(4, vec![MockSensor::ok("S-1")]);
        for _ in 0..10 {
            worker.collect_readings().await;
        }
        assert_eq!(worker.buffer.len(), 10);

        // ceil(10 / 4) chunks: 4, 4, then the 10 mod 4 remainder.
        let mut chunk_sizes = Vec::new();
        while !worker.buffer.is_empty() {
            chunk_sizes.push(worker.next_chunk().len());
        }
        assert_eq!(chunk_sizes, vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn failed_publishes_drop_readings_and_count_errors() {
        let mut worker = test_worker(4, vec![MockSensor::ok("S-1"), MockSensor::ok("S-2")]);
        worker.collect_readings().await;
        assert_eq!(worker.buffer.len(), 2);

        // The client never connected, so every publish fails; the readings
        // are gone regardless (at-most-once).
        worker.publish_readings().await;

        assert!(worker.buffer.is_empty());
        let stats = lock(&worker.stats);
        assert_eq!(stats.readings_published, 0);
        assert_eq!(stats.errors, 2);
    }

    #[test]
    fn capacity_thresholds_match_the_alert_policy() {
        let pct = |total: u64, max: u64| (total as f64 / max as f64) * 100.0;

        assert_eq!(capacity_level(pct(4100, 5000)), Some(AlertSeverity::Medium)); // 82.0
        assert_eq!(capacity_level(pct(4600, 5000)), Some(AlertSeverity::High)); // 92.0
        assert_eq!(capacity_level(pct(3000, 5000)), None); // 60.0
        assert_eq!(capacity_level(80.0), Some(AlertSeverity::Medium));
        assert_eq!(capacity_level(90.0), Some(AlertSeverity::High));
        assert_eq!(capacity_level(89.9), Some(AlertSeverity::Medium));
    }

    #[tokio::test]
    async fn capacity_alert_increments_alerts_sent() {
        let mut worker = test_worker(10, vec![MockSensor::with_detections("S-1", 4100)]);

        worker.check_alerts().await;

        assert_eq!(lock(&worker.stats).alerts_sent, 1);
    }

    #[tokio::test]
    async fn no_alert_below_the_threshold() {
        let mut worker = test_worker(10, vec![MockSensor::with_detections("S-1", 3000)]);

        worker.check_alerts().await;

        assert_eq!(lock(&worker.stats).alerts_sent, 0);
    }

    #[tokio::test]
    async fn loop_exits_promptly_on_cancellation() {
        let worker = test_worker(10, vec![MockSensor::ok("S-1")]);
        let stats = worker.stats.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(worker.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit promptly")
            .expect("loop task should not panic");
        assert!(lock(&stats).readings_collected >= 1);
    }

    #[tokio::test]
    async fn start_against_unreachable_broker_leaves_gateway_not_running() {
        let gateway = Gateway::new(
            GatewayConfig::default(),
            TopicsConfig::default(),
            offline_client(),
        );
        gateway.register_sensor(MockSensor::ok("S-1"));

        let result = gateway.start().await;

        assert!(matches!(
            result,
            Err(GatewayError::BrokerUnreachable { attempts: 1 })
        ));
        assert!(!gateway.is_running());
        // stop() on a never-started gateway is a no-op.
        gateway.stop().await;
    }

    #[tokio::test]
    async fn snapshot_reflects_registrations() {
        let gateway = Gateway::new(
            GatewayConfig::default(),
            TopicsConfig::default(),
            offline_client(),
        );
        gateway.register_sensors([MockSensor::ok("S-1"), MockSensor::ok("S-2")]);

        let snapshot = gateway.get_stats();
        assert_eq!(snapshot.sensors_registered, 2);
        assert!(!snapshot.running);
        assert_eq!(snapshot.uptime_seconds, 0);
        assert_eq!(snapshot.gateway_id, "gateway_001");
    }
}
