//! Gateway, topic, subscriber, and sensor configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Gateway identity and pipeline cadence.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// Stable gateway identifier, embedded in every envelope.
    #[validate(length(min = 1, message = "Gateway id must not be empty"))]
    pub id: String,

    /// Human-readable gateway name used in logs.
    pub name: String,

    /// Seconds between collection ticks.
    #[validate(range(min = 1, message = "Publish interval must be at least 1 second"))]
    pub publish_interval: u64,

    /// Maximum readings drained from the buffer per publish chunk.
    #[validate(range(min = 1, message = "Batch size must be at least 1"))]
    pub batch_size: usize,

    /// Site capacity used for the threshold alert:
    /// `sum(total_detections) / max_capacity * 100`.
    #[validate(range(min = 1, message = "Max capacity must be at least 1"))]
    pub max_capacity: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: "gateway_001".to_string(),
            name: "Main gateway".to_string(),
            publish_interval: 2,
            batch_size: 10,
            max_capacity: 5000,
        }
    }
}

/// Topic prefix and subtopic names.
///
/// The full scheme is:
/// - per-sensor readings: `{prefix}/{sensors}/{serial_number}`
/// - status (retained): `{prefix}/{status}`
/// - alerts: `{prefix}/{alerts}`
/// - commands (reserved, not consumed by this pipeline): `{prefix}/{commands}`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TopicsConfig {
    #[validate(length(min = 1, message = "Topic prefix must not be empty"))]
    pub prefix: String,

    #[validate(length(min = 1, message = "Sensors subtopic must not be empty"))]
    pub sensors: String,

    #[validate(length(min = 1, message = "Status subtopic must not be empty"))]
    pub status: String,

    #[validate(length(min = 1, message = "Alerts subtopic must not be empty"))]
    pub alerts: String,

    #[validate(length(min = 1, message = "Commands subtopic must not be empty"))]
    pub commands: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            prefix: "parkgate/site".to_string(),
            sensors: "sensors".to_string(),
            status: "status".to_string(),
            alerts: "alerts".to_string(),
            commands: "commands".to_string(),
        }
    }
}

impl TopicsConfig {
    /// Topic for one sensor's readings.
    pub fn sensor_topic(&self, serial_number: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.sensors, serial_number)
    }

    /// Wildcard covering every per-sensor reading topic.
    pub fn sensors_wildcard(&self) -> String {
        format!("{}/{}/#", self.prefix, self.sensors)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/{}", self.prefix, self.status)
    }

    pub fn alerts_topic(&self) -> String {
        format!("{}/{}", self.prefix, self.alerts)
    }

    pub fn commands_topic(&self) -> String {
        format!("{}/{}", self.prefix, self.commands)
    }
}

/// Subscriber side settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SubscriberConfig {
    /// Whether the binary also runs the consumer side in-process.
    pub enabled: bool,

    /// Client id for the subscriber's own broker connection.
    #[validate(length(min = 1, message = "Subscriber client id must not be empty"))]
    pub client_id: String,

    /// Bound on the in-memory reading cache; oldest entries are evicted
    /// first once exceeded.
    #[validate(range(min = 1, message = "Max cache size must be at least 1"))]
    pub max_cache_size: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client_id: "subscriber_001".to_string(),
            max_cache_size: 1000,
        }
    }
}

/// One simulated sensor registered by the binary.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SensorSpec {
    /// Transport family: `lora`, `zigbee`, `sigfox`, or `rfid`.
    #[validate(length(min = 1, message = "Sensor protocol must not be empty"))]
    pub protocol: String,

    /// Placement of the sensor on site.
    #[validate(length(min = 1, message = "Sensor location must not be empty"))]
    pub location: String,

    /// Serial number; generated from the protocol name when empty.
    pub serial_number: String,

    /// Probability of a detection on each collection tick.
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "Detection probability must be between 0 and 1"
    ))]
    pub detection_probability: f64,
}

impl Default for SensorSpec {
    fn default() -> Self {
        Self {
            protocol: "lora".to_string(),
            location: "unknown".to_string(),
            serial_number: String::new(),
            detection_probability: 0.3,
        }
    }
}

/// The set of sensors the binary registers at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SensorsConfig {
    #[validate(nested)]
    pub enabled: Vec<SensorSpec>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        let enabled = [
            ("lora", "Main entrance"),
            ("zigbee", "North exit"),
            ("sigfox", "South gate"),
            ("rfid", "Turnstile 1"),
        ]
        .into_iter()
        .map(|(protocol, location)| SensorSpec {
            protocol: protocol.to_string(),
            location: location.to_string(),
            ..Default::default()
        })
        .collect();

        Self { enabled }
    }
}
