//! The sensor boundary.
//!
//! Sensors are consumed through a single capability interface: produce one
//! detection record on demand. Concrete transports (LoRa, Zigbee, Sigfox,
//! RFID) are implementations behind [`SensorSource`], selected at
//! registration time rather than through a type hierarchy.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

pub mod sim;

/// Protocol-specific key/value fields attached to a reading (signal
/// strength, battery level, link quality, ...).
pub type ProtocolMetadata = Map<String, Value>;

/// One detection event, owned by the gateway's buffer from collection until
/// it is handed to the broker client, then discarded regardless of the
/// publish outcome.
#[derive(Debug, Clone)]
pub struct Reading {
    /// Stable identifier of the producing sensor.
    pub serial_number: String,

    /// Transport family tag (e.g. "LoRa", "Zigbee").
    pub protocol: String,

    /// Free-text placement of the sensor.
    pub location: String,

    /// Binary detection state: 0 = no detection, 1 = detection.
    pub activity: u8,

    /// Point in time of collection.
    pub timestamp: OffsetDateTime,

    /// The sensor's running detection counter at collection time.
    pub total_detections: u64,

    /// Protocol-specific fields.
    pub protocol_metadata: ProtocolMetadata,
}

/// Failure producing a single reading. Isolated per sensor per tick: one
/// failing sensor never blocks collection from the others.
#[derive(Debug, Error)]
pub enum SensorError {
    /// The sensor did not answer within its transport's expectations.
    #[error("sensor {serial_number} is not responding: {reason}")]
    Unresponsive {
        serial_number: String,
        reason: String,
    },

    /// The sensor answered with data that does not form a valid reading.
    #[error("sensor {serial_number} produced an invalid reading: {reason}")]
    InvalidReading {
        serial_number: String,
        reason: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A source of detection records.
///
/// `collect` may fail per call; the gateway records the error and moves on
/// to the next sensor. The accessor methods back the gateway's heartbeat
/// (active sensor count) and capacity alert (detection totals) without
/// triggering a collection, so implementations keep those counters in
/// interior thread-safe state.
#[async_trait]
pub trait SensorSource: Send + Sync + 'static {
    /// Stable serial number, also the last topic segment for this sensor's
    /// readings.
    fn serial_number(&self) -> &str;

    /// Transport family tag.
    fn protocol(&self) -> &str;

    /// Placement of the sensor.
    fn location(&self) -> &str;

    /// Produces one detection record.
    async fn collect(&self) -> Result<Reading, SensorError>;

    /// Running detection counter.
    fn total_detections(&self) -> u64;

    /// Whether the last produced reading was a detection.
    fn is_active(&self) -> bool;
}
