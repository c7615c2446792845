//! Wire envelope types and the message codec.
//!
//! Every message the gateway publishes is a typed envelope serialized as
//! UTF-8 JSON: a single sensor reading, a gateway status, an alert, or a
//! batch of readings. All envelopes carry the gateway id, an RFC 3339
//! timestamp, and a `message_id` drawn from the codec's monotonic counter.
//!
//! The codec's only state is that counter. It is **not** safe for
//! concurrent use from multiple tasks without external synchronization;
//! the gateway wraps its instance in a mutex because `start`/`stop` and the
//! publish loop both format envelopes. Parsing is stateless and free of
//! that constraint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;

use super::sensors::Reading;

/// Free-form key/value payload carried by status, alert, and reading
/// metadata sections.
pub type Details = Map<String, Value>;

/// Encoding or decoding failure. A `Decode` error means the inbound message
/// is dropped and counted, never that the consumer crashes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Gateway operational status carried by [`StatusEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Online,
    Offline,
}

/// Alert severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        };
        write!(f, "{label}")
    }
}

/// Identity block of the producing sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub serial_number: String,
    pub protocol: String,
    pub location: String,
}

/// Measurement block of a reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingData {
    pub activity: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub total_detections: u64,
}

/// One sensor reading on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingEnvelope {
    pub message_id: u64,
    pub gateway_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub sensor: SensorInfo,
    pub data: ReadingData,
    pub metadata: Details,
}

/// Gateway heartbeat/status message, published retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub message_id: u64,
    pub gateway_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: GatewayStatus,
    pub details: Details,
}

/// Threshold-triggered alert message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub message_id: u64,
    pub alert_id: String,
    pub gateway_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub data: Details,
}

/// A bounded group of readings published together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    pub message_id: u64,
    pub batch_id: String,
    pub gateway_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub count: usize,
    pub readings: Vec<ReadingEnvelope>,
}

/// Any inbound message. Variants are tried in order of decreasing shape
/// specificity, so a reading is never mistaken for a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Batch(BatchEnvelope),
    Reading(ReadingEnvelope),
    Alert(AlertEnvelope),
    Status(StatusEnvelope),
}

/// Serializes domain values into wire envelopes and back.
///
/// `message_id` starts at 1 and strictly increases by one per formatted
/// envelope for the lifetime of the instance (a batch consumes one id per
/// contained reading plus one for the batch itself). The counter is plain
/// interior state: share a codec between tasks only behind a mutex.
#[derive(Debug)]
pub struct MessageCodec {
    gateway_id: String,
    message_count: u64,
}

impl MessageCodec {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            message_count: 0,
        }
    }

    fn next_message_id(&mut self) -> u64 {
        self.message_count += 1;
        self.message_count
    }

    /// Total envelopes formatted so far.
    pub fn messages_formatted(&self) -> u64 {
        self.message_count
    }

    /// Wraps a reading into its envelope, consuming one `message_id`.
    pub fn reading_envelope(&mut self, reading: &Reading) -> ReadingEnvelope {
        ReadingEnvelope {
            message_id: self.next_message_id(),
            gateway_id: self.gateway_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            sensor: SensorInfo {
                serial_number: reading.serial_number.clone(),
                protocol: reading.protocol.clone(),
                location: reading.location.clone(),
            },
            data: ReadingData {
                activity: reading.activity,
                timestamp: reading.timestamp,
                total_detections: reading.total_detections,
            },
            metadata: reading.protocol_metadata.clone(),
        }
    }

    /// Serializes one reading.
    pub fn format_reading(&mut self, reading: &Reading) -> Result<Vec<u8>, CodecError> {
        let envelope = self.reading_envelope(reading);
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    /// Serializes a status message.
    pub fn format_status(
        &mut self,
        status: GatewayStatus,
        details: Details,
    ) -> Result<Vec<u8>, CodecError> {
        let envelope = StatusEnvelope {
            message_id: self.next_message_id(),
            gateway_id: self.gateway_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            status,
            details,
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    /// Serializes an alert message.
    pub fn format_alert(
        &mut self,
        alert_type: &str,
        severity: AlertSeverity,
        message: &str,
        data: Details,
    ) -> Result<Vec<u8>, CodecError> {
        let message_id = self.next_message_id();
        let envelope = AlertEnvelope {
            message_id,
            alert_id: format!("{}_alert_{}", self.gateway_id, message_id),
            gateway_id: self.gateway_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            alert_type: alert_type.to_string(),
            severity,
            message: message.to_string(),
            data,
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    /// Serializes a batch of readings. Each contained reading consumes its
    /// own `message_id`, then the batch envelope consumes one more.
    pub fn format_batch(&mut self, readings: &[Reading]) -> Result<Vec<u8>, CodecError> {
        let wrapped: Vec<ReadingEnvelope> =
            readings.iter().map(|r| self.reading_envelope(r)).collect();
        let message_id = self.next_message_id();
        let envelope = BatchEnvelope {
            message_id,
            batch_id: format!("{}_batch_{}", self.gateway_id, message_id),
            gateway_id: self.gateway_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            count: wrapped.len(),
            readings: wrapped,
        };
        serde_json::to_vec(&envelope).map_err(CodecError::Encode)
    }

    /// Decodes an inbound payload into a typed envelope.
    pub fn parse(payload: &[u8]) -> Result<Envelope, CodecError> {
        serde_json::from_slice(payload).map_err(CodecError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn sample_reading() -> Reading {
        let metadata = match json!({
            "rssi_dbm": -65,
            "battery_level": 98.5,
            "spreading_factor": 7,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        Reading {
            serial_number: "LORA-12345".to_string(),
            protocol: "LoRa".to_string(),
            location: "Main entrance".to_string(),
            activity: 1,
            timestamp: datetime!(2025-10-14 10:30:00 UTC),
            total_detections: 42,
            protocol_metadata: metadata,
        }
    }

    #[test]
    fn message_ids_are_sequential_without_gaps() {
        let mut codec = MessageCodec::new("gateway_test");
        let reading = sample_reading();

        let ids: Vec<u64> = (0..5)
            .map(|_| {
                let bytes = codec.format_reading(&reading).expect("encode");
                match MessageCodec::parse(&bytes).expect("decode") {
                    Envelope::Reading(envelope) => envelope.message_id,
                    other => panic!("expected reading, got {other:?}"),
                }
            })
            .collect();

        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(codec.messages_formatted(), 5);
    }

    #[test]
    fn reading_round_trips_through_the_wire_format() {
        let mut codec = MessageCodec::new("gateway_test");
        let reading = sample_reading();

        let bytes = codec.format_reading(&reading).expect("encode");
        let envelope = match MessageCodec::parse(&bytes).expect("decode") {
            Envelope::Reading(envelope) => envelope,
            other => panic!("expected reading, got {other:?}"),
        };

        assert_eq!(envelope.gateway_id, "gateway_test");
        assert_eq!(envelope.sensor.serial_number, reading.serial_number);
        assert_eq!(envelope.sensor.protocol, reading.protocol);
        assert_eq!(envelope.sensor.location, reading.location);
        assert_eq!(envelope.data.activity, reading.activity);
        assert_eq!(envelope.data.timestamp, reading.timestamp);
        assert_eq!(envelope.data.total_detections, reading.total_detections);
        assert_eq!(envelope.metadata, reading.protocol_metadata);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        assert!(matches!(
            MessageCodec::parse(b"not json"),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(
            MessageCodec::parse(b"{\"unexpected\": true}"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn status_envelope_carries_state_and_details() {
        let mut codec = MessageCodec::new("gateway_test");
        let details = match json!({"sensors_connected": 4, "uptime_seconds": 3600}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let bytes = codec
            .format_status(GatewayStatus::Online, details)
            .expect("encode");

        let raw: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(raw["status"], "online");
        assert_eq!(raw["details"]["sensors_connected"], 4);

        match MessageCodec::parse(&bytes).expect("decode") {
            Envelope::Status(envelope) => {
                assert_eq!(envelope.status, GatewayStatus::Online);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn alert_envelope_uses_the_documented_id_format() {
        let mut codec = MessageCodec::new("gateway_test");
        let data = match json!({"current": 4100, "max": 5000}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let bytes = codec
            .format_alert("capacity", AlertSeverity::Medium, "Capacity at 82.0%", data)
            .expect("encode");

        match MessageCodec::parse(&bytes).expect("decode") {
            Envelope::Alert(envelope) => {
                assert_eq!(envelope.alert_id, "gateway_test_alert_1");
                assert_eq!(envelope.severity, AlertSeverity::Medium);
                assert_eq!(envelope.alert_type, "capacity");
                assert_eq!(envelope.data["max"], 5000);
            }
            other => panic!("expected alert, got {other:?}"),
        }
    }

    #[test]
    fn batch_consumes_one_id_per_reading_plus_one() {
        let mut codec = MessageCodec::new("gateway_test");
        let readings = vec![sample_reading(), sample_reading()];

        let bytes = codec.format_batch(&readings).expect("encode");
        let batch = match MessageCodec::parse(&bytes).expect("decode") {
            Envelope::Batch(envelope) => envelope,
            other => panic!("expected batch, got {other:?}"),
        };

        assert_eq!(batch.count, 2);
        assert_eq!(batch.readings[0].message_id, 1);
        assert_eq!(batch.readings[1].message_id, 2);
        assert_eq!(batch.message_id, 3);
        assert_eq!(batch.batch_id, "gateway_test_batch_3");
        assert_eq!(codec.messages_formatted(), 3);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertSeverity::Critical).expect("json"),
            "\"critical\""
        );
        assert_eq!(AlertSeverity::High.to_string(), "high");
    }
}
