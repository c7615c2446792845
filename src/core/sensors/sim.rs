//! Simulated field sensors.
//!
//! Each simulator produces detection records with the protocol-specific
//! metadata a real device of that transport family would report: RSSI drift
//! and battery drain for LoRa, link quality for Zigbee, and so on. Detection
//! itself is a Bernoulli draw per collection tick.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use super::{ProtocolMetadata, Reading, SensorError, SensorSource};
use crate::config::gateway::SensorSpec;

/// Transport family of a simulated sensor.
#[derive(Debug, Clone)]
pub enum Protocol {
    /// Long-range, low-power; 915 MHz band, spreading factor 7-12.
    LoRa { spreading_factor: u8 },
    /// Mesh networking; reports a link quality indicator.
    Zigbee { node_type: String },
    /// Ultra-narrowband uplink with a small daily message budget.
    Sigfox,
    /// Short-range tag reader.
    Rfid { frequency_type: String },
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::LoRa { .. } => "LoRa",
            Protocol::Zigbee { .. } => "Zigbee",
            Protocol::Sigfox => "Sigfox",
            Protocol::Rfid { .. } => "RFID",
        }
    }

    /// Parses the config spelling of a protocol name.
    pub fn from_spec(name: &str) -> Option<Protocol> {
        match name.to_lowercase().as_str() {
            "lora" => Some(Protocol::LoRa {
                spreading_factor: 7,
            }),
            "zigbee" => Some(Protocol::Zigbee {
                node_type: "Router".to_string(),
            }),
            "sigfox" => Some(Protocol::Sigfox),
            "rfid" => Some(Protocol::Rfid {
                frequency_type: "HF".to_string(),
            }),
            _ => None,
        }
    }
}

/// Mutable link-condition state, drifted on every collection.
#[derive(Debug)]
struct LinkState {
    rssi_dbm: i32,
    battery_level: f64,
}

/// A simulated sensor for one transport family.
pub struct SimSensor {
    serial_number: String,
    protocol: Protocol,
    location: String,
    detection_probability: f64,
    total_detections: AtomicU64,
    active: AtomicBool,
    link: Mutex<LinkState>,
}

impl SimSensor {
    pub fn new(
        protocol: Protocol,
        location: impl Into<String>,
        detection_probability: f64,
    ) -> Self {
        let serial_number = Self::generate_serial(&protocol);
        Self::with_serial(serial_number, protocol, location, detection_probability)
    }

    pub fn with_serial(
        serial_number: impl Into<String>,
        protocol: Protocol,
        location: impl Into<String>,
        detection_probability: f64,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            protocol,
            location: location.into(),
            detection_probability: detection_probability.clamp(0.0, 1.0),
            total_detections: AtomicU64::new(0),
            active: AtomicBool::new(false),
            link: Mutex::new(LinkState {
                rssi_dbm: -60,
                battery_level: 100.0,
            }),
        }
    }

    /// Builds a simulator from its config table entry.
    pub fn from_spec(spec: &SensorSpec) -> Option<Self> {
        let protocol = Protocol::from_spec(&spec.protocol)?;
        let sensor = if spec.serial_number.is_empty() {
            Self::new(protocol, &spec.location, spec.detection_probability)
        } else {
            Self::with_serial(
                &spec.serial_number,
                protocol,
                &spec.location,
                spec.detection_probability,
            )
        };
        Some(sensor)
    }

    fn generate_serial(protocol: &Protocol) -> String {
        let prefix: String = protocol.name().to_uppercase().chars().take(4).collect();
        let unique = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", prefix, &unique[..8].to_uppercase())
    }

    fn protocol_metadata(&self, activity: u8) -> ProtocolMetadata {
        let mut rng = rand::thread_rng();
        let (rssi, battery) = {
            let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
            link.rssi_dbm = (link.rssi_dbm + rng.gen_range(-5..=5)).clamp(-120, -30);
            if activity == 1 {
                link.battery_level = (link.battery_level - 0.01).max(0.0);
            }
            (link.rssi_dbm, link.battery_level)
        };

        let value = match &self.protocol {
            Protocol::LoRa { spreading_factor } => json!({
                "frequency_mhz": 915.0,
                "spreading_factor": spreading_factor,
                "bandwidth_khz": 125,
                "rssi_dbm": rssi,
                "snr_db": (rng.gen_range(5.0..15.0_f64) * 100.0).round() / 100.0,
                "battery_level": (battery * 10.0).round() / 10.0,
            }),
            Protocol::Zigbee { node_type } => json!({
                "channel": 15,
                "node_type": node_type,
                "link_quality": rng.gen_range(120..=255),
                "rssi_dbm": rssi,
                "battery_level": (battery * 10.0).round() / 10.0,
            }),
            Protocol::Sigfox => json!({
                "rssi_dbm": rssi,
                "device_class": "0U",
                "messages_today": rng.gen_range(0..140),
                "battery_level": (battery * 10.0).round() / 10.0,
            }),
            Protocol::Rfid { frequency_type } => json!({
                "frequency_type": frequency_type,
                "read_range_m": 0.1,
                "tag_id": if activity == 1 {
                    Value::String(format!("TAG-{:08X}", rng.gen_range(0..u32::MAX)))
                } else {
                    Value::Null
                },
            }),
        };

        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

#[async_trait]
impl SensorSource for SimSensor {
    fn serial_number(&self) -> &str {
        &self.serial_number
    }

    fn protocol(&self) -> &str {
        self.protocol.name()
    }

    fn location(&self) -> &str {
        &self.location
    }

    async fn collect(&self) -> Result<Reading, SensorError> {
        let activity = if rand::thread_rng().gen_bool(self.detection_probability) {
            1
        } else {
            0
        };
        self.active.store(activity == 1, Ordering::Release);
        if activity == 1 {
            self.total_detections.fetch_add(1, Ordering::AcqRel);
        }

        Ok(Reading {
            serial_number: self.serial_number.clone(),
            protocol: self.protocol.name().to_string(),
            location: self.location.clone(),
            activity,
            timestamp: OffsetDateTime::now_utc(),
            total_detections: self.total_detections.load(Ordering::Acquire),
            protocol_metadata: self.protocol_metadata(activity),
        })
    }

    fn total_detections(&self) -> u64 {
        self.total_detections.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readings_carry_the_sensor_identity() {
        let sensor = SimSensor::with_serial(
            "LORA-TEST01",
            Protocol::LoRa {
                spreading_factor: 7,
            },
            "Main entrance",
            0.5,
        );

        let reading = sensor.collect().await.expect("collect");
        assert_eq!(reading.serial_number, "LORA-TEST01");
        assert_eq!(reading.protocol, "LoRa");
        assert_eq!(reading.location, "Main entrance");
        assert!(reading.activity == 0 || reading.activity == 1);
    }

    #[tokio::test]
    async fn detections_only_count_active_readings() {
        let always = SimSensor::new(Protocol::Sigfox, "South gate", 1.0);
        let never = SimSensor::new(Protocol::Sigfox, "South gate", 0.0);

        for _ in 0..5 {
            always.collect().await.expect("collect");
            never.collect().await.expect("collect");
        }

        assert_eq!(always.total_detections(), 5);
        assert!(always.is_active());
        assert_eq!(never.total_detections(), 0);
        assert!(!never.is_active());
    }

    #[tokio::test]
    async fn metadata_matches_the_protocol() {
        let lora = SimSensor::new(
            Protocol::LoRa {
                spreading_factor: 9,
            },
            "gate",
            0.0,
        );
        let reading = lora.collect().await.expect("collect");
        assert!(reading.protocol_metadata.contains_key("spreading_factor"));
        assert!(reading.protocol_metadata.contains_key("rssi_dbm"));

        let zigbee = SimSensor::new(
            Protocol::Zigbee {
                node_type: "Router".to_string(),
            },
            "gate",
            0.0,
        );
        let reading = zigbee.collect().await.expect("collect");
        assert!(reading.protocol_metadata.contains_key("link_quality"));
    }

    #[test]
    fn generated_serials_use_the_protocol_prefix() {
        let sensor = SimSensor::new(Protocol::Sigfox, "gate", 0.3);
        assert!(sensor.serial_number().starts_with("SIGF-"));
    }

    #[test]
    fn spec_parsing_covers_all_protocols_and_rejects_unknown() {
        for name in ["lora", "zigbee", "sigfox", "rfid", "LoRa"] {
            assert!(Protocol::from_spec(name).is_some(), "{name} should parse");
        }
        assert!(Protocol::from_spec("bluetooth").is_none());
    }

    #[test]
    fn spec_with_explicit_serial_is_kept() {
        let spec = SensorSpec {
            protocol: "rfid".to_string(),
            location: "Turnstile 1".to_string(),
            serial_number: "RFID-FIXED".to_string(),
            detection_probability: 0.2,
        };
        let sensor = SimSensor::from_spec(&spec).expect("valid spec");
        assert_eq!(sensor.serial_number(), "RFID-FIXED");
        assert_eq!(sensor.protocol(), "RFID");
    }
}
