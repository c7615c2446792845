//! Broker connection configuration.
//!
//! Deserializes from TOML (or any serde format) and validates with the
//! `validator` crate so that malformed settings fail at load time, not at
//! connect time. All fields have defaults suitable for a local Mosquitto.

use std::time::Duration;

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::backoff::Backoff;

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// Broker port (1883 for plain TCP, 8883 for TLS-terminated brokers).
    #[validate(range(min = 1, message = "Port must not be zero"))]
    pub port: u16,

    /// Keep-alive interval in seconds. The client pings the broker at this
    /// interval when idle; the broker drops the connection if it hears
    /// nothing for 1.5x this long.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Optional broker username. Credentials are only sent when both
    /// username and password are set.
    pub username: Option<String>,

    /// Optional broker password.
    pub password: Option<String>,

    /// Client identifier. Empty string means a UUID is generated when the
    /// client is built, which avoids client-id collisions between the
    /// gateway and subscriber sides.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Whether to request a clean session from the broker.
    pub clean_session: bool,

    /// How long a single connection attempt waits for CONNACK, in seconds.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Quality of service for all publishes and subscriptions issued by
    /// this client: 0 = at most once, 1 = at least once, 2 = exactly once.
    /// Governs broker-to-subscriber delivery only.
    #[validate(range(min = 0, max = 2, message = "QoS must be 0, 1 or 2"))]
    pub qos: u8,

    /// Capacity of the client's internal request channel (pending
    /// publishes/subscribes before back-pressure).
    #[validate(range(
        min = 1,
        max = 1024,
        message = "Request channel capacity must be between 1 and 1024"
    ))]
    pub request_channel_capacity: usize,

    /// Number of connection attempts made by `connect()` before giving up.
    #[validate(range(
        min = 1,
        max = 100,
        message = "Connect retry attempts must be between 1 and 100"
    ))]
    pub connect_retry_attempts: u32,

    /// Delay between failed `connect()` attempts, in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect retry delay must be between 1 and 60 seconds"
    ))]
    pub connect_retry_delay: u64,

    /// Initial delay of the reconnect backoff applied after an established
    /// connection is lost, in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Hard cap on reconnect attempts after a lost connection.
    /// 0 means the limit is derived from the backoff schedule.
    #[validate(range(max = 1000, message = "Max reconnect attempts must not exceed 1000"))]
    pub max_reconnect_attempts: u32,

    /// Multiplier applied to the reconnect delay after each failed attempt.
    #[validate(range(
        min = 1.01,
        max = 30.0,
        message = "Reconnect backoff multiplier must be between 1.01 and 30"
    ))]
    pub reconnect_backoff_multiplier: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: 60,
            username: None,
            password: None,
            client_id: String::new(),
            clean_session: true,
            connection_timeout: 10,
            qos: 1,
            request_channel_capacity: 10,
            connect_retry_attempts: 3,
            connect_retry_delay: 5,
            reconnect_delay: 1,
            max_reconnect_attempts: 0,
            reconnect_backoff_multiplier: 1.5,
        }
    }
}

impl Config {
    /// Maps the configured QoS number onto the rumqttc enum.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }

    /// Returns a copy of this config with a different client id. Used by
    /// the subscriber side so both clients can share one `[broker]` table.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Duration of a single CONNACK wait.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Delay between failed `connect()` attempts.
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay)
    }

    /// Builds the reconnect backoff for the connection kernel.
    pub(crate) fn reconnect_backoff(&self) -> Backoff {
        let mut backoff = Backoff::new(
            Duration::from_secs(self.reconnect_delay),
            Duration::from_secs(60),
            self.reconnect_backoff_multiplier,
        );
        if self.max_reconnect_attempts > 0 {
            backoff.set_max_attempts(self.max_reconnect_attempts);
        }
        backoff
    }
}
